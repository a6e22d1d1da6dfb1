//! Replays allocation scripts against a segment heap and checks every result.

use std::{
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use log::LevelFilter;
use snafu::{ResultExt as _, Snafu};

use self::{
    replay::{ReplayError, Replayer, Summary},
    script::ScriptError,
};

mod replay;
mod script;

const DEFAULT_SEGMENT_SIZE: usize = 1 << 20;

/// Replay allocation scripts against a segment heap.
#[derive(Debug, FromArgs)]
struct Args {
    /// size of the backing segment in bytes
    #[argh(option, short = 's', default = "DEFAULT_SEGMENT_SIZE")]
    segment_size: usize,
    /// skip the heap consistency check between operations
    #[argh(switch, short = 'n')]
    no_validate: bool,
    /// print the heap blocks after each script
    #[argh(switch, short = 'd')]
    dump: bool,
    /// only report failures
    #[argh(switch, short = 'q')]
    quiet: bool,
    /// enable trace logging
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// script files to replay
    #[argh(positional)]
    scripts: Vec<PathBuf>,
}

#[derive(Debug, Snafu)]
enum HarnessError {
    #[snafu(display("failed to load script, path={}", path.display()))]
    Load {
        #[snafu(implicit)]
        location: snafu::Location,
        path: PathBuf,
        #[snafu(source)]
        source: ScriptError,
    },
    #[snafu(display("failed to replay script, path={}", path.display()))]
    Replay {
        #[snafu(implicit)]
        location: snafu::Location,
        path: PathBuf,
        #[snafu(source)]
        source: ReplayError,
    },
}

fn main() {
    let args: Args = argh::from_env();

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(LevelFilter::Warn.as_str()),
    );
    if args.verbose {
        logger.filter_level(LevelFilter::Trace);
    }
    logger.init();

    let mut failed = false;
    for path in &args.scripts {
        match run_script(&args, path) {
            Ok(summary) => {
                if !args.quiet {
                    print_summary(path, &summary);
                }
            }
            Err(err) => {
                let report = snafu::Report::from_error(err);
                eprintln!("{report}");
                failed = true;
            }
        }
    }

    if failed {
        process::exit(1);
    }
}

fn run_script(args: &Args, path: &Path) -> Result<Summary, HarnessError> {
    let steps = script::load(path).context(LoadSnafu { path })?;
    let mut replayer =
        Replayer::new(args.segment_size, !args.no_validate).context(ReplaySnafu { path })?;
    let result = replayer.run(&steps);
    if args.dump {
        println!("{}", replayer.heap().dump());
    }
    result.context(ReplaySnafu { path })
}

fn print_summary(path: &Path, summary: &Summary) {
    println!(
        "{}: {} operations, peak payload {} bytes, committed {} bytes, utilization {:.1}%",
        path.display(),
        summary.ops,
        summary.peak_payload,
        summary.committed,
        summary.utilization() * 100.0
    );
}
