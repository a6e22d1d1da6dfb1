//! Workload scripts.
//!
//! A script holds one operation per line. Blank lines are skipped and `#`
//! starts a comment that runs to the end of the line.
//!
//! ```text
//! a <id> <size>   allocate <size> bytes and remember the block as <id>
//! r <id> <size>   resize block <id> to <size> bytes
//! f <id>          release block <id>
//! ```

use std::{
    fs, io,
    num::ParseIntError,
    path::{Path, PathBuf},
    str::FromStr,
};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

/// One operation of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Allocate { id: usize, size: usize },
    Resize { id: usize, size: usize },
    Release { id: usize },
}

/// An operation with the line it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ParseOpError {
    #[snafu(display("unknown operation `{op}`"))]
    UnknownOp { op: String },
    #[snafu(display("missing {field}"))]
    MissingField { field: &'static str },
    #[snafu(display("invalid {field} `{value}`"))]
    InvalidNumber {
        field: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[snafu(display("allocation size must be nonzero"))]
    ZeroSize,
    #[snafu(display("unexpected trailing field `{value}`"))]
    TrailingField { value: String },
}

#[derive(Debug, Snafu)]
pub enum ScriptError {
    #[snafu(display("failed to read script, path={}", path.display()))]
    Read {
        #[snafu(implicit)]
        location: snafu::Location,
        path: PathBuf,
        #[snafu(source)]
        source: io::Error,
    },
    #[snafu(display("invalid operation at line {line}"))]
    Parse {
        #[snafu(implicit)]
        location: snafu::Location,
        line: usize,
        #[snafu(source)]
        source: ParseOpError,
    },
}

fn number(field: &'static str, value: Option<&str>) -> Result<usize, ParseOpError> {
    let value = value.context(MissingFieldSnafu { field })?;
    value.parse().context(InvalidNumberSnafu { field, value })
}

impl FromStr for Op {
    type Err = ParseOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let op = fields.next().context(MissingFieldSnafu { field: "operation" })?;
        let id = number("id", fields.next())?;
        let op = match op {
            "a" => {
                let size = number("size", fields.next())?;
                ensure!(size > 0, ZeroSizeSnafu);
                Self::Allocate { id, size }
            }
            "r" => Self::Resize {
                id,
                size: number("size", fields.next())?,
            },
            "f" => Self::Release { id },
            _ => return UnknownOpSnafu { op }.fail(),
        };
        if let Some(value) = fields.next() {
            return TrailingFieldSnafu { value }.fail();
        }
        Ok(op)
    }
}

/// Parses the text of a script.
pub fn parse(text: &str) -> Result<Vec<Step>, ScriptError> {
    let mut steps = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split_once('#').map_or(raw, |(content, _)| content);
        if content.trim().is_empty() {
            continue;
        }
        let op = content.parse().context(ParseSnafu { line })?;
        steps.push(Step { line, op });
    }
    Ok(steps)
}

/// Reads and parses the script at `path`.
pub fn load(path: &Path) -> Result<Vec<Step>, ScriptError> {
    let text = fs::read_to_string(path).context(ReadSnafu { path })?;
    parse(&text)
}
