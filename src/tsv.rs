//! Line-oriented ingestion of `key<TAB>value` records.

use std::io::BufRead;

use tracing::{info, warn};

use crate::{MassIndexError, Result};

/// Lines read before the error ratio is enforced.
const MIN_LINES_FOR_RATIO: u64 = 100;
const WARN_EVERY: u64 = 1000;

/// Iterator over `(key, value)` records of a tab separated input.
///
/// Each line is split at the first separator byte; further separators stay
/// in the value. Trailing `\n` and `\r\n` are stripped. Lines without a
/// separator (including empty lines) are skipped and counted. Keys and values
/// are raw bytes and need not be UTF-8.
///
/// ```
/// use massindex::TsvEntries;
///
/// let input = &b"k1\tv1\nbroken\nk2\tv\t2\r\n"[..];
/// let mut entries = TsvEntries::new(input);
/// let records: Vec<_> = entries.by_ref().collect::<Result<_, _>>().unwrap();
/// assert_eq!(records[1], (b"k2".to_vec(), b"v\t2".to_vec()));
/// assert_eq!(entries.skipped_lines(), 1);
/// ```
#[derive(Debug)]
pub struct TsvEntries<R: BufRead> {
    input: R,
    separator: u8,
    max_error_ratio: Option<f64>,
    line: Vec<u8>,
    total_lines: u64,
    skipped_lines: u64,
    done: bool,
}

impl<R: BufRead> TsvEntries<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            separator: b'\t',
            max_error_ratio: None,
            line: Vec::new(),
            total_lines: 0,
            skipped_lines: 0,
            done: false,
        }
    }

    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    /// Aborts with [`MassIndexError::InvalidInput`] once more than 100 lines
    /// have been read and the share of skipped lines exceeds `ratio`.
    pub fn with_max_error_ratio(mut self, ratio: f64) -> Self {
        self.max_error_ratio = Some(ratio);
        self
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    fn skip(&mut self) -> Result<()> {
        self.skipped_lines += 1;
        if self.skipped_lines % WARN_EVERY == 0 {
            warn!(
                skipped = self.skipped_lines,
                lines = self.total_lines,
                "skipping lines without separator"
            );
        }
        match self.max_error_ratio {
            Some(ratio)
                if self.total_lines > MIN_LINES_FOR_RATIO
                    && self.skipped_lines as f64 / self.total_lines as f64 > ratio =>
            {
                Err(MassIndexError::InvalidInput(format!(
                    "{} of {} lines are malformed, exceeds error ratio {}",
                    self.skipped_lines, self.total_lines, ratio
                )))
            }
            _ => Ok(()),
        }
    }
}

impl<R: BufRead> Iterator for TsvEntries<R> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.input.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    info!(
                        lines = self.total_lines,
                        skipped = self.skipped_lines,
                        "finished reading input"
                    );
                }
                Ok(_) => {
                    self.total_lines += 1;
                    let mut line = self.line.as_slice();
                    if let Some(rest) = line.strip_suffix(b"\n") {
                        line = rest.strip_suffix(b"\r").unwrap_or(rest);
                    }
                    match line.iter().position(|&b| b == self.separator) {
                        Some(at) => {
                            return Some(Ok((line[..at].to_vec(), line[at + 1..].to_vec())));
                        }
                        None => {
                            if let Err(e) = self.skip() {
                                self.done = true;
                                return Some(Err(e));
                            }
                        }
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}
