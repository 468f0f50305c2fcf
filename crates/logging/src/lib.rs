#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `logging` gates the directory catalog tool's user-facing messages by the
//! repeated `-v` flag. Three message classes exist:
//!
//! - [`Logger::action`]: always printed (plan summaries, fatal errors).
//! - [`Logger::summary`]: printed at verbosity ≥ 1 (file counts, new-file
//!   counts, moved/removed advisories).
//! - [`Logger::trace`]: printed at verbosity ≥ 2 (per-file "hashing X" /
//!   "looking for X in db Y" lines).
//!
//! # Design
//!
//! Output is abstracted behind the [`Sink`] trait rather than hard-coded to
//! `stdout`, so tests can assert on an in-memory [`VecSink`] instead of
//! capturing real process output.

/// How many times `-v` was repeated on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Builds a verbosity level from a raw `-v` repeat count.
    #[must_use]
    pub fn new(level: u8) -> Self {
        Self(level)
    }

    /// The raw level (0 = silent-except-actions, 1 = summary, 2 = trace).
    #[must_use]
    pub fn level(self) -> u8 {
        self.0
    }

    /// Whether this verbosity is at least `level`.
    #[must_use]
    pub fn at_least(self, level: u8) -> bool {
        self.0 >= level
    }
}

impl From<u8> for Verbosity {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

/// An output destination for log lines.
pub trait Sink {
    /// Writes one line of text, without a trailing newline.
    fn write_line(&mut self, line: &str);
}

/// A [`Sink`] that writes to process `stdout`.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn write_line(&mut self, line: &str) {
        println!("{line}");
    }
}

/// A [`Sink`] that writes to process `stderr`, used for fatal error reporting.
#[derive(Debug, Default)]
pub struct StderrSink;

impl Sink for StderrSink {
    fn write_line(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// An in-memory [`Sink`] that records every line it receives, for tests.
#[derive(Debug, Default)]
pub struct VecSink(pub Vec<String>);

impl VecSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }
}

impl Sink for VecSink {
    fn write_line(&mut self, line: &str) {
        self.0.push(line.to_owned());
    }
}

/// A verbosity-gated writer over a [`Sink`].
pub struct Logger<S: Sink> {
    verbosity: Verbosity,
    sink: S,
}

impl<S: Sink> Logger<S> {
    /// Builds a logger at the given verbosity, writing to `sink`.
    pub fn new(verbosity: Verbosity, sink: S) -> Self {
        Self { verbosity, sink }
    }

    /// This logger's configured verbosity.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Writes `line` unconditionally.
    pub fn action(&mut self, line: impl AsRef<str>) {
        self.sink.write_line(line.as_ref());
    }

    /// Writes `line` when verbosity is 1 or higher.
    pub fn summary(&mut self, line: impl AsRef<str>) {
        if self.verbosity.at_least(1) {
            self.sink.write_line(line.as_ref());
        }
    }

    /// Writes `line` when verbosity is 2 or higher.
    pub fn trace(&mut self, line: impl AsRef<str>) {
        if self.verbosity.at_least(2) {
            self.sink.write_line(line.as_ref());
        }
    }

    /// Consumes the logger, returning the underlying sink (tests inspect
    /// the collected lines of a [`VecSink`] this way).
    pub fn into_sink(self) -> S {
        self.sink
    }
}
