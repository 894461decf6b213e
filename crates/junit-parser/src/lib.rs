//! Streaming JUnit XML parser
//!
//! Consumes test-report XML SAX-style in constant memory and produces a
//! normalized suite tree. Tolerates the dialect quirks of the common
//! producers: Maven Surefire, Gradle (per-class suites), Jest (flat suites),
//! pytest (nested suites) and PHPUnit. Unknown elements are skipped rather
//! than rejected; malformed XML and oversized inputs fail.

pub mod parser;
pub mod types;
pub mod writer;

pub use parser::{parse_reader, parse_str};
pub use types::{Case, CaseStatus, Dialect, Suite, TestSuites, Totals};
pub use writer::to_junit_xml;

use thiserror::Error;

/// Parser error types
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed XML
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Attribute decoding failure
    #[error("Malformed attribute: {0}")]
    Attribute(String),

    /// Input exceeded the configured size cap
    #[error("Report exceeds size cap of {limit} bytes")]
    SizeExceeded { limit: u64 },

    /// Structurally invalid report (e.g. a testcase outside any suite)
    #[error("Invalid report structure: {0}")]
    Structure(String),

    /// Underlying reader failure
    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;
