//! Normalized test-report types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Report dialect hint
///
/// A closed set: the factory either honors the caller's expected format or
/// falls back to detection heuristics over the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Surefire,
    Gradle,
    Jest,
    Pytest,
    Phpunit,
    Generic,
}

impl Dialect {
    /// Guess the dialect from the root suite name when the caller gave no
    /// expected format. Producers stamp recognizable names: Jest emits
    /// "jest tests", pytest emits "pytest", PHPUnit nests a suite named
    /// after the phpunit.xml config.
    pub fn detect(root_name: Option<&str>) -> Self {
        match root_name {
            Some(name) => {
                let name = name.to_lowercase();
                if name.contains("jest") {
                    Dialect::Jest
                } else if name.contains("pytest") {
                    Dialect::Pytest
                } else if name.contains("phpunit") {
                    Dialect::Phpunit
                } else if name.contains("gradle") {
                    Dialect::Gradle
                } else {
                    Dialect::Generic
                }
            }
            None => Dialect::Generic,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dialect::Surefire => "surefire",
            Dialect::Gradle => "gradle",
            Dialect::Jest => "jest",
            Dialect::Pytest => "pytest",
            Dialect::Phpunit => "phpunit",
            Dialect::Generic => "generic",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Dialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "surefire" | "maven" => Ok(Dialect::Surefire),
            "gradle" => Ok(Dialect::Gradle),
            "jest" => Ok(Dialect::Jest),
            "pytest" => Ok(Dialect::Pytest),
            "phpunit" => Ok(Dialect::Phpunit),
            "generic" => Ok(Dialect::Generic),
            _ => anyhow::bail!("Invalid dialect: {}", s),
        }
    }
}

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::Skipped => "skipped",
            CaseStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Per-suite and per-report counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl Totals {
    pub fn absorb(&mut self, status: CaseStatus) {
        self.tests += 1;
        match status {
            CaseStatus::Failed => self.failures += 1,
            CaseStatus::Error => self.errors += 1,
            CaseStatus::Skipped => self.skipped += 1,
            CaseStatus::Passed => {}
        }
    }

    pub fn add(&mut self, other: &Totals) {
        self.tests += other.tests;
        self.failures += other.failures;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

/// One normalized test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    /// Owning suite name
    pub suite: String,
    pub class_name: Option<String>,
    pub name: String,
    pub status: CaseStatus,
    pub time_seconds: Option<f64>,
    /// Failure or error message, when present
    pub message: Option<String>,
    /// Stack trace / element body text
    pub stack_text: Option<String>,
    pub system_out: Option<String>,
    pub system_err: Option<String>,
    /// Source file, when the producer reports one
    pub file: Option<String>,
}

/// One normalized suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub name: String,
    pub totals: Totals,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub cases: Vec<Case>,
}

/// The normalized report tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSuites {
    pub name: Option<String>,
    pub totals: Totals,
    pub suites: Vec<Suite>,
}

impl TestSuites {
    /// Iterate every case across all suites
    pub fn cases(&self) -> impl Iterator<Item = &Case> {
        self.suites.iter().flat_map(|s| s.cases.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parse_and_display() {
        assert_eq!("surefire".parse::<Dialect>().unwrap(), Dialect::Surefire);
        assert_eq!("MAVEN".parse::<Dialect>().unwrap(), Dialect::Surefire);
        assert_eq!("pytest".parse::<Dialect>().unwrap(), Dialect::Pytest);
        assert!("mocha".parse::<Dialect>().is_err());
        assert_eq!(Dialect::Jest.to_string(), "jest");
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(Dialect::detect(Some("jest tests")), Dialect::Jest);
        assert_eq!(Dialect::detect(Some("pytest")), Dialect::Pytest);
        assert_eq!(Dialect::detect(Some("com.acme.AllTests")), Dialect::Generic);
        assert_eq!(Dialect::detect(None), Dialect::Generic);
    }

    #[test]
    fn test_totals_absorb() {
        let mut totals = Totals::default();
        totals.absorb(CaseStatus::Passed);
        totals.absorb(CaseStatus::Failed);
        totals.absorb(CaseStatus::Error);
        totals.absorb(CaseStatus::Skipped);
        assert_eq!(totals.tests, 4);
        assert_eq!(totals.failures, 1);
        assert_eq!(totals.errors, 1);
        assert_eq!(totals.skipped, 1);
    }
}
