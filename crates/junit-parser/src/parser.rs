//! SAX-style report parsing
//!
//! The reader is pulled event by event; memory use is bounded by the
//! largest single element, not the file size. Unknown elements are ignored
//! wholesale so producer-specific extensions do not break ingestion.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;

use crate::types::{Case, CaseStatus, Dialect, Suite, TestSuites, Totals};
use crate::{ParseError, ParseResult};

/// Which text-bearing child of a testcase is currently open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextBlock {
    Failure,
    Error,
    Skipped,
    SystemOut,
    SystemErr,
}

/// Parse a report from any buffered reader.
///
/// `expected` short-circuits dialect detection; `max_bytes` caps how much
/// input will be consumed before the parse fails with
/// [`ParseError::SizeExceeded`].
pub fn parse_reader<R: BufRead>(
    reader: R,
    expected: Option<Dialect>,
    max_bytes: u64,
) -> ParseResult<TestSuites> {
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut root = TestSuites::default();
    let mut suite_stack: Vec<Suite> = Vec::new();
    let mut current_case: Option<Case> = None;
    let mut open_block: Option<TextBlock> = None;
    let mut dialect = expected;

    loop {
        if xml.buffer_position() > max_bytes {
            return Err(ParseError::SizeExceeded { limit: max_bytes });
        }

        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"testsuites" => {
                    root.name = attr(&e, b"name")?;
                    if dialect.is_none() {
                        dialect = Some(Dialect::detect(root.name.as_deref()));
                    }
                }
                b"testsuite" => {
                    let name = attr(&e, b"name")?.unwrap_or_else(|| "(unnamed)".to_string());
                    if dialect.is_none() {
                        dialect = Some(Dialect::detect(Some(&name)));
                    }
                    suite_stack.push(Suite {
                        name,
                        totals: Totals::default(),
                        timestamp: attr(&e, b"timestamp")?.and_then(|t| parse_timestamp(&t)),
                        cases: Vec::new(),
                    });
                }
                b"testcase" => {
                    current_case = Some(open_case(
                        &e,
                        &mut suite_stack,
                        dialect.unwrap_or(Dialect::Generic),
                    )?);
                }
                b"failure" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Failed, &e)?;
                    open_block = Some(TextBlock::Failure);
                }
                b"error" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Error, &e)?;
                    open_block = Some(TextBlock::Error);
                }
                b"skipped" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Skipped, &e)?;
                    open_block = Some(TextBlock::Skipped);
                }
                b"system-out" if current_case.is_some() => {
                    open_block = Some(TextBlock::SystemOut);
                }
                b"system-err" if current_case.is_some() => {
                    open_block = Some(TextBlock::SystemErr);
                }
                // Unknown element: tolerated, contents ignored
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"testcase" => {
                    let case = open_case(
                        &e,
                        &mut suite_stack,
                        dialect.unwrap_or(Dialect::Generic),
                    )?;
                    close_case(case, &mut suite_stack);
                }
                b"failure" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Failed, &e)?;
                }
                b"error" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Error, &e)?;
                }
                b"skipped" if current_case.is_some() => {
                    mark_case(current_case.as_mut(), CaseStatus::Skipped, &e)?;
                }
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(block), Some(case)) = (open_block, current_case.as_mut()) {
                    let text = t.unescape()?.into_owned();
                    match block {
                        TextBlock::Failure | TextBlock::Error => {
                            append_text(&mut case.stack_text, &text);
                        }
                        TextBlock::Skipped => {
                            if case.message.is_none() && !text.is_empty() {
                                case.message = Some(text);
                            }
                        }
                        TextBlock::SystemOut => append_text(&mut case.system_out, &text),
                        TextBlock::SystemErr => append_text(&mut case.system_err, &text),
                    }
                }
            }
            Event::CData(t) => {
                if let (Some(block), Some(case)) = (open_block, current_case.as_mut()) {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    match block {
                        TextBlock::Failure | TextBlock::Error => {
                            append_text(&mut case.stack_text, &text);
                        }
                        TextBlock::Skipped => {}
                        TextBlock::SystemOut => append_text(&mut case.system_out, &text),
                        TextBlock::SystemErr => append_text(&mut case.system_err, &text),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"testcase" => {
                    if let Some(case) = current_case.take() {
                        close_case(case, &mut suite_stack);
                    }
                }
                b"testsuite" => {
                    if let Some(suite) = suite_stack.pop() {
                        // pytest nests suites; the normalized tree is flat,
                        // so wrapper suites without cases are elided
                        if !suite.cases.is_empty() {
                            root.totals.add(&suite.totals);
                            root.suites.push(suite);
                        }
                    }
                }
                b"failure" | b"error" | b"skipped" | b"system-out" | b"system-err" => {
                    open_block = None;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // A bare <testsuite> root never passes through a testsuites close
    if let Some(suite) = suite_stack.pop() {
        if !suite.cases.is_empty() {
            root.totals.add(&suite.totals);
            root.suites.push(suite);
        }
    }

    Ok(root)
}

/// Parse a report held in memory (tests and small single-file artifacts)
pub fn parse_str(input: &str, expected: Option<Dialect>) -> ParseResult<TestSuites> {
    parse_reader(input.as_bytes(), expected, u64::MAX)
}

fn open_case(
    e: &BytesStart<'_>,
    suite_stack: &mut Vec<Suite>,
    dialect: Dialect,
) -> ParseResult<Case> {
    // Tolerate a testcase outside any suite (seen in hand-rolled reports)
    if suite_stack.is_empty() {
        suite_stack.push(Suite {
            name: "(root)".to_string(),
            totals: Totals::default(),
            timestamp: None,
            cases: Vec::new(),
        });
    }
    let suite_name = suite_stack
        .last()
        .map(|s| s.name.clone())
        .expect("suite stack is non-empty");

    let class_name = attr(e, b"classname")?.filter(|c| !c.is_empty());
    // Gradle names each suite after the class and omits classname on cases
    let class_name = match (class_name, dialect) {
        (None, Dialect::Gradle) => Some(suite_name.clone()),
        (other, _) => other,
    };

    Ok(Case {
        suite: suite_name,
        class_name,
        name: attr(e, b"name")?.unwrap_or_else(|| "(unnamed)".to_string()),
        status: CaseStatus::Passed,
        time_seconds: attr(e, b"time")?.and_then(|t| t.parse().ok()),
        message: None,
        stack_text: None,
        system_out: None,
        system_err: None,
        file: attr(e, b"file")?,
    })
}

fn close_case(case: Case, suite_stack: &mut [Suite]) {
    if let Some(suite) = suite_stack.last_mut() {
        suite.totals.absorb(case.status);
        suite.cases.push(case);
    }
}

fn mark_case(
    case: Option<&mut Case>,
    status: CaseStatus,
    e: &BytesStart<'_>,
) -> ParseResult<()> {
    if let Some(case) = case {
        // An <error> outranks an earlier <failure>; a failure never
        // downgrades an error
        case.status = match (case.status, status) {
            (CaseStatus::Error, CaseStatus::Failed) => CaseStatus::Error,
            (_, next) => next,
        };
        if let Some(message) = attr(e, b"message")? {
            case.message = Some(message);
        }
    }
    Ok(())
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> ParseResult<Option<String>> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| ParseError::Attribute(err.to_string()))?;
        if attribute.key.local_name().as_ref() == key {
            let value = attribute
                .unescape_value()
                .map_err(|err| ParseError::Attribute(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn append_text(slot: &mut Option<String>, text: &str) {
    if text.is_empty() {
        return;
    }
    match slot {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(text);
        }
        None => *slot = Some(text.to_string()),
    }
}

fn parse_timestamp(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUREFIRE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="com.acme.WidgetTest" tests="3" failures="1" errors="0" skipped="1" timestamp="2024-03-01T10:15:30">
  <testcase classname="com.acme.WidgetTest" name="assembles" time="0.012"/>
  <testcase classname="com.acme.WidgetTest" name="paints" time="1.205">
    <failure message="expected blue but was red" type="AssertionError">at com.acme.WidgetTest.paints(WidgetTest.java:42)</failure>
  </testcase>
  <testcase classname="com.acme.WidgetTest" name="ships">
    <skipped message="flaky on CI"/>
  </testcase>
</testsuite>"#;

    const PYTEST_NESTED: &str = r#"<testsuites name="pytest">
  <testsuite name="pytest" tests="2">
    <testsuite name="tests.test_api" tests="2" timestamp="2024-03-01T10:15:30Z">
      <testcase classname="tests.test_api" name="test_get" time="0.1"/>
      <testcase classname="tests.test_api" name="test_post" time="0.2">
        <error message="ConnectionError: refused">Traceback (most recent call last)</error>
      </testcase>
    </testsuite>
  </testsuite>
</testsuites>"#;

    const JEST_FLAT: &str = r#"<testsuites name="jest tests" tests="2" failures="1">
  <testsuite name="cart.spec.ts" tests="2" failures="1">
    <testcase classname="" name="adds items" time="0.03"/>
    <testcase classname="" name="totals items" time="0.04">
      <failure>expect(received).toBe(expected)</failure>
    </testcase>
  </testsuite>
</testsuites>"#;

    const GRADLE_PER_CLASS: &str = r#"<testsuite name="com.acme.OrderTest" tests="1">
  <testcase name="placesOrder" time="0.5"/>
</testsuite>"#;

    #[test]
    fn test_surefire_statuses_and_totals() {
        let tree = parse_str(SUREFIRE, Some(Dialect::Surefire)).unwrap();
        assert_eq!(tree.suites.len(), 1);
        let suite = &tree.suites[0];
        assert_eq!(suite.name, "com.acme.WidgetTest");
        assert!(suite.timestamp.is_some());
        assert_eq!(suite.totals.tests, 3);
        assert_eq!(suite.totals.failures, 1);
        assert_eq!(suite.totals.skipped, 1);

        let statuses: Vec<CaseStatus> = suite.cases.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![CaseStatus::Passed, CaseStatus::Failed, CaseStatus::Skipped]
        );

        let failed = &suite.cases[1];
        assert_eq!(failed.message.as_deref(), Some("expected blue but was red"));
        assert!(failed.stack_text.as_deref().unwrap().contains("WidgetTest.java"));
        assert_eq!(failed.time_seconds, Some(1.205));
    }

    #[test]
    fn test_pytest_nesting_flattens_wrappers() {
        let tree = parse_str(PYTEST_NESTED, None).unwrap();
        // the wrapper "pytest" suite has no direct cases and is elided
        assert_eq!(tree.suites.len(), 1);
        assert_eq!(tree.suites[0].name, "tests.test_api");
        assert_eq!(tree.totals.tests, 2);
        assert_eq!(tree.totals.errors, 1);
        assert_eq!(tree.suites[0].cases[1].status, CaseStatus::Error);
    }

    #[test]
    fn test_jest_empty_classname_becomes_none() {
        let tree = parse_str(JEST_FLAT, None).unwrap();
        assert_eq!(tree.suites[0].cases[0].class_name, None);
        assert_eq!(tree.totals.failures, 1);
    }

    #[test]
    fn test_gradle_inherits_suite_as_classname() {
        let tree = parse_str(GRADLE_PER_CLASS, Some(Dialect::Gradle)).unwrap();
        assert_eq!(
            tree.suites[0].cases[0].class_name.as_deref(),
            Some("com.acme.OrderTest")
        );
    }

    #[test]
    fn test_unknown_elements_tolerated() {
        let input = r#"<testsuite name="s" tests="1">
  <properties><property name="java.version" value="21"/></properties>
  <testcase name="t"/>
</testsuite>"#;
        let tree = parse_str(input, None).unwrap();
        assert_eq!(tree.totals.tests, 1);
        assert_eq!(tree.suites[0].cases[0].status, CaseStatus::Passed);
    }

    #[test]
    fn test_malformed_xml_is_a_parse_error() {
        let result = parse_str("<testsuite><testcase name=", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_size_cap_enforced() {
        let result = parse_reader(SUREFIRE.as_bytes(), None, 64);
        assert!(matches!(result, Err(ParseError::SizeExceeded { limit: 64 })));
    }

    #[test]
    fn test_error_outranks_failure() {
        let input = r#"<testsuite name="s">
  <testcase name="t">
    <error message="boom"/>
    <failure message="assert"/>
  </testcase>
</testsuite>"#;
        let tree = parse_str(input, None).unwrap();
        assert_eq!(tree.suites[0].cases[0].status, CaseStatus::Error);
    }

    #[test]
    fn test_declared_totals_are_ignored_in_favor_of_recount() {
        // producer lied about counts; we recount from the cases
        let input = r#"<testsuite name="s" tests="99" failures="99">
  <testcase name="a"/>
  <testcase name="b"><failure/></testcase>
</testsuite>"#;
        let tree = parse_str(input, None).unwrap();
        assert_eq!(tree.totals.tests, 2);
        assert_eq!(tree.totals.failures, 1);
    }
}
