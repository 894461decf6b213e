//! Canonical JUnit serialization of the normalized tree
//!
//! Round-trip law: parsing the output of [`to_junit_xml`] yields a tree with
//! identical totals (tests, failures, errors, skipped).

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::types::{Case, CaseStatus, Suite, TestSuites};

/// Serialize the normalized tree to canonical JUnit XML
pub fn to_junit_xml(tree: &TestSuites) -> String {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("in-memory write cannot fail");

    let mut root = BytesStart::new("testsuites");
    if let Some(name) = &tree.name {
        root.push_attribute(("name", name.as_str()));
    }
    push_totals(&mut root, tree);
    writer.write_event(Event::Start(root)).expect("write");

    for suite in &tree.suites {
        write_suite(&mut writer, suite);
    }

    writer
        .write_event(Event::End(BytesEnd::new("testsuites")))
        .expect("write");

    String::from_utf8(writer.into_inner()).expect("writer produces UTF-8")
}

fn push_totals(element: &mut BytesStart<'_>, tree: &TestSuites) {
    element.push_attribute(("tests", tree.totals.tests.to_string().as_str()));
    element.push_attribute(("failures", tree.totals.failures.to_string().as_str()));
    element.push_attribute(("errors", tree.totals.errors.to_string().as_str()));
    element.push_attribute(("skipped", tree.totals.skipped.to_string().as_str()));
}

fn write_suite(writer: &mut Writer<Vec<u8>>, suite: &Suite) {
    let mut start = BytesStart::new("testsuite");
    start.push_attribute(("name", suite.name.as_str()));
    start.push_attribute(("tests", suite.totals.tests.to_string().as_str()));
    start.push_attribute(("failures", suite.totals.failures.to_string().as_str()));
    start.push_attribute(("errors", suite.totals.errors.to_string().as_str()));
    start.push_attribute(("skipped", suite.totals.skipped.to_string().as_str()));
    if let Some(ts) = suite.timestamp {
        start.push_attribute(("timestamp", ts.to_rfc3339().as_str()));
    }
    writer.write_event(Event::Start(start)).expect("write");

    for case in &suite.cases {
        write_case(writer, case);
    }

    writer
        .write_event(Event::End(BytesEnd::new("testsuite")))
        .expect("write");
}

fn write_case(writer: &mut Writer<Vec<u8>>, case: &Case) {
    let mut start = BytesStart::new("testcase");
    if let Some(class_name) = &case.class_name {
        start.push_attribute(("classname", class_name.as_str()));
    }
    start.push_attribute(("name", case.name.as_str()));
    if let Some(time) = case.time_seconds {
        start.push_attribute(("time", format!("{:.3}", time).as_str()));
    }
    if let Some(file) = &case.file {
        start.push_attribute(("file", file.as_str()));
    }

    if case.status == CaseStatus::Passed
        && case.system_out.is_none()
        && case.system_err.is_none()
    {
        writer.write_event(Event::Empty(start)).expect("write");
        return;
    }

    writer.write_event(Event::Start(start)).expect("write");

    match case.status {
        CaseStatus::Failed => write_verdict(writer, "failure", case),
        CaseStatus::Error => write_verdict(writer, "error", case),
        CaseStatus::Skipped => write_verdict(writer, "skipped", case),
        CaseStatus::Passed => {}
    }

    if let Some(out) = &case.system_out {
        write_text_element(writer, "system-out", out);
    }
    if let Some(err) = &case.system_err {
        write_text_element(writer, "system-err", err);
    }

    writer
        .write_event(Event::End(BytesEnd::new("testcase")))
        .expect("write");
}

fn write_verdict(writer: &mut Writer<Vec<u8>>, tag: &str, case: &Case) {
    let mut start = BytesStart::new(tag);
    if let Some(message) = &case.message {
        start.push_attribute(("message", message.as_str()));
    }
    match &case.stack_text {
        Some(stack) => {
            writer.write_event(Event::Start(start)).expect("write");
            writer
                .write_event(Event::Text(BytesText::new(stack)))
                .expect("write");
            writer
                .write_event(Event::End(BytesEnd::new(tag)))
                .expect("write");
        }
        None => {
            writer.write_event(Event::Empty(start)).expect("write");
        }
    }
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("write");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("write");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("write");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;
    use crate::types::{Dialect, Totals};

    fn sample_tree() -> TestSuites {
        let mut suite = Suite {
            name: "com.acme.WidgetTest".to_string(),
            totals: Totals::default(),
            timestamp: None,
            cases: Vec::new(),
        };
        let cases = [
            (CaseStatus::Passed, None),
            (CaseStatus::Failed, Some("expected blue")),
            (CaseStatus::Error, Some("io refused")),
            (CaseStatus::Skipped, Some("quarantined")),
        ];
        for (i, (status, message)) in cases.into_iter().enumerate() {
            suite.totals.absorb(status);
            suite.cases.push(Case {
                suite: suite.name.clone(),
                class_name: Some(suite.name.clone()),
                name: format!("case_{}", i),
                status,
                time_seconds: Some(0.1),
                message: message.map(str::to_string),
                stack_text: matches!(status, CaseStatus::Failed | CaseStatus::Error)
                    .then(|| "at com.acme.WidgetTest".to_string()),
                system_out: None,
                system_err: None,
                file: None,
            });
        }
        let mut tree = TestSuites {
            name: Some("nightly".to_string()),
            totals: Totals::default(),
            suites: vec![suite],
        };
        tree.totals = tree.suites[0].totals;
        tree
    }

    #[test]
    fn test_roundtrip_preserves_totals() {
        let original = sample_tree();
        let xml = to_junit_xml(&original);
        let reparsed = parse_str(&xml, Some(Dialect::Generic)).unwrap();

        assert_eq!(reparsed.totals, original.totals);
        assert_eq!(reparsed.suites.len(), original.suites.len());
        assert_eq!(reparsed.suites[0].totals, original.suites[0].totals);
    }

    #[test]
    fn test_roundtrip_preserves_statuses_and_messages() {
        let original = sample_tree();
        let xml = to_junit_xml(&original);
        let reparsed = parse_str(&xml, Some(Dialect::Generic)).unwrap();

        for (a, b) in original.suites[0]
            .cases
            .iter()
            .zip(reparsed.suites[0].cases.iter())
        {
            assert_eq!(a.status, b.status, "status drifted for {}", a.name);
            assert_eq!(a.message, b.message, "message drifted for {}", a.name);
        }
    }

    #[test]
    fn test_writer_emits_declaration() {
        let xml = to_junit_xml(&sample_tree());
        assert!(xml.starts_with("<?xml version=\"1.0\""));
    }
}
