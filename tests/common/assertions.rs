//! Custom test assertions for integration tests

use fanout_fetch::{Fault, RunReport};
use std::path::Path;

/// Read the persisted metrics file
pub fn read_metrics(path: &Path) -> serde_json::Value {
    let bytes = std::fs::read(path)
        .unwrap_or_else(|e| panic!("metrics file {} not readable: {e}", path.display()));
    serde_json::from_slice(&bytes).expect("metrics file is not valid JSON")
}

/// Assert that the failure tree of `report` names exactly `groups`, in order
pub fn assert_failed_groups(report: &RunReport, groups: &[&str]) -> Fault {
    let fault = report
        .final_fault
        .clone()
        .expect("run should have ended with a failure tree");

    let names: Vec<String> = fault.children().iter().map(Fault::message).collect();
    let expected: Vec<String> = groups
        .iter()
        .map(|group| format!("failed to load items for group: {group}"))
        .collect();
    assert_eq!(names, expected, "failed groups in failure tree");
    fault
}

/// Assert that a payload was written to `<root>/<group>/<leaf>` with `content`
pub fn assert_payload(root: &Path, group: &str, leaf: &str, content: &[u8]) {
    let path = root.join(group).join(leaf);
    let written =
        std::fs::read(&path).unwrap_or_else(|e| panic!("{} not written: {e}", path.display()));
    assert_eq!(written, content, "payload at {}", path.display());
}
