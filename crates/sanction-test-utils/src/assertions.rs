//! Assertion helpers over status reports

use sanction_core::{InstanceStatus, InstanceStatusReport, StageStatus};

/// Assert the instance status
pub fn assert_instance_status(report: &InstanceStatusReport, expected: InstanceStatus) {
    assert_eq!(
        report.status, expected,
        "instance {} is {:?}, expected {:?} (reason: {:?})",
        report.instance_id, report.status, expected, report.termination_reason
    );
}

/// Assert the status of a named stage
pub fn assert_stage_status(report: &InstanceStatusReport, stage_name: &str, expected: StageStatus) {
    let stage = report
        .stages
        .iter()
        .find(|s| s.name == stage_name)
        .unwrap_or_else(|| panic!("stage '{}' was never opened", stage_name));

    assert_eq!(
        stage.status, expected,
        "stage '{}' is {:?}, expected {:?}",
        stage_name, stage.status, expected
    );
}

/// Names of the opened stages, in opening order
pub fn opened_stage_names(report: &InstanceStatusReport) -> Vec<String> {
    report.stages.iter().map(|s| s.name.clone()).collect()
}
