//! Pre-execution risk scoring for a task list.

use crate::core::types::{QualityGate, Risk, RiskAssessment, Task};

const MISSING_TESTS_PENALTY: u32 = 20;
const HIGH_RISK_NO_SECURITY_PENALTY: u32 = 25;
const HIGH_RISK_NO_CONTROLS_PENALTY: u32 = 10;
const BROAD_BLAST_RADIUS_PENALTY: u32 = 5;

/// Score the task list starting from 100 and collect blockers and warnings.
///
/// Missing tests and high-risk tasks without a security gate are blockers;
/// high-risk tasks without controls and "root" blast radii only warn.
pub fn assess_risk(tasks: &[Task]) -> RiskAssessment {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();
    let mut penalty = 0u32;

    for task in tasks {
        if task.tests.is_empty() {
            blockers.push(format!("{}: missing tests", task.id));
            penalty += MISSING_TESTS_PENALTY;
        }

        if task.risk == Risk::High && !task.has_gate(QualityGate::Security) {
            blockers.push(format!(
                "{}: high-risk task missing security quality gate",
                task.id
            ));
            penalty += HIGH_RISK_NO_SECURITY_PENALTY;
        }

        if task.risk == Risk::High && task.risk_controls.is_empty() {
            warnings.push(format!(
                "{}: high-risk task missing explicit risk controls",
                task.id
            ));
            penalty += HIGH_RISK_NO_CONTROLS_PENALTY;
        }

        if task.blast_radius.to_lowercase().contains("root") {
            warnings.push(format!("{}: broad blast radius", task.id));
            penalty += BROAD_BLAST_RADIUS_PENALTY;
        }
    }

    RiskAssessment {
        score: 100u32.saturating_sub(penalty),
        blockers,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn clean_tasks_score_full_marks() {
        let assessment = assess_risk(&[task("a"), task("b")]);
        assert_eq!(assessment.score, 100);
        assert!(!assessment.is_blocked());
        assert!(assessment.warnings.is_empty());
    }

    #[test]
    fn high_risk_without_security_gate_blocks() {
        let mut risky = task("risky");
        risky.risk = Risk::High;
        risky.risk_controls = vec!["feature flag".to_string()];

        let assessment = assess_risk(&[risky]);
        assert_eq!(
            assessment.blockers,
            vec!["risky: high-risk task missing security quality gate"]
        );
        assert!(assessment.score <= 75);
    }

    #[test]
    fn missing_controls_and_root_blast_radius_only_warn() {
        let mut risky = task("risky");
        risky.risk = Risk::High;
        risky.quality_gates.push(QualityGate::Security);
        risky.blast_radius = "Repository ROOT".to_string();

        let assessment = assess_risk(&[risky]);
        assert!(assessment.blockers.is_empty());
        assert_eq!(assessment.warnings.len(), 2);
        assert_eq!(assessment.score, 85);
    }

    #[test]
    fn missing_tests_blocks() {
        let mut untested = task("untested");
        untested.tests.clear();
        let assessment = assess_risk(&[untested]);
        assert_eq!(assessment.blockers, vec!["untested: missing tests"]);
        assert_eq!(assessment.score, 80);
    }

    #[test]
    fn score_floors_at_zero() {
        let tasks: Vec<Task> = (0..5)
            .map(|i| {
                let mut t = task(&format!("t{i}"));
                t.tests.clear();
                t.risk = Risk::High;
                t.blast_radius = "root".to_string();
                t
            })
            .collect();
        let assessment = assess_risk(&tasks);
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.blockers.len(), 10);
    }
}
