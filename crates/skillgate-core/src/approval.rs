//! Which approval records authorize which transition.

use skillgate_state::{ApprovalRecord, LifecycleState, RegistryRecord};

pub const NO_DUPLICATION_VERIFIED: &str = "no_duplication_verified";
pub const TESTS_COMPLETE: &str = "tests_complete";
pub const SECURITY_REVIEWED: &str = "security_reviewed";
pub const DEPENDENCIES_VALIDATED: &str = "dependencies_validated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    /// Checklist items that must be present and `true`.
    pub required_checks: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            required_checks: [
                NO_DUPLICATION_VERIFIED,
                TESTS_COMPLETE,
                SECURITY_REVIEWED,
                DEPENDENCIES_VALIDATED,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ApprovalPolicy {
    /// `Ok(())` when `approval` authorizes moving `record` to `to`, otherwise
    /// why not.
    ///
    /// Approvals are bound to one skill version and one edge, and expire when
    /// the skill leaves the state they were granted in.
    pub fn verify(
        &self,
        approval: &ApprovalRecord,
        record: &RegistryRecord,
        to: LifecycleState,
    ) -> Result<(), String> {
        if approval.skill_id != record.skill_id {
            return Err(format!("approval is for skill {}", approval.skill_id));
        }
        if approval.skill_version != record.version {
            return Err(format!(
                "approval is for version {}, current is {}",
                approval.skill_version, record.version
            ));
        }
        if approval.from_state != record.state || approval.to_state != to {
            return Err(format!(
                "approval covers {} -> {}, requested {} -> {}",
                approval.from_state, approval.to_state, record.state, to
            ));
        }
        if approval.checklist.is_empty() {
            return Err("approval checklist is empty".into());
        }
        let failed = approval.failed_checks();
        if !failed.is_empty() {
            return Err(format!("checklist has failing items: {}", failed.join(", ")));
        }
        let missing: Vec<&str> = self
            .required_checks
            .iter()
            .filter(|c| !approval.checklist.contains_key(c.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("checklist is missing: {}", missing.join(", ")));
        }
        if approval.timestamp < record.state_since {
            return Err("approval predates the skill's current state".into());
        }
        Ok(())
    }

    /// The most recent approval that authorizes `record -> to`.
    pub fn find_valid<'a>(
        &self,
        approvals: &'a [ApprovalRecord],
        record: &RegistryRecord,
        to: LifecycleState,
    ) -> Option<&'a ApprovalRecord> {
        approvals
            .iter()
            .filter(|a| self.verify(a, record, to).is_ok())
            .max_by_key(|a| a.timestamp)
    }

    /// Why no approval in `approvals` authorizes the transition.
    pub fn explain_missing(
        &self,
        approvals: &[ApprovalRecord],
        record: &RegistryRecord,
        to: LifecycleState,
    ) -> String {
        let relevant: Vec<String> = approvals
            .iter()
            .filter(|a| a.to_state == to && a.skill_version == record.version)
            .filter_map(|a| self.verify(a, record, to).err())
            .collect();
        match relevant.last() {
            Some(reason) => reason.clone(),
            None => format!("no approval recorded for {} -> {}", record.state, to),
        }
    }
}
