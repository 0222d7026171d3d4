use thiserror::Error;

/// Core error type for the approval engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Template failed structural or activation-time validation
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// Template version not found
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Template exists but is not active
    #[error("Template is not active: {0}")]
    TemplateInactive(String),

    /// Approval instance not found
    #[error("Approval instance not found: {0}")]
    InstanceNotFound(String),

    /// Stage instance not found (or does not belong to the instance)
    #[error("Stage instance not found: {0}")]
    StageInstanceNotFound(String),

    /// Decision submitted to a stage that is no longer pending
    #[error("Stage is closed: {0}")]
    StageClosed(String),

    /// Approver is not in the eligible set of the stage instance
    #[error("Approver is not eligible: {0}")]
    NotEligible(String),

    /// Delegation attempted on a stage that does not allow it
    #[error("Delegation not allowed: {0}")]
    DelegationNotAllowed(String),

    /// Delegation allowed on the stage but refused for this pair of approvers
    #[error("Invalid delegation: {0}")]
    InvalidDelegation(String),

    /// Malformed decision (e.g. DELEGATE without a target)
    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    /// Instance already reached a terminal status
    #[error("Approval instance is closed: {0}")]
    InstanceClosed(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Timer service error
    #[error("Timer service error: {0}")]
    TimerServiceError(String),

    /// Role membership lookup failed
    #[error("Role directory error: {0}")]
    RoleDirectoryError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether this error is a rejected caller request rather than an
    /// infrastructure or configuration failure.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            EngineError::StageClosed(_)
                | EngineError::NotEligible(_)
                | EngineError::DelegationNotAllowed(_)
                | EngineError::InvalidDelegation(_)
                | EngineError::InvalidDecision(_)
                | EngineError::InstanceClosed(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (EngineError::InvalidTemplate("q".to_string()), "Invalid template: q"),
            (EngineError::TemplateNotFound("PO@1".to_string()), "Template not found: PO@1"),
            (EngineError::TemplateInactive("PO@1".to_string()), "Template is not active: PO@1"),
            (EngineError::InstanceNotFound("i1".to_string()), "Approval instance not found: i1"),
            (EngineError::StageInstanceNotFound("s1".to_string()), "Stage instance not found: s1"),
            (EngineError::StageClosed("s1".to_string()), "Stage is closed: s1"),
            (EngineError::NotEligible("u9".to_string()), "Approver is not eligible: u9"),
            (EngineError::DelegationNotAllowed("s1".to_string()), "Delegation not allowed: s1"),
            (EngineError::InvalidDelegation("cycle".to_string()), "Invalid delegation: cycle"),
            (EngineError::InvalidDecision("bad".to_string()), "Invalid decision: bad"),
            (EngineError::InstanceClosed("i1".to_string()), "Approval instance is closed: i1"),
            (EngineError::StateStoreError("db".to_string()), "State store error: db"),
            (EngineError::TimerServiceError("t".to_string()), "Timer service error: t"),
            (EngineError::RoleDirectoryError("r".to_string()), "Role directory error: r"),
            (EngineError::ConfigurationError("c".to_string()), "Configuration error: c"),
            (EngineError::SerializationError("s".to_string()), "Serialization error: s"),
            (EngineError::Other("other".to_string()), "other"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_policy_violation_classification() {
        assert!(EngineError::StageClosed("s".into()).is_policy_violation());
        assert!(EngineError::NotEligible("u".into()).is_policy_violation());
        assert!(EngineError::DelegationNotAllowed("s".into()).is_policy_violation());
        assert!(!EngineError::InvalidTemplate("t".into()).is_policy_violation());
        assert!(!EngineError::StateStoreError("db".into()).is_policy_violation());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: EngineError = json_error.into();

        match error {
            EngineError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: EngineError = "test error message".into();
        assert_eq!(error, EngineError::Other("test error message".to_string()));
    }
}
