//! Shared value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value object: identity of a person (or system actor) casting decisions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApproverId(pub String);

/// Value object: role whose members are eligible approvers for a stage
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleName(pub String);

/// Value object: unique template code
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateCode(pub String);

/// Reference to the artifact being approved
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Kind of subject, matched against the template's content type
    pub content_type: String,

    /// Identifier of the subject within its content type
    pub object_id: String,
}

impl SubjectRef {
    /// Create a new subject reference
    pub fn new(content_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            object_id: object_id.into(),
        }
    }
}

impl From<&str> for ApproverId {
    fn from(value: &str) -> Self {
        ApproverId(value.to_string())
    }
}

impl From<&str> for RoleName {
    fn from(value: &str) -> Self {
        RoleName(value.to_string())
    }
}

impl From<&str> for TemplateCode {
    fn from(value: &str) -> Self {
        TemplateCode(value.to_string())
    }
}

impl fmt::Display for ApproverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TemplateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_type, self.object_id)
    }
}
