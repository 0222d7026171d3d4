//! Workflow templates and their stages
//!
//! A template is a finalized arena of stages addressed by index. The engine
//! never mutates a template after an instance starts; authoring-time edits go
//! through [`StageRecord`] conversion and [`WorkflowTemplate::renumber`]
//! before activation.

use crate::types::{RoleName, TemplateCode};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU32;

/// Reference to one immutable version of a template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateVersionRef {
    /// Template code
    pub code: TemplateCode,

    /// Template version
    pub version: u32,
}

impl TemplateVersionRef {
    /// Create a new template reference
    pub fn new(code: impl Into<String>, version: u32) -> Self {
        Self {
            code: TemplateCode(code.into()),
            version,
        }
    }
}

impl fmt::Display for TemplateVersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code, self.version)
    }
}

/// How the decisions on a stage are combined into an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision_policy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionPolicy {
    /// First approval wins
    Any,

    /// Unanimity of the eligible approvers
    All,

    /// A minimum number of approvals
    Quorum {
        /// Approvals required
        #[serde(rename = "quorum_count")]
        count: NonZeroU32,
    },
}

impl DecisionPolicy {
    /// Build a quorum policy, rejecting a zero count
    pub fn quorum(count: u32) -> Result<Self, EngineError> {
        NonZeroU32::new(count)
            .map(|count| DecisionPolicy::Quorum { count })
            .ok_or_else(|| {
                EngineError::InvalidTemplate("quorum_count must be greater than zero".to_string())
            })
    }

    /// The kind of policy without its parameters
    pub fn kind(&self) -> PolicyKind {
        match self {
            DecisionPolicy::Any => PolicyKind::Any,
            DecisionPolicy::All => PolicyKind::All,
            DecisionPolicy::Quorum { .. } => PolicyKind::Quorum,
        }
    }

    /// Quorum count for QUORUM policies
    pub fn quorum_count(&self) -> Option<u32> {
        match self {
            DecisionPolicy::Quorum { count } => Some(count.get()),
            _ => None,
        }
    }
}

/// Policy kind as carried by the flat authoring record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyKind {
    /// ANY
    Any,
    /// ALL
    All,
    /// QUORUM
    Quorum,
}

/// One approval checkpoint of a template
///
/// Serialized in the flat [`StageRecord`] shape; deserializing goes through
/// the same policy/quorum checks as [`StageRecord::into_stage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StageRecord", into = "StageRecord")]
pub struct Stage {
    /// 1-based position; shared only by stages of the same parallel group
    pub order_index: u32,

    /// Human-readable name
    pub name: String,

    /// Decision policy
    pub policy: DecisionPolicy,

    /// Role whose members are the eligible approvers
    pub required_role: RoleName,

    /// Whether a REJECT vote can resolve the stage
    pub allow_reject: bool,

    /// Whether an eligible approver may hand their eligibility to someone else
    pub allow_delegate: bool,

    /// Time budget for resolution
    pub sla_hours: u32,

    /// Stages sharing a group number open together
    pub parallel_group: Option<u32>,
}

impl Stage {
    /// SLA as a duration
    pub fn sla(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.sla_hours))
    }
}

/// Flat stage shape produced by the authoring forms
///
/// `quorum_count` is only meaningful for QUORUM; converting to [`Stage`]
/// rejects every other pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// 1-based position
    pub order_index: u32,
    /// Stage name
    pub name: String,
    /// Policy kind
    pub decision_policy: PolicyKind,
    /// Quorum count, present iff the policy is QUORUM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_count: Option<u32>,
    /// Required role
    pub required_role: String,
    /// Allow reject
    #[serde(default)]
    pub allow_reject: bool,
    /// Allow delegate
    #[serde(default)]
    pub allow_delegate: bool,
    /// SLA in hours; the configured default applies when absent
    #[serde(default)]
    pub sla_hours: Option<u32>,
    /// Parallel group
    #[serde(default)]
    pub parallel_group: Option<u32>,
}

impl StageRecord {
    /// Convert the authoring record into a validated stage
    pub fn into_stage(self, default_sla_hours: u32) -> Result<Stage, EngineError> {
        let policy = match (self.decision_policy, self.quorum_count) {
            (PolicyKind::Any, None) => DecisionPolicy::Any,
            (PolicyKind::All, None) => DecisionPolicy::All,
            (PolicyKind::Quorum, Some(count)) => DecisionPolicy::quorum(count).map_err(|_| {
                EngineError::InvalidTemplate(format!(
                    "Stage '{}' has QUORUM policy without a positive quorum_count",
                    self.name
                ))
            })?,
            (PolicyKind::Quorum, None) => {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' has QUORUM policy without a quorum_count",
                    self.name
                )))
            }
            (kind, Some(_)) => {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' sets quorum_count but its policy is {:?}",
                    self.name, kind
                )))
            }
        };

        Ok(Stage {
            order_index: self.order_index,
            name: self.name,
            policy,
            required_role: RoleName(self.required_role),
            allow_reject: self.allow_reject,
            allow_delegate: self.allow_delegate,
            sla_hours: self.sla_hours.unwrap_or(default_sla_hours),
            parallel_group: self.parallel_group,
        })
    }
}

impl TryFrom<StageRecord> for Stage {
    type Error = EngineError;

    fn try_from(record: StageRecord) -> Result<Self, Self::Error> {
        let sla_hours = record.sla_hours.ok_or_else(|| {
            EngineError::InvalidTemplate(format!("Stage '{}' has no sla_hours", record.name))
        })?;
        record.into_stage(sla_hours)
    }
}

impl From<Stage> for StageRecord {
    fn from(stage: Stage) -> Self {
        Self {
            order_index: stage.order_index,
            name: stage.name,
            decision_policy: stage.policy.kind(),
            quorum_count: stage.policy.quorum_count(),
            required_role: stage.required_role.0,
            allow_reject: stage.allow_reject,
            allow_delegate: stage.allow_delegate,
            sla_hours: Some(stage.sla_hours),
            parallel_group: stage.parallel_group,
        }
    }
}

/// A set of stages that open together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGroup {
    /// Position of the group in the schedule (0-based)
    pub position: usize,

    /// Shared parallel group number, `None` for a standalone stage
    pub parallel_group: Option<u32>,

    /// Indices into the template's stage arena
    pub stage_indices: Vec<usize>,
}

/// Reusable definition of an ordered sequence of approval stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique code
    pub code: TemplateCode,

    /// Human-readable name
    pub name: String,

    /// Kind of subject this template governs
    pub content_type: String,

    /// Version number
    pub version: u32,

    /// Whether new instances may start from this version
    pub is_active: bool,

    /// Stage arena
    pub stages: Vec<Stage>,
}

impl WorkflowTemplate {
    /// Reference to this exact version
    pub fn version_ref(&self) -> TemplateVersionRef {
        TemplateVersionRef {
            code: self.code.clone(),
            version: self.version,
        }
    }

    /// Validate the structure of the template
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stages.is_empty() {
            return Err(EngineError::InvalidTemplate(format!(
                "Template {} has no stages",
                self.version_ref()
            )));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage at order_index {} has an empty name",
                    stage.order_index
                )));
            }

            if !names.insert(stage.name.as_str()) {
                return Err(EngineError::InvalidTemplate(format!(
                    "Duplicate stage name: {}",
                    stage.name
                )));
            }

            if stage.order_index == 0 {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' has order_index 0; indices are 1-based",
                    stage.name
                )));
            }

            if stage.sla_hours == 0 {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' must have a positive sla_hours",
                    stage.name
                )));
            }

            if stage.required_role.0.trim().is_empty() {
                return Err(EngineError::InvalidTemplate(format!(
                    "Stage '{}' has no required_role",
                    stage.name
                )));
            }
        }

        self.schedule().map(|_| ())
    }

    /// Compute the ordered groups in which stages open
    ///
    /// Fails on ordering conflicts: a duplicated `order_index` outside a
    /// shared parallel group, or a parallel group whose stages are not
    /// contiguous in `order_index` order.
    pub fn schedule(&self) -> Result<Vec<StageGroup>, EngineError> {
        let mut order: Vec<usize> = (0..self.stages.len()).collect();
        order.sort_by_key(|&idx| self.stages[idx].order_index);

        let mut groups: Vec<StageGroup> = Vec::new();
        let mut closed_groups: HashSet<u32> = HashSet::new();
        let mut previous: Option<usize> = None;

        for idx in order {
            let stage = &self.stages[idx];

            if let Some(prev_idx) = previous {
                let prev = &self.stages[prev_idx];
                let shares_group =
                    stage.parallel_group.is_some() && stage.parallel_group == prev.parallel_group;
                if stage.order_index == prev.order_index && !shares_group {
                    return Err(EngineError::InvalidTemplate(format!(
                        "Stages '{}' and '{}' share order_index {} without sharing a parallel_group",
                        prev.name, stage.name, stage.order_index
                    )));
                }
            }

            let joins_current = match (stage.parallel_group, groups.last()) {
                (Some(group), Some(current)) => current.parallel_group == Some(group),
                _ => false,
            };

            if joins_current {
                if let Some(current) = groups.last_mut() {
                    current.stage_indices.push(idx);
                }
            } else {
                if let Some(current) = groups.last() {
                    if let Some(group) = current.parallel_group {
                        closed_groups.insert(group);
                    }
                }

                if let Some(group) = stage.parallel_group {
                    if closed_groups.contains(&group) {
                        return Err(EngineError::InvalidTemplate(format!(
                            "Parallel group {} is interleaved with other stages at order_index {}",
                            group, stage.order_index
                        )));
                    }
                }

                groups.push(StageGroup {
                    position: groups.len(),
                    parallel_group: stage.parallel_group,
                    stage_indices: vec![idx],
                });
            }

            previous = Some(idx);
        }

        Ok(groups)
    }

    /// Compact `order_index` values to 1..=n after stages were removed
    ///
    /// Stages that shared an index keep sharing the new one. The arena is
    /// reordered by position.
    pub fn renumber(&mut self) {
        self.stages.sort_by_key(|stage| stage.order_index);

        let mut next_index = 0;
        let mut last_original: Option<u32> = None;
        for stage in &mut self.stages {
            if last_original != Some(stage.order_index) {
                next_index += 1;
                last_original = Some(stage.order_index);
            }
            stage.order_index = next_index;
        }
    }

    /// Remove a stage by name and renumber the remaining ones
    pub fn remove_stage(&mut self, name: &str) -> Result<Stage, EngineError> {
        let position = self
            .stages
            .iter()
            .position(|stage| stage.name == name)
            .ok_or_else(|| EngineError::InvalidTemplate(format!("Unknown stage: {}", name)))?;

        let removed = self.stages.remove(position);
        self.renumber();
        Ok(removed)
    }
}
