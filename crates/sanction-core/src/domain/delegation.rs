//! Delegation resolver
//!
//! Rewrites the effective eligible set of a single pending stage instance
//! when one eligible approver hands their eligibility to another.

use crate::domain::stage_instance::StageInstance;
use crate::domain::template::Stage;
use crate::types::ApproverId;
use crate::EngineError;
use std::collections::BTreeSet;

/// Compute the eligible set that results from `from` delegating to `to`
///
/// The stage instance is not modified. Fails when `from` is not eligible,
/// when the stage does not allow delegation, or when the pair is refused:
/// self-delegation, a target that is already eligible, a target that was
/// delegated away earlier (which would form a chain back), a delegator who
/// already voted, or a stage that reached `max_delegations`.
pub fn resolve(
    stage_instance: &StageInstance,
    stage: &Stage,
    from: &ApproverId,
    to: &ApproverId,
    max_delegations: usize,
) -> Result<BTreeSet<ApproverId>, EngineError> {
    if !stage_instance.eligible.contains(from) {
        return Err(EngineError::NotEligible(format!(
            "{} is not eligible on stage '{}'",
            from, stage_instance.name
        )));
    }

    if !stage.allow_delegate {
        return Err(EngineError::DelegationNotAllowed(format!(
            "Stage '{}' does not allow delegation",
            stage_instance.name
        )));
    }

    if from == to {
        return Err(EngineError::InvalidDelegation(format!(
            "{} cannot delegate to themselves",
            from
        )));
    }

    if stage_instance.has_voted(from) {
        return Err(EngineError::InvalidDelegation(format!(
            "{} already cast a decision on stage '{}'",
            from, stage_instance.name
        )));
    }

    if stage_instance.eligible.contains(to) {
        return Err(EngineError::InvalidDelegation(format!(
            "{} is already eligible on stage '{}'",
            to, stage_instance.name
        )));
    }

    if stage_instance.delegated_away.contains(to) {
        return Err(EngineError::InvalidDelegation(format!(
            "{} already delegated their eligibility on stage '{}'",
            to, stage_instance.name
        )));
    }

    if stage_instance.delegation_count() >= max_delegations {
        return Err(EngineError::InvalidDelegation(format!(
            "Stage '{}' reached the maximum of {} delegations",
            stage_instance.name, max_delegations
        )));
    }

    let mut eligible = stage_instance.eligible.clone();
    eligible.remove(from);
    eligible.insert(to.clone());
    Ok(eligible)
}
