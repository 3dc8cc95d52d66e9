use crate::error::{OrchestratorError, Result};
use crate::types::{CompositionInstance, DeployState, LockState, StateChangeResult};

/// Checks that `target` is reachable from the instance's current deploy
/// state and returns the transitional state the instance passes through.
///
/// Transitional sources are only re-enterable after a failure: a clean
/// in-flight transition is guarded separately by the pending-operation
/// check, and re-dispatching over it is never legal.
pub fn validate_deploy(instance: &CompositionInstance, target: DeployState) -> Result<DeployState> {
    let failed = instance.result != StateChangeResult::NoError;

    let legal = match (instance.deploy_state, target) {
        (
            DeployState::Commissioned | DeployState::Undeployed | DeployState::Deployed,
            DeployState::Deployed,
        ) => true,
        (DeployState::Deploying | DeployState::Undeploying, DeployState::Deployed) => failed,

        (DeployState::Deployed, DeployState::Undeployed) => true,
        (DeployState::Deploying | DeployState::Undeploying, DeployState::Undeployed) => failed,

        (DeployState::Undeployed, DeployState::Deleting) => true,
        (DeployState::Deleting, DeployState::Deleting) => failed,

        _ => false,
    };

    if !legal {
        return Err(OrchestratorError::InvalidStateTransition {
            instance_id: instance.instance_id,
            from: instance.deploy_state.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }

    Ok(transitional_deploy(target))
}

/// Lock commands only apply to a deployed instance.
pub fn validate_lock(instance: &CompositionInstance, target: LockState) -> Result<LockState> {
    let failed = instance.result != StateChangeResult::NoError;

    let legal = instance.deploy_state == DeployState::Deployed
        && match (instance.lock_state, target) {
            (LockState::Unlocked, LockState::Locked) => true,
            (LockState::Locking, LockState::Locked) => failed,
            (LockState::Locked, LockState::Unlocked) => true,
            (LockState::Unlocking, LockState::Unlocked) => failed,
            _ => false,
        };

    if !legal {
        return Err(OrchestratorError::InvalidStateTransition {
            instance_id: instance.instance_id,
            from: instance.lock_state.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }

    Ok(transitional_lock(target))
}

/// The transitional state an element passes through on its way to `target`.
/// Both sides of the wire use the same mapping: the runtime sets it
/// optimistically at dispatch, the participant on accepting the command.
pub fn transitional_deploy(target: DeployState) -> DeployState {
    match target {
        DeployState::Deployed => DeployState::Deploying,
        DeployState::Undeployed => DeployState::Undeploying,
        _ => DeployState::Deleting,
    }
}

pub fn transitional_lock(target: LockState) -> LockState {
    match target {
        LockState::Locked => LockState::Locking,
        _ => LockState::Unlocking,
    }
}

/// The stable deploy state a failed transition falls back to. A FAILED
/// report never leaves an element stranded mid-transition: a failed deploy
/// reports Undeployed, a failed undeploy reports Deployed, a failed delete
/// reports Undeployed.
pub fn deploy_fallback(target: DeployState) -> DeployState {
    match target {
        DeployState::Undeployed => DeployState::Deployed,
        _ => DeployState::Undeployed,
    }
}

/// Lock-axis counterpart of [`deploy_fallback`].
pub fn lock_fallback(target: LockState) -> LockState {
    match target {
        LockState::Locked => LockState::Unlocked,
        _ => LockState::Locked,
    }
}
