use chrono::Utc;

use crate::types::{CompositionInstance, StateChangeResult};

/// Recomputes the instance aggregate from its element map.
///
/// The instance reaches a stable state only when every element holds that
/// same stable state with NO_ERROR; any element reporting FAILED or TIMEOUT
/// degrades the instance result while the per-element result stays precise.
/// Otherwise the in-flight transitional state stands.
pub fn recompute(instance: &mut CompositionInstance) {
    if instance.elements.is_empty() {
        return;
    }

    let all_clean = instance
        .elements
        .values()
        .all(|e| e.result == StateChangeResult::NoError);

    instance.result = if all_clean {
        StateChangeResult::NoError
    } else {
        StateChangeResult::Failed
    };

    if all_clean {
        if let Some(state) = uniform(instance.elements.values().map(|e| e.deploy_state)) {
            if !state.is_transitional() {
                instance.deploy_state = state;
            }
        }
        if let Some(state) = uniform(instance.elements.values().map(|e| e.lock_state)) {
            if !state.is_transitional() {
                instance.lock_state = state;
            }
        }
    }

    instance.last_updated = Utc::now();
}

fn uniform<T: Copy + PartialEq>(mut states: impl Iterator<Item = T>) -> Option<T> {
    let first = states.next()?;
    states.all(|s| s == first).then_some(first)
}
