pub mod aggregate;
pub mod transitions;

pub use aggregate::recompute;
pub use transitions::{
    deploy_fallback, lock_fallback, transitional_deploy, transitional_lock, validate_deploy,
    validate_lock,
};
