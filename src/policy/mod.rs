//! Versioned admission policy: model, validation and the publish point.

mod handle;
mod model;
mod parse;

pub use handle::PolicyHandle;
pub use model::{
    Concurrency, DependencyPolicy, DependencyType, ExecutionPolicy, GlobalExecutionLimit,
    JobPolicy, Policy, QuarantinePolicy, RateLimit, RetryPolicy, SUPPORTED_POLICY_VERSION,
};
pub use parse::{load_policy, parse_embedded, parse_policy, resolve_effective_policy, PolicyError};
