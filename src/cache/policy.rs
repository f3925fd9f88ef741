//! Cache keys and per-operation caching policy.

use serde_json::Value;
use std::sync::Arc;

/// Whether calls to an operation may be served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Cache,
    Bypass,
}

/// Derives a cache key from a call. `None` bypasses the cache for that call.
pub type KeyFn = Arc<dyn Fn(&str, &[Value]) -> Option<String> + Send + Sync>;

/// Operations that change remote state: kernel loading and unloading, pool
/// writes, body definitions and error-mode switches.
pub const DEFAULT_MUTATING_OPS: &[&str] = &[
    "furnsh",
    "unload",
    "kclear",
    "loadKernel",
    "unloadKernel",
    "pdpool",
    "pipool",
    "pcpool",
    "lmpool",
    "clpool",
    "dvpool",
    "boddef",
    "reset",
    "erract",
    "errprt",
    "errdev",
];

/// True when `op` names a state-mutating operation. Namespaced names such as
/// `kernels.furnsh` or `spice:kclear` match on their last segment.
pub fn is_mutating_op(op: &str) -> bool {
    let name = op.rsplit(['.', ':']).next().unwrap_or(op);
    DEFAULT_MUTATING_OPS.contains(&name)
}

/// Stable serialization of `(op, args)`.
pub fn default_key(op: &str, args: &[Value]) -> Option<String> {
    serde_json::to_string(&(op, args)).ok()
}
