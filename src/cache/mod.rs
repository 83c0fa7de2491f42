//! Response caching: an exact tier for shallow contexts, a depth-bucketed
//! semantic tier for deeper ones, and a URL-keyed resource namespace.
//!
//! Every entry's lifetime shrinks with the depth of the conversation it was
//! written from; see [`decay_ttl_days`].

pub mod exact;
pub mod response_cache;
pub mod semantic;
pub mod topics;

use crate::config::CacheConfig;

pub use exact::{exact_key, ExactEntry, ExactTier};
pub use response_cache::{CacheHit, CacheStats, HitSource, ResponseCache};
pub use semantic::{cosine_similarity, SemanticEntry, SemanticIndex, SemanticMatch};
pub use topics::TopicExtractor;

/// Entry lifetime in days: `base × decay^(message_count − 1)`.
///
/// A `message_count` of 0 is treated as 1.
pub fn decay_ttl_days(base_days: f64, decay: f64, message_count: usize) -> f64 {
    let exponent = message_count.max(1) - 1;
    base_days * decay.powi(exponent.min(i32::MAX as usize) as i32)
}

/// Convert fractional days to a chrono duration, saturating on overflow.
pub(crate) fn days_to_duration(days: f64) -> chrono::Duration {
    let millis = (days * 86_400_000.0).clamp(0.0, i64::MAX as f64 / 2.0);
    chrono::Duration::milliseconds(millis as i64)
}

/// Which lookup tier applies at a given context depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTier {
    Exact,
    Semantic,
    /// Too deep for either tier: always a live generation.
    Bypass,
}

/// Lookup tier for `depth` (prior messages + the new one).
pub fn lookup_tier(config: &CacheConfig, depth: usize) -> LookupTier {
    if depth <= config.exact_max_depth {
        LookupTier::Exact
    } else if depth >= config.semantic_min_depth && depth <= config.semantic_max_depth {
        LookupTier::Semantic
    } else {
        LookupTier::Bypass
    }
}
