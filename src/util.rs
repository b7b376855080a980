use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::error;

/// A freshly generated token distinguishing one lock acquisition or one
/// get() from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nonce(pub u64);

impl Nonce {
    /// Generate a new random nonce. Never zero.
    pub fn generate() -> Self {
        Self(rand::random::<u64>() | 1)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

static FALLBACK_INSTANCE_ID: OnceLock<String> = OnceLock::new();

/// Identifier of this process among all processes sharing the lease store.
///
/// Prefers the configured id; without one we fall back to a random id that is
/// stable for the life of the process. That is fine for tests but makes lock
/// holders hard to trace in production, so we complain about it.
pub fn instance_id(configured: Option<&str>) -> String {
    match configured {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => FALLBACK_INSTANCE_ID
            .get_or_init(|| {
                let id = rand::random_range(1..1_000_000u32).to_string();
                error!(fallback = %id, "Missing instance id; using a random one");
                id
            })
            .clone(),
    }
}
