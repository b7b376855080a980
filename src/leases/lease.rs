// Core lease data structures

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Prefix of every lease key in the store
pub const GLOBAL_LOCK_PREFIX: &str = "global_lock_";

/// Prefix of logical (per-user) lock ids inside the global namespace
pub const USER_LOCK_PREFIX: &str = "write_lock_";

/// Suffix of the marker recording recent interactive use of a lease key
pub const INTERACTIVE_MARKER_SUFFIX: &str = ".interactive";

/// Value written to the store when nobody could be read as the holder
pub const UNKNOWN_HOLDER: &str = "[nobody?]";

/// Key of a lease in the lease store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseKey(String);

impl LeaseKey {
    /// Lease key for a low-level lock on `key`
    pub fn global(key: &str) -> Self {
        Self(format!("{GLOBAL_LOCK_PREFIX}{key}"))
    }

    /// Lease key backing the logical lock `lock_id`
    pub fn user(lock_id: &str) -> Self {
        Self::global(&format!("{USER_LOCK_PREFIX}{lock_id}"))
    }

    /// Key of the "interactive callers were here recently" marker
    pub fn interactive_marker(&self) -> String {
        format!("{}{INTERACTIVE_MARKER_SUFFIX}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the request holding a lease: unique per request and process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderToken(String);

impl HolderToken {
    pub fn new(request_id: &str, instance_id: &str) -> Self {
        Self(format!("{request_id} (instance {instance_id})"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an acquire came to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseGrant {
    /// The store stored our token, possibly after waiting for another holder
    Acquired { waited: Duration },
    /// The store already held our own token
    Reentered,
    /// The store failed; we proceed as if we held the lease
    FailedOpen,
}

/// A time-bounded exclusive claim on a key. Possession is advisory: the store
/// drops the lease at `expires_at` whether or not we are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: LeaseKey,
    pub holder: HolderToken,
    pub grant: LeaseGrant,
    pub acquired_at: Instant,
    pub hold_timeout: Duration,
}

impl Lease {
    pub fn new(key: LeaseKey, holder: HolderToken, grant: LeaseGrant, hold_timeout: Duration) -> Self {
        Self {
            key,
            holder,
            grant,
            acquired_at: Instant::now(),
            hold_timeout,
        }
    }

    /// When the store drops this lease
    pub fn expires_at(&self) -> Instant {
        self.acquired_at + self.hold_timeout
    }

    /// Time remaining until expiration; `None` once the store may have
    /// handed the key to someone else
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        let expiry = self.expires_at();
        (now < expiry).then(|| expiry - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_keys() {
        assert_eq!(LeaseKey::global("user:42").as_str(), "global_lock_user:42");
        assert_eq!(LeaseKey::user("42").as_str(), "global_lock_write_lock_42");
        assert_eq!(
            LeaseKey::global("user:42").interactive_marker(),
            "global_lock_user:42.interactive"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiration() {
        let lease = Lease::new(
            LeaseKey::global("k"),
            HolderToken::new("r1", "i1"),
            LeaseGrant::Acquired { waited: Duration::ZERO },
            Duration::from_secs(30),
        );
        let start = lease.acquired_at;

        assert_eq!(lease.time_remaining(start), Some(Duration::from_secs(30)));
        assert_eq!(lease.time_remaining(start + Duration::from_secs(30)), None);
        assert_eq!(
            lease.time_remaining(start + Duration::from_secs(25)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(lease.time_remaining(start + Duration::from_secs(31)), None);
    }
}
