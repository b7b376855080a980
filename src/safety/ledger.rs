use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entity::EntityKey;
use crate::util::Nonce;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    Get,
    Put,
}

/// Where a put was issued from
#[derive(Debug, Clone)]
pub struct WriteSite {
    pub location: &'static Location<'static>,
    pub backtrace: Option<Arc<str>>,
}

impl WriteSite {
    pub fn new(location: &'static Location<'static>, capture_backtrace: bool) -> Self {
        Self {
            location,
            backtrace: capture_backtrace.then(|| Arc::from(Backtrace::force_capture().to_string())),
        }
    }

    /// The site of whoever called the enclosing `#[track_caller]` function
    #[track_caller]
    pub fn here(capture_backtrace: bool) -> Self {
        Self::new(Location::caller(), capture_backtrace)
    }
}

impl fmt::Display for WriteSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.location)?;
        if let Some(backtrace) = &self.backtrace {
            writeln!(f, "{backtrace}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub op: AccessOp,
    /// Get nonce of the copy involved
    pub nonce: Nonce,
    /// Only recorded for puts
    pub site: Option<WriteSite>,
}

/// Per-request order of gets and puts, by entity key.
///
/// Entries are identified by the get nonce of the copy involved, so puts of
/// copies that never came from a get are not recorded.
#[derive(Debug, Default)]
pub struct GetPutLedger {
    entries: Mutex<HashMap<EntityKey, Vec<LedgerEntry>>>,
}

impl GetPutLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_get(&self, key: &EntityKey, nonce: Nonce) {
        self.push(key, LedgerEntry {
            op: AccessOp::Get,
            nonce,
            site: None,
        });
    }

    pub fn record_put(&self, key: &EntityKey, nonce: Nonce, site: WriteSite) {
        self.push(key, LedgerEntry {
            op: AccessOp::Put,
            nonce,
            site: Some(site),
        });
    }

    /// Puts of other copies that happened after the get with `nonce`. Writing
    /// the `nonce` copy now would overwrite them.
    pub fn conflicting_puts(&self, key: &EntityKey, nonce: Nonce) -> Vec<WriteSite> {
        let entries = self.entries.lock();
        let Some(list) = entries.get(key) else {
            return Vec::new();
        };
        let Some(get_index) = list
            .iter()
            .position(|entry| entry.op == AccessOp::Get && entry.nonce == nonce)
        else {
            return Vec::new();
        };
        list[get_index + 1..]
            .iter()
            .filter(|entry| entry.op == AccessOp::Put && entry.nonce != nonce)
            .filter_map(|entry| entry.site.clone())
            .collect()
    }

    /// Number of entries recorded for `key` so far
    pub fn len_for(&self, key: &EntityKey) -> usize {
        self.entries.lock().get(key).map_or(0, Vec::len)
    }

    /// Forget the puts of `key` recorded after its first `mark` entries.
    /// Gets recorded meanwhile are kept.
    pub fn discard_puts_since(&self, key: &EntityKey, mark: usize) {
        let mut entries = self.entries.lock();
        let Some(list) = entries.get_mut(key) else {
            return;
        };
        let mut index = 0;
        list.retain(|entry| {
            let keep = index < mark || entry.op == AccessOp::Get;
            index += 1;
            keep
        });
        if list.is_empty() {
            entries.remove(key);
        }
    }

    pub fn entries_for(&self, key: &EntityKey) -> Vec<LedgerEntry> {
        self.entries.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn push(&self, key: &EntityKey, entry: LedgerEntry) {
        self.entries
            .lock()
            .entry(key.clone())
            .or_default()
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_put_of_other_copy_conflicts() {
        let ledger = GetPutLedger::new();
        let key = EntityKey::new("UserData", "u1");
        let (first, second) = (Nonce(1), Nonce(3));

        ledger.record_get(&key, first);
        ledger.record_get(&key, second);
        let second_site = WriteSite::here(false);
        ledger.record_put(&key, second, second_site.clone());
        assert!(ledger.conflicting_puts(&key, second).is_empty());

        ledger.record_put(&key, first, WriteSite::here(false));
        let conflicts = ledger.conflicting_puts(&key, first);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].location, second_site.location);
    }

    #[test]
    fn test_put_before_other_get_is_fine() {
        let ledger = GetPutLedger::new();
        let key = EntityKey::new("UserData", "u1");
        ledger.record_get(&key, Nonce(1));
        ledger.record_put(&key, Nonce(1), WriteSite::here(false));
        ledger.record_get(&key, Nonce(3));
        ledger.record_put(&key, Nonce(3), WriteSite::here(false));
        assert!(ledger.conflicting_puts(&key, Nonce(3)).is_empty());
        assert_eq!(ledger.entries_for(&key).len(), 4);
    }

    #[test]
    fn test_discarded_puts_no_longer_conflict() {
        let ledger = GetPutLedger::new();
        let key = EntityKey::new("UserData", "u1");
        ledger.record_get(&key, Nonce(1));
        ledger.record_get(&key, Nonce(3));
        let mark = ledger.len_for(&key);

        ledger.record_put(&key, Nonce(3), WriteSite::here(false));
        ledger.record_get(&key, Nonce(5));
        ledger.discard_puts_since(&key, mark);

        let ops: Vec<AccessOp> = ledger.entries_for(&key).iter().map(|entry| entry.op).collect();
        assert_eq!(ops, vec![AccessOp::Get, AccessOp::Get, AccessOp::Get]);
        ledger.record_put(&key, Nonce(1), WriteSite::here(false));
        assert!(ledger.conflicting_puts(&key, Nonce(1)).is_empty());

        let fresh = EntityKey::new("UserData", "u2");
        ledger.record_put(&fresh, Nonce(7), WriteSite::here(false));
        ledger.discard_puts_since(&fresh, 0);
        assert_eq!(ledger.len_for(&fresh), 0);
    }
}
