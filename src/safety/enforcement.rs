use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// Which findings are reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    #[default]
    EnforceAll,
    /// Everything but the user-lock discipline check
    EnforceAllExceptUserLock,
    EnforceNone,
}

impl EnforcementMode {
    pub fn permits(self, kind: ViolationKind) -> bool {
        match self {
            EnforcementMode::EnforceAll => true,
            EnforcementMode::EnforceAllExceptUserLock => kind != ViolationKind::UserLock,
            EnforcementMode::EnforceNone => false,
        }
    }
}

/// Class of consistency finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Put of a kind that is never written directly
    ForbiddenPut,
    WrittenOnce,
    Transaction,
    UserLock,
    Cron,
    /// Lost update: two copies of one entity written in the same request
    TaintedWrite,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::ForbiddenPut => "forbidden-put",
            ViolationKind::WrittenOnce => "written-once",
            ViolationKind::Transaction => "transaction",
            ViolationKind::UserLock => "user-lock",
            ViolationKind::Cron => "cron",
            ViolationKind::TaintedWrite => "tainted-write",
        };
        f.write_str(name)
    }
}

/// Per-request enforcement state
#[derive(Debug)]
pub struct Enforcement {
    mode: Mutex<EnforcementMode>,
    default: EnforcementMode,
    raises: bool,
}

impl Enforcement {
    pub fn new(default: EnforcementMode, raises: bool) -> Self {
        Self {
            mode: Mutex::new(default),
            default,
            raises,
        }
    }

    pub fn mode(&self) -> EnforcementMode {
        *self.mode.lock()
    }

    pub fn raises(&self) -> bool {
        self.raises
    }

    /// Report a finding: an error when raising, a log line otherwise, nothing
    /// when the current mode suppresses this kind.
    pub fn report(&self, kind: ViolationKind, message: String) -> Result<()> {
        if !self.mode().permits(kind) {
            return Ok(());
        }
        if self.raises {
            Err(Error::ConsistencyViolation { kind, message })
        } else {
            error!(violation = %kind, "{message}");
            Ok(())
        }
    }

    /// Switch to `mode` until the guard drops
    pub fn override_mode(&self, mode: EnforcementMode) -> EnforcementGuard<'_> {
        let previous = std::mem::replace(&mut *self.mode.lock(), mode);
        EnforcementGuard {
            enforcement: self,
            previous,
        }
    }

    pub fn reset(&self) {
        *self.mode.lock() = self.default;
    }
}

/// Restores the previous enforcement mode on drop
#[must_use = "the mode is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct EnforcementGuard<'a> {
    enforcement: &'a Enforcement,
    previous: EnforcementMode,
}

impl Drop for EnforcementGuard<'_> {
    fn drop(&mut self) {
        *self.enforcement.mode.lock() = self.previous;
    }
}
