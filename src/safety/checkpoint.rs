use std::collections::HashSet;

use super::{EntityProvenance, GetPutLedger, ProvenanceTable};
use crate::entity::{Entity, EntityKey, InstanceId};

/// Audit state of a write's entities before its put hooks ran.
///
/// A put hook that fails rejects the whole write, but hooks that already ran
/// for earlier entities have recorded puts that will never happen. Restoring
/// the checkpoint forgets them.
#[derive(Debug)]
pub struct AuditCheckpoint {
    provenance: Vec<(InstanceId, Option<EntityProvenance>)>,
    ledger: Vec<(EntityKey, usize)>,
}

impl AuditCheckpoint {
    pub fn take(provenance: &ProvenanceTable, ledger: &GetPutLedger, entities: &[Entity]) -> Self {
        let mut instances = HashSet::new();
        let mut keys = HashSet::new();
        let mut checkpoint = Self {
            provenance: Vec::with_capacity(entities.len()),
            ledger: Vec::with_capacity(entities.len()),
        };
        for entity in entities {
            if instances.insert(entity.instance()) {
                checkpoint
                    .provenance
                    .push((entity.instance(), provenance.snapshot(entity.instance())));
            }
            if keys.insert(entity.key()) {
                checkpoint
                    .ledger
                    .push((entity.key().clone(), ledger.len_for(entity.key())));
            }
        }
        checkpoint
    }

    pub fn restore(self, provenance: &ProvenanceTable, ledger: &GetPutLedger) {
        for (instance, saved) in self.provenance {
            provenance.restore(instance, saved);
        }
        for (key, mark) in self.ledger {
            ledger.discard_puts_since(&key, mark);
        }
    }
}
