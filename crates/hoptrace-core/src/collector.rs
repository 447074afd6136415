//! Reconciliation of concurrently probed TTLs.
//!
//! The destination answers every probe whose TTL is at least its real
//! distance, so in a parallel run several TTLs may each look like the final
//! hop. Only the lowest of them is. The collector waits for the full picture,
//! picks that lowest TTL, corrects every `is_final` flag and truncates the run
//! right after it.

use crate::parser::DestinationSet;
use crate::{Hop, RunOutcome};
use tracing::{debug, trace};

/// Write-once result slots, one per TTL.
#[derive(Debug)]
pub struct Collector {
    slots: Vec<Option<Hop>>,
}

impl Collector {
    /// Creates empty slots for TTL 1 through `max_hops`.
    pub fn new(max_hops: u8) -> Self {
        Self {
            slots: vec![None; max_hops as usize],
        }
    }

    /// Stores a hop in its TTL's slot.
    ///
    /// Returns false if the TTL is out of range or the slot was already filled;
    /// the first result for a TTL is the one kept.
    pub fn record(&mut self, hop: Hop) -> bool {
        let Some(index) = (hop.ttl as usize).checked_sub(1) else {
            trace!(ttl = hop.ttl, "Ignoring hop outside the TTL range");
            return false;
        };
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(hop);
                true
            }
            Some(_) => {
                trace!(ttl = hop.ttl, "Slot already filled, keeping first result");
                false
            }
            None => {
                trace!(ttl = hop.ttl, "Ignoring hop outside the TTL range");
                false
            }
        }
    }

    /// Number of filled slots.
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Resolves competing final-hop signals.
    ///
    /// The final hop is the lowest TTL that succeeded and either answered from
    /// one of the destination's addresses or was already flagged final by the
    /// parser. Hops are returned in ascending TTL order, ending at that hop.
    pub fn reconcile(self, targets: &DestinationSet) -> Reconciliation {
        let final_ttl = self
            .slots
            .iter()
            .flatten()
            .find(|hop| hop.succeeded && (hop.is_final || targets.contains(&hop.address)))
            .map(|hop| hop.ttl);

        let mut hops = Vec::with_capacity(self.slots.len());
        for mut hop in self.slots.into_iter().flatten() {
            let is_final = Some(hop.ttl) == final_ttl;
            if hop.is_final && !is_final {
                debug!(ttl = hop.ttl, "Clearing final flag on hop past the destination");
            }
            hop.is_final = is_final;
            hops.push(hop);
            if is_final {
                break;
            }
        }

        Reconciliation { hops, final_ttl }
    }
}

/// Result of reconciling a parallel run.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Hops to report, in ascending TTL order.
    pub hops: Vec<Hop>,
    /// TTL of the destination, if it was reached.
    pub final_ttl: Option<u8>,
}

impl Reconciliation {
    /// Terminal classification, assuming the run was not cancelled.
    pub fn outcome(&self) -> RunOutcome {
        match self.final_ttl {
            Some(ttl) => RunOutcome::Reached { ttl },
            None => RunOutcome::MaxHopsExhausted,
        }
    }
}
