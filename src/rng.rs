//! Reproducible randomness for risk tasks.
//!
//! Nothing here touches a global RNG: every draw is a pure function of the
//! master seed, the event id and (for uncorrelated assets) the asset ordinal.
//! A loss therefore does not depend on which task its event landed in.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;

use crate::types::{AssetId, Correlation, EventId, RuptureId};

/// Seed of the generator owned by one event.
pub fn seed_for(master_seed: u64, eid: EventId) -> u64 {
    master_seed.wrapping_add(u64::from(eid.0))
}

/// Generator for the hazard of one rupture; ruptures use disjoint ChaCha streams.
pub fn rupture_rng(master_seed: u64, rup_id: RuptureId) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(master_seed);
    rng.set_stream(u64::from(rup_id.0));
    rng
}

/// Per-event epsilon source for the events of one task.
#[derive(Debug, Clone)]
pub struct EventRng {
    master_seed: u64,
    correlation: Correlation,
    eids: Vec<EventId>,
}

impl EventRng {
    pub fn for_events(
        master_seed: u64,
        eids: impl IntoIterator<Item = EventId>,
        correlation: Correlation,
    ) -> Self {
        let mut eids: Vec<EventId> = eids.into_iter().collect();
        eids.sort_unstable();
        eids.dedup();
        EventRng { master_seed, correlation, eids }
    }

    pub fn eids(&self) -> &[EventId] {
        &self.eids
    }

    /// Standard-normal epsilon for one asset in one event.
    ///
    /// Fully correlated: every asset of the event shares stream 0.
    /// Uncorrelated: asset `a` draws from stream `a + 1`.
    pub fn epsilon(&self, eid: EventId, aid: AssetId) -> f64 {
        debug_assert!(self.eids.binary_search(&eid).is_ok(), "event {eid:?} not in this task");
        let mut rng = ChaCha20Rng::seed_from_u64(seed_for(self.master_seed, eid));
        if !self.correlation.is_correlated() {
            rng.set_stream(u64::from(aid.0) + 1);
        }
        rng.sample(StandardNormal)
    }
}
