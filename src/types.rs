use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

/// Ordinal position of an asset in the exposure; indexes the average-loss array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub u32);

/// Logic-tree realization an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RlzId(pub u16);

/// Aggregation key. Explicit keys are `0..K`; `K` itself is the implicit total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggKey(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuptureId(pub u32);

/// Index into the run's loss-type names (primary types first, then `_ins`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LossTypeIdx(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskNo(pub u32);

impl AggKey {
    /// The implicit key under which every event's portfolio total is stored.
    /// `num_keys` is at most `u16::MAX` once `AssetCollection::validate_keys` passed.
    pub fn total(num_keys: usize) -> Self {
        debug_assert!(num_keys <= usize::from(u16::MAX));
        AggKey(num_keys as u16)
    }

    pub fn is_total(self, num_keys: usize) -> bool {
        self.0 as usize == num_keys
    }
}

/// How per-asset loss variances combine inside an aggregation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// Independent losses: variances add.
    #[default]
    Uncorrelated,
    /// Perfectly dependent losses: standard deviations add.
    FullyCorrelated,
}

impl Correlation {
    /// `asset_correlation` flag as written in job files (0 or 1).
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Correlation::Uncorrelated),
            1 => Some(Correlation::FullyCorrelated),
            _ => None,
        }
    }

    pub fn is_correlated(self) -> bool {
        matches!(self, Correlation::FullyCorrelated)
    }
}

/// What the event-loss table carries, chosen once per run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutputMode {
    /// Mean loss and variance per event and key.
    #[default]
    Risk,
    /// Expected number of assets in each damage state per event and key.
    Damage { damage_states: Vec<String> },
}

impl OutputMode {
    /// Names of the value columns following `event_id, agg_id, loss_id`.
    pub fn value_columns(&self) -> Vec<String> {
        match self {
            OutputMode::Risk => vec!["loss".to_string(), "variance".to_string()],
            OutputMode::Damage { damage_states } => damage_states.clone(),
        }
    }
}
