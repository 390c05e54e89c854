use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::types::{AggKey, AssetId, SiteId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub ordinal: AssetId,
    pub taxonomy: String,
    pub site_id: SiteId,
    /// Replacement value per primary loss type, aligned with the model's loss types.
    pub values: Vec<f64>,
    /// Aggregation group when aggregation-by-tag is configured.
    pub kid: Option<AggKey>,
    /// Policy terms, as fractions of the asset value. Only read for insured losses.
    #[serde(default)]
    pub deductible: f64,
    #[serde(default = "full_limit")]
    pub insurance_limit: f64,
}

fn full_limit() -> f64 {
    1.0
}

/// Ordinals of the assets of one taxonomy together with the sites they sit on.
#[derive(Debug, Clone)]
pub struct TaxonomyGroup {
    pub taxonomy: String,
    pub aids: Vec<AssetId>,
    pub sites: HashSet<SiteId>,
}

/// The read-only asset table shared by every task.
#[derive(Debug, Clone, Default)]
pub struct AssetCollection {
    assets: Vec<Asset>,
    /// Names of the explicit aggregation keys; `K = agg_keys.len()`.
    agg_keys: Vec<String>,
}

impl AssetCollection {
    /// Assets must be stored in ordinal order (`assets[i].ordinal == i`);
    /// see `validate_ordinals`.
    pub fn new(assets: Vec<Asset>, agg_keys: Vec<String>) -> Self {
        AssetCollection { assets, agg_keys }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn get(&self, aid: AssetId) -> Option<&Asset> {
        self.assets.get(aid.0 as usize)
    }

    /// Number of explicit aggregation keys (`K`).
    pub fn num_keys(&self) -> usize {
        self.agg_keys.len()
    }

    pub fn agg_keys(&self) -> &[String] {
        &self.agg_keys
    }

    /// Aggregation key per asset ordinal, or empty when no aggregation is configured.
    pub fn kids(&self) -> Vec<Option<AggKey>> {
        if self.agg_keys.is_empty() {
            return Vec::new();
        }
        self.assets.iter().map(|a| a.kid).collect()
    }

    /// Assets grouped by taxonomy, in taxonomy order so task output is stable.
    pub fn by_taxonomy(&self) -> Vec<TaxonomyGroup> {
        let mut groups: BTreeMap<&str, TaxonomyGroup> = BTreeMap::new();
        for asset in &self.assets {
            let group = groups.entry(asset.taxonomy.as_str()).or_insert_with(|| TaxonomyGroup {
                taxonomy: asset.taxonomy.clone(),
                aids: Vec::new(),
                sites: HashSet::new(),
            });
            group.aids.push(asset.ordinal);
            group.sites.insert(asset.site_id);
        }
        groups.into_values().collect()
    }

    /// Every asset must carry a key in `0..K` once aggregation is configured,
    /// otherwise the explicit keys would not add up to the total.
    pub fn validate_keys(&self) -> Result<(), ConfigError> {
        let k = self.num_keys();
        if k == 0 {
            return Ok(());
        }
        // The total key `K` is stored as a u16 too.
        if k > usize::from(u16::MAX) {
            return Err(ConfigError::TooManyAggKeys(k));
        }
        for asset in &self.assets {
            match asset.kid {
                None => return Err(ConfigError::MissingAggKey { asset: asset.ordinal.0 }),
                Some(kid) if kid.0 as usize >= k => {
                    return Err(ConfigError::AggKeyOutOfRange {
                        asset: asset.ordinal.0,
                        kid: kid.0,
                        num_keys: k,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Ordinals must equal positions: they index every per-asset array.
    pub fn validate_ordinals(&self) -> Result<(), ConfigError> {
        match self.assets.iter().enumerate().find(|(i, a)| a.ordinal.0 as usize != *i) {
            Some((position, a)) => Err(ConfigError::AssetOrdinal { position, ordinal: a.ordinal.0 }),
            None => Ok(()),
        }
    }

    /// Every asset needs one value per primary loss type.
    pub fn validate_values(&self, num_loss_types: usize) -> Result<(), ConfigError> {
        match self.assets.iter().find(|a| a.values.len() != num_loss_types) {
            Some(a) => Err(ConfigError::AssetValues {
                asset: a.ordinal.0,
                expected: num_loss_types,
                got: a.values.len(),
            }),
            None => Ok(()),
        }
    }
}
