//! Risk model interface and the piecewise-linear reference model.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exposure::{Asset, AssetCollection};
use crate::hazard::GmfRecord;
use crate::rng::EventRng;
use crate::types::{AssetId, Correlation, EventId, SiteId};

#[derive(Debug, Error, PartialEq)]
pub enum RiskModelError {
    #[error("no {kind} function for taxonomy {taxonomy}")]
    MissingFunction { kind: &'static str, taxonomy: String },
    #[error("taxonomy {taxonomy} needs IMT {imt}, not present in the hazard")]
    MissingImt { taxonomy: String, imt: String },
    #[error("asset {asset} has no value for loss type #{loss_type}")]
    MissingValue { asset: u32, loss_type: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub event_id: EventId,
    pub asset_id: AssetId,
    pub loss: f64,
    pub variance: f64,
}

/// Probability of each damage state for one asset in one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRecord {
    pub event_id: EventId,
    pub asset_id: AssetId,
    pub fractions: Vec<f64>,
}

/// Output of the model for one loss type.
#[derive(Debug, Clone, PartialEq)]
pub enum LossOutput {
    Losses(Vec<LossRecord>),
    Damages(Vec<DamageRecord>),
}

impl LossOutput {
    pub fn len(&self) -> usize {
        match self {
            LossOutput::Losses(r) => r.len(),
            LossOutput::Damages(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LossOutput::Losses(_) => "losses",
            LossOutput::Damages(_) => "damages",
        }
    }
}

/// Hazard rows restricted to the sites of one taxonomy.
#[derive(Debug, Clone)]
pub struct HazardBatch<'a> {
    pub imts: &'a [String],
    pub rows: Vec<&'a GmfRecord>,
}

impl<'a> HazardBatch<'a> {
    /// Keep only the rows of `rows` that fall on one of `sites`.
    pub fn filter(
        imts: &'a [String],
        rows: &'a [GmfRecord],
        mut on_site: impl FnMut(SiteId) -> bool,
    ) -> Self {
        HazardBatch { imts, rows: rows.iter().filter(|r| on_site(r.site_id)).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn imt_index(&self, imt: &str) -> Option<usize> {
        self.imts.iter().position(|i| i == imt)
    }
}

/// The vulnerability/fragility layer as seen by risk tasks.
pub trait RiskModel: Send + Sync {
    /// Primary loss types; outputs of `evaluate` follow this order.
    fn loss_types(&self) -> &[String];

    /// Loss records (or damage distributions) for the assets of one taxonomy.
    ///
    /// `rng` is `None` when sampling is disabled; the model then returns
    /// mean losses.
    fn evaluate(
        &self,
        taxonomy: &str,
        assets: &[&Asset],
        hazard: &HazardBatch<'_>,
        correlation: Correlation,
        rng: Option<&EventRng>,
    ) -> Result<Vec<LossOutput>, RiskModelError>;
}

/// Interpolate `ys` over `xs` at `x`; zero below the first point, flat above the last.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    match xs.iter().position(|&xi| xi > x) {
        Some(0) => 0.0,
        Some(i) => {
            let (x0, x1) = (xs[i - 1], xs[i]);
            let (y0, y1) = (ys[i - 1], ys[i]);
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        }
        None => ys.last().copied().unwrap_or(0.0),
    }
}

/// Mean loss ratio and its coefficient of variation against intensity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityFunction {
    pub imt: String,
    /// Increasing intensity levels.
    pub imls: Vec<f64>,
    pub mean_lrs: Vec<f64>,
    pub covs: Vec<f64>,
}

impl VulnerabilityFunction {
    pub fn mean_loss_ratio(&self, iml: f64) -> f64 {
        interpolate(&self.imls, &self.mean_lrs, iml)
    }

    pub fn cov(&self, iml: f64) -> f64 {
        interpolate(&self.imls, &self.covs, iml)
    }

    /// Loss ratio for one draw. Log-normal around the mean, capped at 1.
    pub fn sample_ratio(&self, iml: f64, epsilon: f64) -> f64 {
        let mean = self.mean_loss_ratio(iml);
        let cov = self.cov(iml);
        if mean <= 0.0 || cov <= 0.0 {
            return mean;
        }
        let sigma = (1.0 + cov * cov).ln().sqrt();
        let mu = mean.ln() - sigma * sigma / 2.0;
        (mu + sigma * epsilon).exp().min(1.0)
    }
}

/// One vulnerability function per taxonomy and loss type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityModel {
    pub loss_types: Vec<String>,
    /// taxonomy → functions aligned with `loss_types`.
    pub functions: BTreeMap<String, Vec<VulnerabilityFunction>>,
}

/// Index the assets of a taxonomy by the site they sit on.
fn assets_by_site<'a>(assets: &[&'a Asset]) -> HashMap<SiteId, Vec<&'a Asset>> {
    let mut by_site: HashMap<SiteId, Vec<&Asset>> = HashMap::new();
    for &asset in assets {
        by_site.entry(asset.site_id).or_default().push(asset);
    }
    by_site
}

impl RiskModel for VulnerabilityModel {
    fn loss_types(&self) -> &[String] {
        &self.loss_types
    }

    fn evaluate(
        &self,
        taxonomy: &str,
        assets: &[&Asset],
        hazard: &HazardBatch<'_>,
        _correlation: Correlation,
        rng: Option<&EventRng>,
    ) -> Result<Vec<LossOutput>, RiskModelError> {
        let functions = self.functions.get(taxonomy).ok_or_else(|| {
            RiskModelError::MissingFunction { kind: "vulnerability", taxonomy: taxonomy.to_string() }
        })?;
        let by_site = assets_by_site(assets);

        let mut outputs = Vec::with_capacity(self.loss_types.len());
        for (lti, vf) in functions.iter().enumerate().take(self.loss_types.len()) {
            let m = hazard.imt_index(&vf.imt).ok_or_else(|| RiskModelError::MissingImt {
                taxonomy: taxonomy.to_string(),
                imt: vf.imt.clone(),
            })?;
            let mut records = Vec::new();
            for row in &hazard.rows {
                let Some(site_assets) = by_site.get(&row.site_id) else { continue };
                let iml = f64::from(row.gmvs[m]);
                let mean = vf.mean_loss_ratio(iml);
                let cov = vf.cov(iml);
                for asset in site_assets {
                    let value = *asset.values.get(lti).ok_or(RiskModelError::MissingValue {
                        asset: asset.ordinal.0,
                        loss_type: lti,
                    })?;
                    let ratio = match rng {
                        Some(rng) => vf.sample_ratio(iml, rng.epsilon(row.event_id, asset.ordinal)),
                        None => mean,
                    };
                    records.push(LossRecord {
                        event_id: row.event_id,
                        asset_id: asset.ordinal,
                        loss: ratio * value,
                        variance: (cov * mean * value).powi(2),
                    });
                }
            }
            outputs.push(LossOutput::Losses(records));
        }
        if outputs.len() < self.loss_types.len() {
            return Err(RiskModelError::MissingFunction {
                kind: "vulnerability",
                taxonomy: taxonomy.to_string(),
            });
        }
        Ok(outputs)
    }
}

/// Probabilities of exceeding each limit state against intensity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragilityFunction {
    pub imt: String,
    pub imls: Vec<f64>,
    /// One curve per limit state, from the mildest to the most severe.
    pub poes: Vec<Vec<f64>>,
}

impl FragilityFunction {
    /// Probability of sitting in each damage state, `no_damage` first.
    pub fn damage_fractions(&self, iml: f64) -> Vec<f64> {
        let exceed: Vec<f64> = self
            .poes
            .iter()
            .map(|curve| interpolate(&self.imls, curve, iml).clamp(0.0, 1.0))
            .collect();
        let mut fractions = Vec::with_capacity(exceed.len() + 1);
        let mut prev = 1.0;
        for &p in &exceed {
            fractions.push((prev - p).max(0.0));
            prev = p;
        }
        fractions.push(prev);
        fractions
    }
}

/// Fragility functions per taxonomy, applied identically to every loss type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragilityModel {
    pub loss_types: Vec<String>,
    /// Damage state names, `no_damage` first; one more than the limit states.
    pub damage_states: Vec<String>,
    pub functions: BTreeMap<String, FragilityFunction>,
}

impl RiskModel for FragilityModel {
    fn loss_types(&self) -> &[String] {
        &self.loss_types
    }

    fn evaluate(
        &self,
        taxonomy: &str,
        assets: &[&Asset],
        hazard: &HazardBatch<'_>,
        _correlation: Correlation,
        _rng: Option<&EventRng>,
    ) -> Result<Vec<LossOutput>, RiskModelError> {
        let ff = self.functions.get(taxonomy).ok_or_else(|| RiskModelError::MissingFunction {
            kind: "fragility",
            taxonomy: taxonomy.to_string(),
        })?;
        let m = hazard.imt_index(&ff.imt).ok_or_else(|| RiskModelError::MissingImt {
            taxonomy: taxonomy.to_string(),
            imt: ff.imt.clone(),
        })?;
        let by_site = assets_by_site(assets);
        let mut records = Vec::new();
        for row in &hazard.rows {
            let Some(site_assets) = by_site.get(&row.site_id) else { continue };
            let fractions = ff.damage_fractions(f64::from(row.gmvs[m]));
            for asset in site_assets {
                records.push(DamageRecord {
                    event_id: row.event_id,
                    asset_id: asset.ordinal,
                    fractions: fractions.clone(),
                });
            }
        }
        Ok(self.loss_types.iter().map(|_| LossOutput::Damages(records.clone())).collect())
    }
}

/// Losses retained by the insurer under each asset's deductible and limit.
///
/// `loss_type` selects the asset value the policy fractions apply to.
pub fn insured_losses(
    records: &[LossRecord],
    assets: &AssetCollection,
    loss_type: usize,
) -> Vec<LossRecord> {
    records
        .iter()
        .map(|r| {
            let (deductible, limit) = assets
                .get(r.asset_id)
                .and_then(|a| {
                    let value = *a.values.get(loss_type)?;
                    Some((a.deductible * value, a.insurance_limit * value))
                })
                .unwrap_or((0.0, 0.0));
            let insured = (r.loss - deductible).max(0.0).min((limit - deductible).max(0.0));
            let retained = if r.loss > 0.0 { insured / r.loss } else { 0.0 };
            LossRecord { loss: insured, variance: r.variance * retained * retained, ..*r }
        })
        .collect()
}
