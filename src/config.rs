use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hazard::CatalogueConfig;
use crate::types::{Correlation, OutputMode};
use crate::vulnerability::{FragilityFunction, FragilityModel, VulnerabilityFunction, VulnerabilityModel};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("concurrent_tasks must be at least 1")]
    ZeroTasks,
    #[error("max_weight must be positive")]
    ZeroMaxWeight,
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error(
        "The event loss table is too big to be transferred with {num_tasks} tasks \
         ({bytes_per_task} bytes per task, ceiling {ceiling})"
    )]
    CapacityExceeded { num_tasks: u32, bytes_per_task: u64, ceiling: u64 },
    #[error("asset {asset} has no aggregation key")]
    MissingAggKey { asset: u32 },
    #[error("asset {asset} has aggregation key {kid}, only {num_keys} keys are defined")]
    AggKeyOutOfRange { asset: u32, kid: u16, num_keys: usize },
    #[error("asset {asset} has {got} values, expected one per loss type ({expected})")]
    AssetValues { asset: u32, expected: usize, got: usize },
    #[error("event {0} has no realization in the event table")]
    UnknownEvent(u32),
    #[error("event {eid} belongs to realization {rlz}, only {num_rlzs} realizations are defined")]
    RlzOutOfRange { eid: u32, rlz: u16, num_rlzs: usize },
    #[error("asset at position {position} has ordinal {ordinal}; ordinals must be dense and in order")]
    AssetOrdinal { position: usize, ordinal: u32 },
    #[error("too many aggregation keys ({0}); at most 65535 are supported")]
    TooManyAggKeys(usize),
    #[error("unknown loss type {0}")]
    UnknownLossType(String),
    #[error("avg_losses is not supported in damage mode")]
    AvgLossesInDamageMode,
    #[error("insured_losses is not supported in damage mode")]
    InsuredLossesInDamageMode,
    #[error("damage states {expected:?} do not match the fragility model's {got:?}")]
    DamageStates { expected: Vec<String>, got: Vec<String> },
    #[error("too many loss types ({0}); at most 256 are supported")]
    TooManyLossTypes(usize),
    #[error("cannot read config {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Knobs of one risk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Number of tasks the hazard is spread over.
    pub concurrent_tasks: u32,
    /// Explicit per-task weight bound; derived from `concurrent_tasks` when unset.
    pub max_weight: Option<u64>,
    /// Weight above which a rupture block is split into sub-tasks.
    pub ebrisk_maxsize: u64,
    /// Worker threads; 0 lets rayon decide.
    pub num_workers: usize,
    pub correlation: Correlation,
    pub master_seed: u64,
    /// Return mean losses instead of sampling.
    pub ignore_master_seed: bool,
    pub task_ceiling_bytes: u64,
    /// Bytes of one event-loss entry in the capacity estimate.
    pub bytes_per_row: u64,
    /// Collapse all realizations into one when averaging.
    pub collect_rlzs: bool,
    pub avg_losses: bool,
    pub insured_losses: bool,
    /// Losses below the threshold (per loss type) are discarded before aggregation.
    pub minimum_asset_loss: BTreeMap<String, f64>,
    /// Threshold on events × assets above which a large-run warning is logged.
    pub max_potential_gmfs: u64,
    /// Years covered by one stochastic event set; `None` for scenarios.
    pub investigation_time: Option<f64>,
    pub risk_investigation_time: Option<f64>,
    pub ses_per_logic_tree_path: u32,
    pub output_mode: OutputMode,
}

impl Default for RiskParams {
    fn default() -> Self {
        RiskParams {
            concurrent_tasks: 16,
            max_weight: None,
            ebrisk_maxsize: 2_000,
            num_workers: 0,
            correlation: Correlation::Uncorrelated,
            master_seed: 42,
            ignore_master_seed: false,
            task_ceiling_bytes: 1 << 32,
            bytes_per_row: 4,
            collect_rlzs: false,
            avg_losses: true,
            insured_losses: false,
            minimum_asset_loss: BTreeMap::new(),
            max_potential_gmfs: 200_000_000_000,
            investigation_time: Some(50.0),
            risk_investigation_time: None,
            ses_per_logic_tree_path: 1,
            output_mode: OutputMode::Risk,
        }
    }
}

impl RiskParams {
    /// Scale from simulated years to the reporting period, `None` for scenarios.
    pub fn time_ratio(&self) -> Option<f64> {
        let it = self.investigation_time?;
        let risk_it = self.risk_investigation_time.unwrap_or(it);
        Some(risk_it / (it * f64::from(self.ses_per_logic_tree_path.max(1))))
    }

    pub fn is_scenario(&self) -> bool {
        self.investigation_time.is_none()
    }

    /// Loss-type names of the run: primary types, then `<lt>_ins` when insured losses are on.
    pub fn loss_type_names(&self, primary: &[String]) -> Vec<String> {
        let mut names = primary.to_vec();
        if self.insured_losses {
            names.extend(primary.iter().map(|lt| format!("{lt}_ins")));
        }
        names
    }

    /// Minimum loss per loss-type index of `names`, 0 where none is set.
    pub fn minimum_losses(&self, names: &[String]) -> Vec<f64> {
        names
            .iter()
            .map(|lt| self.minimum_asset_loss.get(lt).copied().unwrap_or(0.0))
            .collect()
    }

    /// Checks that need nothing but the parameters and the model's loss types.
    pub fn validate(&self, loss_types: &[String]) -> Result<(), ConfigError> {
        if self.concurrent_tasks == 0 {
            return Err(ConfigError::ZeroTasks);
        }
        if self.max_weight == Some(0) || self.ebrisk_maxsize == 0 {
            return Err(ConfigError::ZeroMaxWeight);
        }
        if self.task_ceiling_bytes == 0 {
            return Err(ConfigError::NonPositive { field: "task_ceiling_bytes", value: 0.0 });
        }
        if self.bytes_per_row == 0 {
            return Err(ConfigError::NonPositive { field: "bytes_per_row", value: 0.0 });
        }
        for (field, value) in [
            ("investigation_time", self.investigation_time),
            ("risk_investigation_time", self.risk_investigation_time),
        ] {
            if let Some(v) = value.filter(|v| !(*v > 0.0)) {
                return Err(ConfigError::NonPositive { field, value: v });
            }
        }
        let names = self.loss_type_names(loss_types);
        if names.len() > usize::from(u8::MAX) + 1 {
            return Err(ConfigError::TooManyLossTypes(names.len()));
        }
        if let Some(lt) = self.minimum_asset_loss.keys().find(|lt| !names.contains(lt)) {
            return Err(ConfigError::UnknownLossType(lt.clone()));
        }
        if let OutputMode::Damage { .. } = self.output_mode {
            if self.avg_losses {
                return Err(ConfigError::AvgLossesInDamageMode);
            }
            if self.insured_losses {
                return Err(ConfigError::InsuredLossesInDamageMode);
            }
        }
        Ok(())
    }
}

/// Per-taxonomy asset template laid on every site of the portfolio grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyTemplate {
    pub taxonomy: String,
    /// Replacement value per primary loss type.
    pub values: Vec<f64>,
    #[serde(default)]
    pub deductible: f64,
    #[serde(default = "full_limit")]
    pub insurance_limit: f64,
}

fn full_limit() -> f64 {
    1.0
}

/// Synthetic portfolio: a square site grid with one asset per taxonomy per site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub grid_size: u32,
    pub spacing_km: f64,
    pub taxonomies: Vec<TaxonomyTemplate>,
    /// Aggregation keys assigned by west-to-east bands of the grid; empty disables aggregation by tag.
    pub agg_keys: Vec<String>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        RiskConfig::canonical().portfolio
    }
}

/// Everything a run needs apart from the hazard itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub params: RiskParams,
    pub portfolio: PortfolioConfig,
    pub catalogue: CatalogueConfig,
    pub imts: Vec<String>,
    /// Per-IMT intensity below which GMF rows are dropped.
    pub min_iml: Vec<f64>,
    pub half_distance_km: f64,
    pub vulnerability: VulnerabilityModel,
    pub fragility: FragilityModel,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::canonical()
    }
}

impl RiskConfig {
    pub fn canonical() -> Self {
        // ── Vulnerability curves ──────────────────────────────────────────────
        // Illustrative shapes only: concrete frames fare better than timber
        // at low intensity and worse once the frame yields.
        let pga = "PGA".to_string();
        let imls = vec![0.05, 0.2, 0.4, 0.7, 1.0, 1.5];

        let rc = VulnerabilityFunction {
            imt: pga.clone(),
            imls: imls.clone(),
            mean_lrs: vec![0.0, 0.04, 0.15, 0.40, 0.65, 0.85],
            covs: vec![0.0, 0.40, 0.30, 0.25, 0.20, 0.10],
        };
        let wood = VulnerabilityFunction {
            imt: pga.clone(),
            imls: imls.clone(),
            mean_lrs: vec![0.01, 0.06, 0.18, 0.35, 0.55, 0.75],
            covs: vec![0.50, 0.40, 0.35, 0.30, 0.25, 0.15],
        };
        let nonstructural = VulnerabilityFunction {
            imt: pga.clone(),
            imls: imls.clone(),
            mean_lrs: vec![0.02, 0.10, 0.30, 0.55, 0.75, 0.90],
            covs: vec![0.50, 0.40, 0.30, 0.20, 0.15, 0.10],
        };

        let vulnerability = VulnerabilityModel {
            loss_types: vec!["structural".to_string(), "nonstructural".to_string()],
            functions: BTreeMap::from([
                ("RC".to_string(), vec![rc, nonstructural.clone()]),
                ("W".to_string(), vec![wood, nonstructural]),
            ]),
        };

        // ── Fragility curves (damage mode) ───────────────────────────────────
        let fragility_imls = vec![0.05, 0.2, 0.4, 0.8, 1.5];
        let fragility = FragilityModel {
            loss_types: vec!["structural".to_string()],
            damage_states: ["no_damage", "moderate", "complete"].map(String::from).to_vec(),
            functions: BTreeMap::from([
                (
                    "RC".to_string(),
                    FragilityFunction {
                        imt: pga.clone(),
                        imls: fragility_imls.clone(),
                        poes: vec![vec![0.0, 0.2, 0.6, 0.9, 1.0], vec![0.0, 0.02, 0.15, 0.5, 0.85]],
                    },
                ),
                (
                    "W".to_string(),
                    FragilityFunction {
                        imt: pga.clone(),
                        imls: fragility_imls,
                        poes: vec![vec![0.05, 0.3, 0.7, 0.95, 1.0], vec![0.0, 0.05, 0.2, 0.55, 0.9]],
                    },
                ),
            ]),
        };

        RiskConfig {
            // Average losses per year of exposure.
            params: RiskParams { risk_investigation_time: Some(1.0), ..RiskParams::default() },
            // ── Portfolio: 10 × 10 grid, 5 km apart, two taxonomies per site ──
            // Values in thousands of currency units.
            portfolio: PortfolioConfig {
                grid_size: 10,
                spacing_km: 5.0,
                taxonomies: vec![
                    TaxonomyTemplate {
                        taxonomy: "RC".to_string(),
                        values: vec![2_000.0, 800.0],
                        deductible: 0.05,
                        insurance_limit: 0.6,
                    },
                    TaxonomyTemplate {
                        taxonomy: "W".to_string(),
                        values: vec![500.0, 150.0],
                        deductible: 0.02,
                        insurance_limit: 0.8,
                    },
                ],
                agg_keys: vec!["west".to_string(), "east".to_string()],
            },
            catalogue: CatalogueConfig::default(),
            imts: vec![pga],
            min_iml: vec![0.05],
            half_distance_km: 15.0,
            vulnerability,
            fragility,
        }
    }

    /// Load a JSON file; absent fields keep their canonical values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))
    }

    /// Years simulated per realization.
    pub fn years(&self) -> f64 {
        self.params.investigation_time.unwrap_or(1.0)
            * f64::from(self.params.ses_per_logic_tree_path.max(1))
    }

    /// Cross-section checks, on top of `RiskParams::validate`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.params.output_mode {
            OutputMode::Risk => self.params.validate(&self.vulnerability.loss_types),
            OutputMode::Damage { damage_states } => {
                if damage_states != &self.fragility.damage_states {
                    return Err(ConfigError::DamageStates {
                        expected: damage_states.clone(),
                        got: self.fragility.damage_states.clone(),
                    });
                }
                self.params.validate(&self.fragility.loss_types)
            }
        }
    }
}
