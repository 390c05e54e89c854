//! Build a complete run (portfolio, catalogue, model, hazard) from a `RiskConfig`.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::info;

use crate::calculator::HazardInput;
use crate::config::{ConfigError, PortfolioConfig, RiskConfig};
use crate::exposure::{Asset, AssetCollection};
use crate::hazard::{Events, Rupture, Site, SyntheticGmfComputer, compute_gmf_table, generate_ruptures};
use crate::task::TaskContext;
use crate::types::{AggKey, AssetId, OutputMode, SiteId};
use crate::vulnerability::RiskModel;

/// Square grid of `grid_size²` sites, row-major from the origin.
pub fn site_grid(portfolio: &PortfolioConfig) -> Vec<Site> {
    let n = portfolio.grid_size;
    (0..n * n)
        .map(|i| Site {
            id: SiteId(i),
            x_km: f64::from(i % n) * portfolio.spacing_km,
            y_km: f64::from(i / n) * portfolio.spacing_km,
        })
        .collect()
}

/// One asset per taxonomy per site. Aggregation keys split the grid into
/// equal west-to-east bands.
pub fn build_portfolio(portfolio: &PortfolioConfig, sites: &[Site]) -> AssetCollection {
    let n = portfolio.grid_size.max(1);
    let num_keys = portfolio.agg_keys.len() as u32;
    let mut assets = Vec::with_capacity(sites.len() * portfolio.taxonomies.len());
    for site in sites {
        let column = site.id.0 % n;
        let kid = (num_keys > 0).then(|| AggKey((column * num_keys / n) as u16));
        for template in &portfolio.taxonomies {
            assets.push(Asset {
                ordinal: AssetId(assets.len() as u32),
                taxonomy: template.taxonomy.clone(),
                site_id: site.id,
                values: template.values.clone(),
                kid,
                deductible: template.deductible,
                insurance_limit: template.insurance_limit,
            });
        }
    }
    AssetCollection::new(assets, portfolio.agg_keys.clone())
}

/// A fully materialized synthetic run.
pub struct Scenario {
    pub config: RiskConfig,
    pub sites: Vec<Site>,
    pub assets: AssetCollection,
    pub ruptures: Vec<Rupture>,
    pub events: Events,
}

impl Scenario {
    /// Construct from a config; the catalogue is drawn from `params.master_seed`.
    pub fn from_config(config: RiskConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sites = site_grid(&config.portfolio);
        let assets = build_portfolio(&config.portfolio, &sites);
        let mut rng = ChaCha20Rng::seed_from_u64(config.params.master_seed);
        let (ruptures, events) = generate_ruptures(&config.catalogue, &sites, config.years(), &mut rng);
        info!(
            sites = sites.len(),
            assets = assets.len(),
            ruptures = ruptures.len(),
            events = events.len(),
            "built scenario"
        );
        Ok(Scenario { config, sites, assets, ruptures, events })
    }

    pub fn gmf_computer(&self) -> SyntheticGmfComputer {
        SyntheticGmfComputer {
            imts: self.config.imts.clone(),
            master_seed: self.config.params.master_seed,
            min_iml: self.config.min_iml.clone(),
            half_distance_km: self.config.half_distance_km,
        }
    }

    pub fn model(&self) -> Box<dyn RiskModel> {
        match self.config.params.output_mode {
            OutputMode::Risk => Box::new(self.config.vulnerability.clone()),
            OutputMode::Damage { .. } => Box::new(self.config.fragility.clone()),
        }
    }

    /// Hazard input for the run: either precomputed GMFs sorted by event,
    /// or the ruptures themselves.
    pub fn hazard(&self, from_ruptures: bool) -> HazardInput {
        let computer = self.gmf_computer();
        if from_ruptures {
            HazardInput::Ruptures { ruptures: self.ruptures.clone(), computer: Box::new(computer) }
        } else {
            let mut table = compute_gmf_table(&self.ruptures, &computer);
            table.sort_by_event();
            HazardInput::Gmfs(table)
        }
    }

    /// Consume the scenario into the context shared by the tasks.
    pub fn into_context(self) -> TaskContext {
        let model = self.model();
        TaskContext::new(self.assets, model, self.events, self.config.params)
    }
}
