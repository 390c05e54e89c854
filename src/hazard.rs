use std::io::{BufRead, Write};

use rand::Rng;
use rand_distr::{Distribution, LogNormal, Poisson, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::rng::rupture_rng;
use crate::store::StoreError;
use crate::types::{EventId, RlzId, RuptureId, SiteId, TaskNo};

/// One ground-motion row: the intensity at one site during one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmfRecord {
    pub site_id: SiteId,
    pub event_id: EventId,
    /// One value per intensity measure type, aligned with `GmfTable::imts`.
    pub gmvs: Vec<f32>,
}

/// Pre-computed ground-motion fields, stored in runs of constant event id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GmfTable {
    pub imts: Vec<String>,
    pub rows: Vec<GmfRecord>,
}

impl GmfTable {
    pub fn new(imts: Vec<String>, rows: Vec<GmfRecord>) -> Self {
        GmfTable { imts, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn eids(&self) -> Vec<EventId> {
        self.rows.iter().map(|r| r.event_id).collect()
    }

    /// Stable sort by event id; restores the run layout for unordered input.
    pub fn sort_by_event(&mut self) {
        self.rows.sort_by_key(|r| r.event_id);
    }

    /// Read NDJSON rows as written by `write_ndjson`.
    pub fn read_ndjson(imts: Vec<String>, reader: impl BufRead) -> Result<Self, StoreError> {
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str::<GmfRecord>(&line)?);
        }
        Ok(GmfTable { imts, rows })
    }

    pub fn write_ndjson(&self, mut writer: impl Write) -> Result<(), StoreError> {
        for row in &self.rows {
            serde_json::to_writer(&mut writer, row)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Realization of every event, indexed by event id (`0..E`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Events {
    pub rlz_ids: Vec<RlzId>,
    pub num_rlzs: usize,
}

impl Events {
    pub fn new(rlz_ids: Vec<RlzId>, num_rlzs: usize) -> Self {
        Events { rlz_ids, num_rlzs }
    }

    pub fn len(&self) -> usize {
        self.rlz_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rlz_ids.is_empty()
    }

    pub fn rlz_of(&self, eid: EventId) -> RlzId {
        self.rlz_ids[eid.0 as usize]
    }

    /// Every realization id must fall in `0..num_rlzs`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.rlz_ids.iter().position(|r| r.0 as usize >= self.num_rlzs) {
            Some(i) => Err(ConfigError::RlzOutOfRange {
                eid: i as u32,
                rlz: self.rlz_ids[i].0,
                num_rlzs: self.num_rlzs,
            }),
            None => Ok(()),
        }
    }

    /// The first event id of `eids` missing from the table, if any.
    pub fn find_unknown(&self, eids: impl IntoIterator<Item = EventId>) -> Option<EventId> {
        eids.into_iter().find(|e| e.0 as usize >= self.len())
    }

    /// Number of events per realization.
    pub fn per_rlz(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.num_rlzs];
        for r in &self.rlz_ids {
            counts[r.0 as usize] += 1;
        }
        counts
    }
}

/// A point on the site grid, in kilometres from the grid origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub x_km: f64,
    pub y_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuptureSite {
    pub site_id: SiteId,
    pub distance_km: f64,
}

/// A rupture and the events it produces (`first_eid .. first_eid + n_occ`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rupture {
    pub id: RuptureId,
    pub rlz_id: RlzId,
    pub first_eid: EventId,
    pub n_occ: u32,
    pub sites: Vec<RuptureSite>,
    /// Median intensity at zero distance, per IMT.
    pub median: Vec<f64>,
    /// Log-space standard deviation of the intra-event residual.
    pub sigma: f64,
}

impl Rupture {
    /// Cost proxy: the number of GMF rows the rupture can produce.
    pub fn weight(&self) -> u64 {
        self.sites.len() as u64 * u64::from(self.n_occ)
    }

    pub fn eids(&self) -> impl Iterator<Item = EventId> + '_ {
        (0..self.n_occ).map(|i| EventId(self.first_eid.0 + i))
    }
}

/// Per-rupture hazard diagnostics reported by rupture-based tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmfInfo {
    pub rup_id: RuptureId,
    pub task_no: TaskNo,
    pub nsites: u32,
    pub gmf_bytes: u64,
    pub elapsed_secs: f64,
}

/// The hazard engine as seen by risk tasks.
pub trait GmfComputer: Send + Sync {
    fn imts(&self) -> &[String];

    /// GMF rows of every occurrence of `rupture`, grouped by event.
    /// Rows below the intensity threshold are dropped.
    fn compute(&self, rupture: &Rupture) -> Vec<GmfRecord>;
}

/// Log-normal ground motion decaying with distance. Not a ground-motion model;
/// it only feeds the risk pipeline with plausible, reproducible intensities.
#[derive(Debug, Clone)]
pub struct SyntheticGmfComputer {
    pub imts: Vec<String>,
    pub master_seed: u64,
    /// Per-IMT threshold; a row is kept if any IMT reaches its threshold.
    /// Empty means no threshold.
    pub min_iml: Vec<f64>,
    /// Distance (km) at which the median intensity halves.
    pub half_distance_km: f64,
}

impl GmfComputer for SyntheticGmfComputer {
    fn imts(&self) -> &[String] {
        &self.imts
    }

    fn compute(&self, rupture: &Rupture) -> Vec<GmfRecord> {
        let mut rng = rupture_rng(self.master_seed, rupture.id);
        let mut rows = Vec::with_capacity(rupture.weight() as usize);
        for eid in rupture.eids() {
            // Inter-event term shared by every site of this occurrence.
            let between: f64 = rng.sample(StandardNormal);
            for site in &rupture.sites {
                let within: f64 = rng.sample(StandardNormal);
                let attenuation = self.half_distance_km / (self.half_distance_km + site.distance_km);
                let gmvs: Vec<f32> = rupture
                    .median
                    .iter()
                    .map(|m| {
                        let ln_gmv = (m * attenuation).ln() + rupture.sigma * (0.5 * between + within);
                        ln_gmv.exp() as f32
                    })
                    .collect();
                let above = self.min_iml.is_empty()
                    || gmvs.iter().zip(&self.min_iml).any(|(&g, &min)| f64::from(g) >= min);
                if above {
                    rows.push(GmfRecord { site_id: site.site_id, event_id: eid, gmvs });
                }
            }
        }
        rows
    }
}

/// Parameters of the synthetic rupture catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogueConfig {
    pub num_rlzs: usize,
    /// Poisson λ: expected ruptures per realization and year.
    pub annual_rate: f64,
    /// Ln-space parameters of the zero-distance median intensity.
    pub median_mu: f64,
    pub median_sigma: f64,
    pub gmv_sigma: f64,
    pub max_distance_km: f64,
    pub num_imts: usize,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        CatalogueConfig {
            num_rlzs: 2,
            annual_rate: 0.4,
            median_mu: -1.6, // exp(-1.6) ≈ 0.2 g
            median_sigma: 0.6,
            gmv_sigma: 0.5,
            max_distance_km: 60.0,
            num_imts: 1,
        }
    }
}

/// Draw a rupture catalogue over `sites` and number its events densely.
///
/// Each realization runs an independent Poisson process over `years`
/// (investigation time × stochastic event sets). A rupture occurs
/// `n_occ ≥ 1` times and touches the sites within `max_distance_km` of a
/// uniformly drawn epicentre. Ruptures touching no site are discarded.
pub fn generate_ruptures(
    config: &CatalogueConfig,
    sites: &[Site],
    years: f64,
    rng: &mut impl Rng,
) -> (Vec<Rupture>, Events) {
    let (x_max, y_max) = sites
        .iter()
        .fold((0.0_f64, 0.0_f64), |(x, y), s| (x.max(s.x_km), y.max(s.y_km)));
    let lambda = config.annual_rate * years;
    let median = LogNormal::new(config.median_mu, config.median_sigma)
        .expect("invalid median LogNormal params");

    let mut ruptures = Vec::new();
    let mut rlz_ids = Vec::new();
    let mut next_rup = 0u32;

    for rlz in 0..config.num_rlzs {
        let n = if lambda > 0.0 {
            Poisson::new(lambda).expect("invalid Poisson lambda").sample(rng) as u64
        } else {
            0
        };
        for _ in 0..n {
            let x = rng.random_range(0.0..=x_max.max(1.0));
            let y = rng.random_range(0.0..=y_max.max(1.0));
            let touched: Vec<RuptureSite> = sites
                .iter()
                .filter_map(|s| {
                    let d = ((s.x_km - x).powi(2) + (s.y_km - y).powi(2)).sqrt();
                    (d <= config.max_distance_km).then_some(RuptureSite { site_id: s.id, distance_km: d })
                })
                .collect();
            if touched.is_empty() {
                continue;
            }
            let n_occ = rng.random_range(1..=3u32);
            let m: f64 = median.sample(rng);
            let first_eid = EventId(rlz_ids.len() as u32);
            rlz_ids.extend(std::iter::repeat_n(RlzId(rlz as u16), n_occ as usize));
            ruptures.push(Rupture {
                id: RuptureId(next_rup),
                rlz_id: RlzId(rlz as u16),
                first_eid,
                n_occ,
                sites: touched,
                median: vec![m; config.num_imts.max(1)],
                sigma: config.gmv_sigma,
            });
            next_rup += 1;
        }
    }

    (ruptures, Events::new(rlz_ids, config.num_rlzs))
}

/// Materialize the GMFs of a whole catalogue (the precomputed-hazard path).
pub fn compute_gmf_table(ruptures: &[Rupture], computer: &dyn GmfComputer) -> GmfTable {
    let rows = ruptures.iter().flat_map(|r| computer.compute(r)).collect();
    GmfTable::new(computer.imts().to_vec(), rows)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn grid(n: u32, spacing: f64) -> Vec<Site> {
        (0..n * n)
            .map(|i| Site {
                id: SiteId(i),
                x_km: f64::from(i % n) * spacing,
                y_km: f64::from(i / n) * spacing,
            })
            .collect()
    }

    fn computer(min_iml: f64) -> SyntheticGmfComputer {
        SyntheticGmfComputer {
            imts: vec!["PGA".to_string()],
            master_seed: 42,
            min_iml: vec![min_iml],
            half_distance_km: 20.0,
        }
    }

    fn rupture(n_occ: u32) -> Rupture {
        Rupture {
            id: RuptureId(0),
            rlz_id: RlzId(0),
            first_eid: EventId(10),
            n_occ,
            sites: vec![
                RuptureSite { site_id: SiteId(0), distance_km: 5.0 },
                RuptureSite { site_id: SiteId(1), distance_km: 15.0 },
            ],
            median: vec![0.3],
            sigma: 0.5,
        }
    }

    #[test]
    fn rupture_weight_counts_potential_rows() {
        assert_eq!(rupture(3).weight(), 6);
        let eids: Vec<EventId> = rupture(3).eids().collect();
        assert_eq!(eids, vec![EventId(10), EventId(11), EventId(12)]);
    }

    #[test]
    fn computed_rows_are_grouped_by_event() {
        let rows = computer(0.0).compute(&rupture(3));
        assert_eq!(rows.len(), 6);
        let eids: Vec<u32> = rows.iter().map(|r| r.event_id.0).collect();
        assert_eq!(eids, vec![10, 10, 11, 11, 12, 12]);
    }

    #[test]
    fn threshold_drops_weak_motion() {
        let rows = computer(1e9).compute(&rupture(3));
        assert!(rows.is_empty());
    }

    #[test]
    fn empty_threshold_keeps_every_row() {
        let unbounded = SyntheticGmfComputer { min_iml: vec![], ..computer(0.0) };
        assert_eq!(unbounded.compute(&rupture(2)).len(), 4);
    }

    #[test]
    fn computation_is_reproducible() {
        let a = computer(0.0).compute(&rupture(2));
        let b = computer(0.0).compute(&rupture(2));
        assert_eq!(a, b);
    }

    #[test]
    fn catalogue_events_are_dense_and_disjoint() {
        let sites = grid(5, 10.0);
        let config = CatalogueConfig { annual_rate: 0.5, ..CatalogueConfig::default() };
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let (ruptures, events) = generate_ruptures(&config, &sites, 50.0, &mut rng);
        assert!(!ruptures.is_empty(), "expected ruptures with λ=25");

        let mut next = 0u32;
        for r in &ruptures {
            assert_eq!(r.first_eid.0, next, "event ids must be dense in rupture order");
            for eid in r.eids() {
                assert_eq!(events.rlz_of(eid), r.rlz_id);
            }
            next += r.n_occ;
        }
        assert_eq!(events.len(), next as usize);
        assert_eq!(events.per_rlz().iter().sum::<u32>(), next);
    }

    #[test]
    fn events_with_unknown_rlz_are_invalid() {
        let events = Events { rlz_ids: vec![RlzId(0), RlzId(3)], num_rlzs: 2 };
        assert_eq!(events.validate(), Err(ConfigError::RlzOutOfRange { eid: 1, rlz: 3, num_rlzs: 2 }));
        assert!(Events::new(vec![RlzId(1)], 2).validate().is_ok());
        assert_eq!(events.find_unknown(rupture(3).eids()), Some(EventId(10)));
        assert_eq!(events.find_unknown([EventId(1)]), None);
    }

    #[test]
    fn ndjson_rows_read_back() {
        let table = compute_gmf_table(&[rupture(2)], &computer(0.0));
        let mut buf = Vec::new();
        table.write_ndjson(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(text.lines().count(), table.len());
        let back = GmfTable::read_ndjson(table.imts.clone(), buf.as_slice()).unwrap();
        assert_eq!(back.eids(), table.eids());
        for (a, b) in back.rows.iter().zip(&table.rows) {
            assert_eq!(a.site_id, b.site_id);
            assert!((a.gmvs[0] - b.gmvs[0]).abs() <= 1e-6 * b.gmvs[0].abs());
        }
    }

    #[test]
    fn sort_by_event_restores_runs() {
        let mut table = GmfTable::new(
            vec!["PGA".into()],
            vec![
                GmfRecord { site_id: SiteId(0), event_id: EventId(2), gmvs: vec![0.1] },
                GmfRecord { site_id: SiteId(0), event_id: EventId(1), gmvs: vec![0.2] },
                GmfRecord { site_id: SiteId(1), event_id: EventId(2), gmvs: vec![0.3] },
            ],
        );
        table.sort_by_event();
        assert_eq!(table.eids(), vec![EventId(1), EventId(2), EventId(2)]);
        assert_eq!(table.rows[1].gmvs, vec![0.1]);
    }
}
