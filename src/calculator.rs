//! The event-based risk calculator: plan tasks, dispatch, reduce, post-process.

use std::ops::Range;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::aggregate::AvgLosses;
use crate::capacity::{check_capacity, warn_if_large};
use crate::config::ConfigError;
use crate::error::RiskError;
use crate::hazard::{GmfComputer, GmfTable, Rupture};
use crate::monitor::PerformanceReport;
use crate::partition::{gmf_slices, max_weight_for, split_in_blocks};
use crate::scheduler::{RunSummary, Scheduler, TaskHandle};
use crate::store::{ColumnData, ColumnStore, ColumnType, Metadata, StoreError, StoredArray, TableSchema};
use crate::task::{TaskContext, TaskError, TaskOutput, ebrisk, event_based_risk, start_ebrisk};
use crate::types::{AggKey, EventId, LossTypeIdx, OutputMode, RlzId, TaskNo};

pub const AGG_LOSS_TABLE: &str = "agg_loss_table";
pub const GMF_INFO: &str = "gmf_info";
pub const TASK_INFO: &str = "task_info";
pub const AVG_LOSSES: &str = "avg_losses-rlzs";
pub const AGG_LOSSES: &str = "agg_losses-rlzs";

/// Where the hazard comes from.
pub enum HazardInput {
    /// Precomputed GMFs.
    Gmfs(GmfTable),
    /// Ruptures whose GMFs are computed inside the risk tasks.
    Ruptures { ruptures: Vec<Rupture>, computer: Box<dyn GmfComputer> },
}

/// The chunk of hazard one task works on.
#[derive(Debug, Clone)]
pub enum TaskUnit {
    /// Rows of the GMF table.
    Slice(Range<usize>),
    /// Outer rupture block, split again inside the task.
    RuptureBlock(Vec<Rupture>),
    /// Leaf rupture block.
    Ruptures(Vec<Rupture>),
}

/// Dense `(K + 1) × R × L` losses per aggregation key, the total key last.
#[derive(Debug, Clone, PartialEq)]
pub struct AggLosses {
    pub num_keys: usize,
    pub num_rlzs: usize,
    pub num_loss_types: usize,
    pub data: Vec<f64>,
}

impl AggLosses {
    fn zeros(num_keys: usize, num_rlzs: usize, num_loss_types: usize) -> Self {
        AggLosses {
            num_keys,
            num_rlzs,
            num_loss_types,
            data: vec![0.0; (num_keys + 1) * num_rlzs * num_loss_types],
        }
    }

    fn index(&self, kid: AggKey, rlz: RlzId, lti: LossTypeIdx) -> usize {
        ((kid.0 as usize) * self.num_rlzs + rlz.0 as usize) * self.num_loss_types + lti.0 as usize
    }

    pub fn get(&self, kid: AggKey, rlz: RlzId, lti: LossTypeIdx) -> f64 {
        self.data[self.index(kid, rlz, lti)]
    }

    /// Totals over the portfolio, `[rlz][loss_type]`.
    pub fn totals(&self) -> Vec<Vec<f64>> {
        let total = AggKey::total(self.num_keys);
        (0..self.num_rlzs)
            .map(|r| {
                (0..self.num_loss_types)
                    .map(|l| self.get(total, RlzId(r as u16), LossTypeIdx(l as u8)))
                    .collect()
            })
            .collect()
    }
}

/// What a finished run reports back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSummary {
    pub num_events: usize,
    pub num_tasks: u32,
    pub gmf_rows: u64,
    pub loss_rows: u64,
    pub loss_types: Vec<String>,
    pub avg_ratio: Vec<f64>,
    /// Scaled average losses summed over assets, `[rlz][loss_type]`.
    pub avg_totals: Option<Vec<Vec<f64>>>,
    pub agg_losses: Option<AggLosses>,
    /// `None` when the check does not apply to this run.
    pub consistent: Option<bool>,
    pub run: RunSummary,
}

/// `numpy.allclose` semantics.
fn all_close(a: &[f64], b: &[f64], rtol: f64) -> bool {
    const ATOL: f64 = 1e-8;
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= ATOL + rtol * y.abs())
}

/// Single-threaded owner of the outputs.
struct Reducer<S> {
    store: S,
    avg: Option<AvgLosses>,
    report: PerformanceReport,
    gmf_rows: u64,
    gmf_bytes: u64,
    loss_rows: u64,
}

impl<S: ColumnStore> Reducer<S> {
    fn apply(&mut self, task_no: TaskNo, output: TaskOutput) -> Result<(), RiskError> {
        match output {
            TaskOutput::AvgLosses(sparse) => {
                if let Some(avg) = self.avg.as_mut() {
                    let dropped = avg.add(&sparse);
                    if dropped > 0 {
                        warn!(task_no = task_no.0, dropped, "average-loss entries outside the asset/rlz range");
                    }
                }
            }
            TaskOutput::EventLosses(table) => {
                self.loss_rows += self.store.append_rows(AGG_LOSS_TABLE, table.into_columns())? as u64;
            }
            TaskOutput::GmfInfo(infos) => {
                self.gmf_bytes += infos.iter().map(|i| i.gmf_bytes).sum::<u64>();
                let columns = vec![
                    ColumnData::U32(infos.iter().map(|i| i.rup_id.0).collect()),
                    ColumnData::U32(infos.iter().map(|i| i.task_no.0).collect()),
                    ColumnData::U32(infos.iter().map(|i| i.nsites).collect()),
                    ColumnData::F64(infos.iter().map(|i| i.gmf_bytes as f64).collect()),
                    ColumnData::F64(infos.iter().map(|i| i.elapsed_secs).collect()),
                ];
                self.store.append_rows(GMF_INFO, columns)?;
            }
            TaskOutput::Diagnostics(info) => {
                self.gmf_rows += info.row_count;
                self.report.add(&info);
                let columns = vec![
                    ColumnData::U32(vec![info.task_no.0]),
                    ColumnData::U32(vec![info.worker_id]),
                    ColumnData::F64(vec![info.row_count as f64]),
                    ColumnData::F64(vec![info.byte_count as f64]),
                    ColumnData::F64(vec![info.elapsed_secs]),
                ];
                self.store.append_rows(TASK_INFO, columns)?;
            }
        }
        Ok(())
    }
}

fn schema(name: &str, columns: &[(&str, ColumnType)]) -> TableSchema {
    TableSchema::new(name, columns.iter().map(|(n, t)| (n.to_string(), *t)).collect())
}

/// `Σ loss × avg_ratio` per key, realization and loss type.
fn aggregate_table(
    ctx: &TaskContext,
    avg_ratio: &[f64],
    num_rlzs: usize,
    columns: &[ColumnData],
) -> Result<AggLosses, RiskError> {
    let [ColumnData::U32(eids), ColumnData::U16(kids), ColumnData::U8(lids), ColumnData::F64(losses), ..] =
        columns
    else {
        return Err(StoreError::MalformedRow {
            table: AGG_LOSS_TABLE.to_string(),
            line: 0,
            detail: "unexpected column layout".to_string(),
        }
        .into());
    };
    let collect = ctx.params.collect_rlzs;
    let mut agg = AggLosses::zeros(ctx.num_keys(), num_rlzs, ctx.loss_types.len());
    for i in 0..eids.len() {
        let rlz = if collect { RlzId(0) } else { ctx.events.rlz_of(EventId(eids[i])) };
        let ratio = avg_ratio.get(rlz.0 as usize).copied().unwrap_or(0.0);
        let idx = agg.index(AggKey(kids[i]), rlz, LossTypeIdx(lids[i]));
        agg.data[idx] += losses[i] * ratio;
    }
    Ok(agg)
}

pub struct EventBasedRisk<S> {
    ctx: Arc<TaskContext>,
    scheduler: Scheduler,
    reducer: Reducer<S>,
    avg_ratio: Vec<f64>,
    num_tasks: u32,
}

impl<S: ColumnStore> EventBasedRisk<S> {
    pub fn new(ctx: TaskContext, store: S) -> Result<Self, RiskError> {
        let scheduler = Scheduler::new(ctx.params.num_workers)?;
        Ok(EventBasedRisk {
            ctx: Arc::new(ctx),
            scheduler,
            reducer: Reducer {
                store,
                avg: None,
                report: PerformanceReport::default(),
                gmf_rows: 0,
                gmf_bytes: 0,
                loss_rows: 0,
            },
            avg_ratio: Vec::new(),
            num_tasks: 0,
        })
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn store(&self) -> &S {
        &self.reducer.store
    }

    pub fn into_store(self) -> S {
        self.reducer.store
    }

    /// Realizations in the average-loss array.
    fn num_rlzs_out(&self) -> usize {
        if self.ctx.params.collect_rlzs { 1 } else { self.ctx.events.num_rlzs }
    }

    /// Per-realization factor turning loss sums into averages.
    pub fn avg_ratio(&self) -> Vec<f64> {
        let params = &self.ctx.params;
        let per_rlz = self.ctx.events.per_rlz();
        let num_rlzs = self.ctx.events.num_rlzs.max(1);
        match (params.collect_rlzs, params.time_ratio()) {
            (true, Some(tr)) => vec![tr / num_rlzs as f64],
            (true, None) => {
                let n = self.ctx.events.len();
                vec![if n > 0 { 1.0 / n as f64 } else { 0.0 }]
            }
            (false, Some(tr)) => vec![tr; self.ctx.events.num_rlzs],
            (false, None) => per_rlz.iter().map(|&n| if n > 0 { 1.0 / f64::from(n) } else { 0.0 }).collect(),
        }
    }

    /// Split the hazard into task units.
    pub fn plan(&self, hazard: &HazardInput) -> Result<Vec<TaskUnit>, RiskError> {
        let params = &self.ctx.params;
        match hazard {
            HazardInput::Gmfs(table) => {
                if table.is_empty() {
                    return Err(RiskError::NoGmfs);
                }
                let eids = table.eids();
                if let Some(eid) = self.ctx.events.find_unknown(eids.iter().copied()) {
                    return Err(ConfigError::UnknownEvent(eid.0).into());
                }
                let max_weight = params
                    .max_weight
                    .unwrap_or_else(|| max_weight_for(eids.len() as u64, params.concurrent_tasks));
                Ok(gmf_slices(&eids, max_weight)?.into_iter().map(TaskUnit::Slice).collect())
            }
            HazardInput::Ruptures { ruptures, .. } => {
                if let Some(eid) = self.ctx.events.find_unknown(ruptures.iter().flat_map(Rupture::eids)) {
                    return Err(ConfigError::UnknownEvent(eid.0).into());
                }
                let total: u64 = ruptures.iter().map(Rupture::weight).sum();
                let max_weight =
                    params.max_weight.unwrap_or_else(|| max_weight_for(total, params.concurrent_tasks));
                let blocks = split_in_blocks(ruptures.clone(), max_weight, Rupture::weight)?;
                Ok(blocks.into_iter().map(TaskUnit::RuptureBlock).collect())
            }
        }
    }

    /// Validate, guard capacity and create the output tables. Nothing is
    /// dispatched when this fails.
    pub fn pre_execute(&mut self, num_tasks: u32) -> Result<(), RiskError> {
        let ctx = Arc::clone(&self.ctx);
        let params = &ctx.params;
        params.validate(ctx.model.loss_types())?;
        ctx.events.validate()?;
        ctx.assets.validate_ordinals()?;
        ctx.assets.validate_keys()?;
        if params.output_mode == OutputMode::Risk {
            ctx.assets.validate_values(ctx.model.loss_types().len())?;
        }

        let num_events = ctx.events.len() as u64;
        let num_assets = ctx.assets.len() as u64;
        let num_loss_types = ctx.loss_types.len();
        let bytes_per_task = check_capacity(
            params.bytes_per_row,
            num_events,
            num_loss_types as u64,
            num_tasks,
            params.task_ceiling_bytes,
        )?;
        warn_if_large(
            num_events,
            num_assets,
            params.max_potential_gmfs,
            ctx.num_keys() > 0,
            params.minimum_asset_loss.values().any(|&v| v > 0.0),
        );

        let mut columns = vec![
            ("event_id", ColumnType::U32),
            ("agg_id", ColumnType::U16),
            ("loss_id", ColumnType::U8),
        ];
        let value_columns = params.output_mode.value_columns();
        columns.extend(value_columns.iter().map(|c| (c.as_str(), ColumnType::F64)));

        let mut metadata = Metadata::new();
        metadata.insert("K".to_string(), Value::from(ctx.num_keys()));
        metadata.insert("L".to_string(), Value::from(num_loss_types));
        metadata.insert("loss_types".to_string(), Value::from(ctx.loss_types.clone()));
        metadata.insert("agg_keys".to_string(), Value::from(ctx.assets.agg_keys().to_vec()));
        metadata.insert("correlation".to_string(), serde_json::to_value(params.correlation).map_err(StoreError::from)?);
        if let OutputMode::Damage { damage_states } = &params.output_mode {
            let limit_states: Vec<String> = damage_states.iter().skip(1).cloned().collect();
            metadata.insert("limit_states".to_string(), Value::from(limit_states));
        }
        let store = &mut self.reducer.store;
        store.create_table(schema(AGG_LOSS_TABLE, &columns), metadata)?;
        store.create_table(
            schema(
                GMF_INFO,
                &[
                    ("rup_id", ColumnType::U32),
                    ("task_no", ColumnType::U32),
                    ("nsites", ColumnType::U32),
                    ("gmf_bytes", ColumnType::F64),
                    ("elapsed", ColumnType::F64),
                ],
            ),
            Metadata::new(),
        )?;
        store.create_table(
            schema(
                TASK_INFO,
                &[
                    ("task_no", ColumnType::U32),
                    ("worker_id", ColumnType::U32),
                    ("row_count", ColumnType::F64),
                    ("byte_count", ColumnType::F64),
                    ("elapsed", ColumnType::F64),
                ],
            ),
            Metadata::new(),
        )?;

        self.avg_ratio = self.avg_ratio();
        if params.avg_losses {
            self.reducer.avg = Some(AvgLosses::zeros(ctx.assets.len(), self.num_rlzs_out(), num_loss_types));
        }
        self.num_tasks = num_tasks;
        info!(
            events = num_events,
            assets = num_assets,
            loss_types = num_loss_types,
            keys = ctx.num_keys(),
            tasks = num_tasks,
            workers = self.scheduler.num_workers(),
            bytes_per_task,
            "starting risk calculation"
        );
        Ok(())
    }

    /// Dispatch the units and reduce their outputs.
    pub fn execute(&mut self, hazard: &HazardInput, units: Vec<TaskUnit>) -> Result<RunSummary, RiskError> {
        let ctx: &TaskContext = &self.ctx;
        let params = &ctx.params;
        let sub_max_weight = (params.ebrisk_maxsize / u64::from(params.concurrent_tasks.max(1))).max(1);
        let reducer = &mut self.reducer;

        let work = |h: &TaskHandle<'_, TaskUnit, TaskOutput>, unit: TaskUnit| -> Result<(), TaskError> {
            let task_no = h.task_no();
            let mut emit = |out: TaskOutput| h.emit(out);
            match (unit, hazard) {
                (TaskUnit::Slice(range), HazardInput::Gmfs(table)) => {
                    event_based_risk(task_no, &table.rows[range], &table.imts, ctx, &mut emit)
                }
                (TaskUnit::RuptureBlock(ruptures), HazardInput::Ruptures { computer, .. }) => start_ebrisk(
                    task_no,
                    ruptures,
                    sub_max_weight,
                    computer.as_ref(),
                    ctx,
                    &|block| h.spawn(TaskUnit::Ruptures(block)),
                    &mut emit,
                ),
                (TaskUnit::Ruptures(ruptures), HazardInput::Ruptures { computer, .. }) => {
                    ebrisk(task_no, &ruptures, computer.as_ref(), ctx, &mut emit)
                }
                (unit, _) => unreachable!("{unit:?} does not match the hazard input"),
            }
        };
        let run = self.scheduler.run(units, work, |task_no, output| reducer.apply(task_no, output))?;
        if reducer.gmf_bytes > 0 {
            info!(gmf_bytes = reducer.gmf_bytes, "produced GMFs");
        }
        Ok(run)
    }

    /// Scale averages, derive aggregate losses and check their consistency.
    pub fn post_execute(&mut self, run: RunSummary) -> Result<RiskSummary, RiskError> {
        if self.reducer.gmf_rows == 0 {
            return Err(RiskError::NoGmfs);
        }
        let ctx = Arc::clone(&self.ctx);
        let params = &ctx.params;
        let num_rlzs = self.num_rlzs_out();
        let reducer = &mut self.reducer;
        reducer.store.flush()?;
        reducer.report.log();

        let mut loss_meta = Metadata::new();
        loss_meta.insert("loss_types".to_string(), Value::from(ctx.loss_types.clone()));

        let avg_totals = match reducer.avg.as_mut() {
            Some(avg) => {
                for (r, &ratio) in self.avg_ratio.iter().enumerate() {
                    avg.scale_rlz(r, ratio);
                }
                reducer.store.write_array(AVG_LOSSES, avg.to_array(loss_meta.clone()))?;
                Some(avg.sum_over_assets())
            }
            None => None,
        };

        let agg_losses = match params.output_mode {
            OutputMode::Risk => {
                let columns = reducer.store.read_table(AGG_LOSS_TABLE)?;
                let agg = aggregate_table(&ctx, &self.avg_ratio, num_rlzs, &columns)?;
                let mut meta = loss_meta.clone();
                meta.insert("K".to_string(), Value::from(ctx.num_keys()));
                reducer.store.write_array(
                    AGG_LOSSES,
                    StoredArray {
                        shape: vec![agg.num_keys + 1, agg.num_rlzs, agg.num_loss_types],
                        data: agg.data.clone(),
                        metadata: meta,
                    },
                )?;
                Some(agg)
            }
            OutputMode::Damage { .. } => None,
        };

        let consistent = match (&agg_losses, &avg_totals) {
            (Some(agg), Some(avg)) if params.is_scenario() => {
                let totals: Vec<f64> = agg.totals().concat();
                let sums: Vec<f64> = avg.concat();
                let ok = all_close(&totals, &sums, 1e-6);
                if !ok {
                    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
                    warn!(
                        agg_losses = mean(&totals),
                        sum_avg_losses = mean(&sums),
                        "Due to rounding errors inherent in floating-point arithmetic, \
                         agg_losses != sum(avg_losses)"
                    );
                }
                Some(ok)
            }
            _ => None,
        };

        if let Some(agg) = &agg_losses {
            let totals = agg.totals();
            for (l, name) in ctx.loss_types.iter().enumerate() {
                let mean = totals.iter().map(|row| row[l]).sum::<f64>() / totals.len().max(1) as f64;
                info!(loss_type = name.as_str(), loss = mean, "portfolio loss");
            }
        }

        Ok(RiskSummary {
            num_events: ctx.events.len(),
            num_tasks: self.num_tasks,
            gmf_rows: self.reducer.gmf_rows,
            loss_rows: self.reducer.loss_rows,
            loss_types: ctx.loss_types.clone(),
            avg_ratio: self.avg_ratio.clone(),
            avg_totals,
            agg_losses,
            consistent,
            run,
        })
    }

    /// Plan, check, dispatch and post-process in one go.
    pub fn run(&mut self, hazard: &HazardInput) -> Result<RiskSummary, RiskError> {
        let units = self.plan(hazard)?;
        self.pre_execute(units.len() as u32)?;
        let run = self.execute(hazard, units)?;
        self.post_execute(run)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::RiskParams;
    use crate::exposure::{Asset, AssetCollection};
    use crate::hazard::{Events, GmfRecord, RuptureSite, SyntheticGmfComputer};
    use crate::store::MemoryStore;
    use crate::types::{AssetId, RuptureId, SiteId};
    use crate::vulnerability::{VulnerabilityFunction, VulnerabilityModel};

    fn context(params: RiskParams, rlz_ids: Vec<u16>, num_rlzs: usize) -> TaskContext {
        let asset = |i: u32, site: u32, kid: u16| Asset {
            ordinal: AssetId(i),
            taxonomy: "RC".to_string(),
            site_id: SiteId(site),
            values: vec![100.0],
            kid: Some(AggKey(kid)),
            deductible: 0.0,
            insurance_limit: 1.0,
        };
        let model = VulnerabilityModel {
            loss_types: vec!["structural".to_string()],
            functions: BTreeMap::from([(
                "RC".to_string(),
                vec![VulnerabilityFunction {
                    imt: "PGA".to_string(),
                    imls: vec![0.0, 1.0],
                    mean_lrs: vec![0.0, 1.0],
                    covs: vec![0.2, 0.2],
                }],
            )]),
        };
        TaskContext::new(
            AssetCollection::new(vec![asset(0, 0, 0), asset(1, 1, 1)], vec!["a".into(), "b".into()]),
            Box::new(model),
            Events::new(rlz_ids.into_iter().map(RlzId).collect(), num_rlzs),
            params,
        )
    }

    fn gmfs(rows: &[(u32, u32, f32)]) -> HazardInput {
        HazardInput::Gmfs(GmfTable::new(
            vec!["PGA".to_string()],
            rows.iter()
                .map(|&(s, e, g)| GmfRecord { site_id: SiteId(s), event_id: EventId(e), gmvs: vec![g] })
                .collect(),
        ))
    }

    fn scenario_params() -> RiskParams {
        RiskParams {
            investigation_time: None,
            ignore_master_seed: true,
            num_workers: 2,
            max_weight: Some(2),
            ..RiskParams::default()
        }
    }

    #[test]
    fn avg_ratio_variants() {
        let rlzs = vec![0, 0, 1];
        let calc = |params| EventBasedRisk::new(context(params, rlzs.clone(), 2), MemoryStore::new()).unwrap();
        let scenario = calc(scenario_params());
        assert_eq!(scenario.avg_ratio(), vec![0.5, 1.0]);
        let collected = calc(RiskParams { collect_rlzs: true, ..scenario_params() });
        assert_eq!(collected.avg_ratio(), vec![1.0 / 3.0]);
        let annual = RiskParams {
            investigation_time: Some(10.0),
            risk_investigation_time: Some(1.0),
            ..scenario_params()
        };
        let eb = calc(annual.clone());
        assert_eq!(eb.avg_ratio(), vec![0.1, 0.1]);
        let eb_collected = calc(RiskParams { collect_rlzs: true, ..annual });
        assert_eq!(eb_collected.avg_ratio(), vec![0.05]);
    }

    #[test]
    fn scenario_totals_are_consistent() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0, 0, 1], 2), MemoryStore::new()).unwrap();
        let hazard = gmfs(&[(0, 0, 0.1), (1, 0, 0.2), (0, 1, 0.3), (1, 2, 0.4)]);
        let summary = calc.run(&hazard).unwrap();
        assert_eq!(summary.num_tasks, 2);
        assert_eq!(summary.gmf_rows, 4);
        assert_eq!(summary.consistent, Some(true));

        let agg = summary.agg_losses.unwrap();
        // rlz 0 holds events 0 and 1: (10 + 20 + 30) / 2
        assert!((agg.get(AggKey(2), RlzId(0), LossTypeIdx(0)) - 30.0).abs() < 1e-4);
        assert!((agg.get(AggKey(1), RlzId(1), LossTypeIdx(0)) - 40.0).abs() < 1e-4);

        let store = calc.into_store();
        assert_eq!(store.num_rows(AGG_LOSS_TABLE), summary.loss_rows as usize);
        assert_eq!(store.num_rows(TASK_INFO), 2);
        assert_eq!(store.array(AVG_LOSSES).unwrap().shape, vec![2, 2, 1]);
    }

    #[test]
    fn empty_gmfs_are_rejected_before_dispatch() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0], 1), MemoryStore::new()).unwrap();
        assert!(matches!(calc.run(&gmfs(&[])), Err(RiskError::NoGmfs)));
        assert_eq!(calc.store().num_rows(TASK_INFO), 0);
    }

    #[test]
    fn capacity_failure_dispatches_nothing() {
        let params = RiskParams { task_ceiling_bytes: 4, ..scenario_params() };
        let mut calc = EventBasedRisk::new(context(params, vec![0, 0], 1), MemoryStore::new()).unwrap();
        let err = calc.run(&gmfs(&[(0, 0, 0.1), (0, 1, 0.2)])).unwrap_err();
        assert!(matches!(err, RiskError::Config(ConfigError::CapacityExceeded { .. })));
        assert!(calc.store().columns(AGG_LOSS_TABLE).is_none());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0], 1), MemoryStore::new()).unwrap();
        let err = calc.run(&gmfs(&[(0, 5, 0.1)])).unwrap_err();
        assert!(matches!(err, RiskError::Config(ConfigError::UnknownEvent(5))));
    }

    #[test]
    fn unknown_rupture_event_is_rejected_before_dispatch() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0], 1), MemoryStore::new()).unwrap();
        let rupture = Rupture {
            id: RuptureId(0),
            rlz_id: RlzId(0),
            first_eid: EventId(10_000),
            n_occ: 1,
            sites: vec![RuptureSite { site_id: SiteId(0), distance_km: 1.0 }],
            median: vec![0.3],
            sigma: 0.1,
        };
        let computer = SyntheticGmfComputer {
            imts: vec!["PGA".to_string()],
            master_seed: 1,
            min_iml: vec![],
            half_distance_km: 10.0,
        };
        let hazard = HazardInput::Ruptures { ruptures: vec![rupture], computer: Box::new(computer) };
        let err = calc.run(&hazard).unwrap_err();
        assert!(matches!(err, RiskError::Config(ConfigError::UnknownEvent(10_000))));
        assert!(calc.store().columns(TASK_INFO).is_none());
    }

    #[test]
    fn realization_out_of_range_is_rejected() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0, 2], 2), MemoryStore::new()).unwrap();
        let err = calc.run(&gmfs(&[(0, 0, 0.1)])).unwrap_err();
        assert!(matches!(
            err,
            RiskError::Config(ConfigError::RlzOutOfRange { eid: 1, rlz: 2, num_rlzs: 2 })
        ));
        assert!(calc.store().columns(AGG_LOSS_TABLE).is_none());
    }

    #[test]
    fn interleaved_events_are_rejected() {
        let mut calc =
            EventBasedRisk::new(context(scenario_params(), vec![0, 0], 1), MemoryStore::new()).unwrap();
        let err = calc.run(&gmfs(&[(0, 0, 0.1), (0, 1, 0.1), (1, 0, 0.1)])).unwrap_err();
        assert!(matches!(err, RiskError::Partition(_)));
    }
}
