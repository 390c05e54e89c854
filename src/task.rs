//! Work done inside one task: hazard rows in, partial aggregates out.

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::aggregate::{
    AggLossTable, DamageDist, EventKeyAccumulator, LossVariance, SparseAvg, aggregate_damages,
    aggregate_losses, average_contributions, build_agg_loss_table,
};
use crate::config::RiskParams;
use crate::exposure::{Asset, AssetCollection, TaxonomyGroup};
use crate::hazard::{Events, GmfComputer, GmfInfo, GmfRecord, Rupture};
use crate::monitor::{Monitor, TaskInfo};
use crate::partition::{PartitionError, split_in_blocks};
use crate::rng::EventRng;
use crate::types::{AggKey, LossTypeIdx, OutputMode, TaskNo};
use crate::vulnerability::{
    HazardBatch, LossOutput, LossRecord, RiskModel, RiskModelError, insured_losses,
};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Model(#[from] RiskModelError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("model returned {got} for taxonomy {taxonomy}, the output mode expects {expected}")]
    OutputMismatch { taxonomy: String, expected: &'static str, got: &'static str },
}

/// What a task hands back to the reducer. A task may send several messages.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    AvgLosses(SparseAvg),
    EventLosses(AggLossTable),
    GmfInfo(Vec<GmfInfo>),
    Diagnostics(TaskInfo),
}

/// Read-only inputs shared by every task of a run.
pub struct TaskContext {
    pub assets: AssetCollection,
    pub groups: Vec<TaxonomyGroup>,
    pub kids: Vec<Option<AggKey>>,
    pub model: Box<dyn RiskModel>,
    pub events: Events,
    pub params: RiskParams,
    /// Primary loss types followed by the insured ones.
    pub loss_types: Vec<String>,
    pub minimum_losses: Vec<f64>,
}

impl TaskContext {
    pub fn new(assets: AssetCollection, model: Box<dyn RiskModel>, events: Events, params: RiskParams) -> Self {
        let loss_types = params.loss_type_names(model.loss_types());
        let minimum_losses = params.minimum_losses(&loss_types);
        TaskContext {
            groups: assets.by_taxonomy(),
            kids: assets.kids(),
            assets,
            model,
            events,
            params,
            loss_types,
            minimum_losses,
        }
    }

    pub fn num_keys(&self) -> usize {
        self.assets.num_keys()
    }

    fn num_primary(&self) -> usize {
        self.model.loss_types().len()
    }

    fn value_columns(&self) -> usize {
        self.params.output_mode.value_columns().len()
    }
}

/// Per-loss-type accumulators of one task.
enum Partials {
    Losses(Vec<EventKeyAccumulator<LossVariance>>),
    Damages(Vec<EventKeyAccumulator<DamageDist>>),
}

impl Partials {
    fn new(mode: &OutputMode, num_loss_types: usize) -> Self {
        match mode {
            OutputMode::Risk => Partials::Losses((0..num_loss_types).map(|_| Default::default()).collect()),
            OutputMode::Damage { .. } => {
                Partials::Damages((0..num_loss_types).map(|_| Default::default()).collect())
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Partials::Losses(_) => "losses",
            Partials::Damages(_) => "damages",
        }
    }

    fn into_table(self, ctx: &TaskContext) -> AggLossTable {
        let correlation = ctx.params.correlation;
        let ncols = ctx.value_columns();
        let indexed = |i: usize| LossTypeIdx(i as u8);
        match self {
            Partials::Losses(accs) => build_agg_loss_table(
                accs.into_iter().enumerate().map(|(i, a)| (indexed(i), a)).collect(),
                ncols,
                correlation,
            ),
            Partials::Damages(accs) => build_agg_loss_table(
                accs.into_iter().enumerate().map(|(i, a)| (indexed(i), a)).collect(),
                ncols,
                correlation,
            ),
        }
    }
}

/// Losses of one loss type after the minimum-loss filter.
fn above_minimum(mut records: Vec<LossRecord>, minimum: f64) -> Vec<LossRecord> {
    if minimum > 0.0 {
        records.retain(|r| r.loss >= minimum);
    }
    records
}

/// Evaluate and aggregate the losses of one chunk of GMF rows.
///
/// Sends average-loss contributions, the task's event-loss rows (if any)
/// and its diagnostics, in that order.
pub fn event_based_risk(
    task_no: TaskNo,
    rows: &[GmfRecord],
    imts: &[String],
    ctx: &TaskContext,
    emit: &mut dyn FnMut(TaskOutput),
) -> Result<(), TaskError> {
    let mut mon = Monitor::new(task_no);
    let params = &ctx.params;
    let correlation = params.correlation;
    let num_keys = ctx.num_keys();
    let primary = ctx.num_primary();

    let rng = (!params.ignore_master_seed)
        .then(|| EventRng::for_events(params.master_seed, rows.iter().map(|r| r.event_id), correlation));

    let mut partials = Partials::new(&params.output_mode, ctx.loss_types.len());
    let mut avgs: Vec<SparseAvg> = Vec::new();

    for group in &ctx.groups {
        let hazard = HazardBatch::filter(imts, rows, |sid| group.sites.contains(&sid));
        if hazard.is_empty() {
            continue;
        }
        let assets: Vec<&Asset> = group.aids.iter().filter_map(|&aid| ctx.assets.get(aid)).collect();
        let outputs = mon.measure("computing risk", || {
            ctx.model.evaluate(&group.taxonomy, &assets, &hazard, correlation, rng.as_ref())
        })?;

        for (lti, output) in outputs.into_iter().enumerate().take(primary) {
            if output.is_empty() {
                continue;
            }
            match (output, &mut partials) {
                (LossOutput::Losses(records), Partials::Losses(accs)) => {
                    let mut batches = Vec::with_capacity(2);
                    if params.insured_losses {
                        batches.push((lti + primary, insured_losses(&records, &ctx.assets, lti)));
                    }
                    batches.push((lti, records));
                    for (l, records) in batches {
                        let records = above_minimum(records, ctx.minimum_losses[l]);
                        mon.measure("aggregating losses", || {
                            accs[l].merge(aggregate_losses(&records, num_keys, &ctx.kids, correlation));
                        });
                        if params.avg_losses {
                            let avg = mon.measure("averaging losses", || {
                                average_contributions(
                                    &records,
                                    LossTypeIdx(l as u8),
                                    |eid| ctx.events.rlz_of(eid),
                                    params.collect_rlzs,
                                )
                            });
                            avgs.push(avg);
                        }
                    }
                }
                (LossOutput::Damages(records), Partials::Damages(accs)) => {
                    mon.measure("aggregating losses", || {
                        accs[lti].merge(aggregate_damages(&records, num_keys, &ctx.kids));
                    });
                }
                (output, partials) => {
                    return Err(TaskError::OutputMismatch {
                        taxonomy: group.taxonomy.clone(),
                        expected: partials.kind(),
                        got: output.kind(),
                    });
                }
            }
        }
    }

    for avg in avgs.into_iter().filter(|a| !a.is_empty()) {
        emit(TaskOutput::AvgLosses(avg));
    }
    let table = partials.into_table(ctx);
    let nbytes = table.nbytes() as u64;
    if !table.is_empty() {
        emit(TaskOutput::EventLosses(table));
    }
    emit(TaskOutput::Diagnostics(mon.task_info(rows.len() as u64, nbytes)));
    Ok(())
}

/// Compute the GMFs of a block of ruptures and run the risk on them.
pub fn ebrisk(
    task_no: TaskNo,
    ruptures: &[Rupture],
    computer: &dyn GmfComputer,
    ctx: &TaskContext,
    emit: &mut dyn FnMut(TaskOutput),
) -> Result<(), TaskError> {
    let row_bytes = (4 + 4 + 4 * computer.imts().len()) as u64;
    let mut rows: Vec<GmfRecord> = Vec::new();
    let mut infos = Vec::with_capacity(ruptures.len());
    for rup in ruptures {
        let t0 = Instant::now();
        let gmfs = computer.compute(rup);
        if gmfs.is_empty() {
            continue;
        }
        let nsites = gmfs.iter().map(|r| r.site_id).collect::<HashSet<_>>().len();
        infos.push(GmfInfo {
            rup_id: rup.id,
            task_no,
            nsites: nsites as u32,
            gmf_bytes: gmfs.len() as u64 * row_bytes,
            elapsed_secs: t0.elapsed().as_secs_f64(),
        });
        rows.extend(gmfs);
    }
    if !infos.is_empty() {
        emit(TaskOutput::GmfInfo(infos));
    }
    event_based_risk(task_no, &rows, computer.imts(), ctx, emit)
}

/// Outer rupture task: split the block by weight, hand all sub-blocks but
/// the last to `spawn` and process the last one here.
pub fn start_ebrisk(
    task_no: TaskNo,
    ruptures: Vec<Rupture>,
    max_weight: u64,
    computer: &dyn GmfComputer,
    ctx: &TaskContext,
    spawn: &dyn Fn(Vec<Rupture>),
    emit: &mut dyn FnMut(TaskOutput),
) -> Result<(), TaskError> {
    let mut blocks = split_in_blocks(ruptures, max_weight, Rupture::weight)?;
    let Some(last) = blocks.pop() else { return Ok(()) };
    for block in blocks {
        debug!(task_no = task_no.0, ruptures = block.len(), "produced subtask");
        spawn(block);
    }
    ebrisk(task_no, &last, computer, ctx, emit)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;
    use crate::hazard::{RuptureSite, SyntheticGmfComputer};
    use crate::types::{AssetId, Correlation, EventId, RlzId, RuptureId, SiteId};
    use crate::vulnerability::{FragilityFunction, FragilityModel, VulnerabilityFunction, VulnerabilityModel};

    fn vf() -> VulnerabilityFunction {
        VulnerabilityFunction {
            imt: "PGA".to_string(),
            imls: vec![0.0, 1.0],
            mean_lrs: vec![0.0, 1.0],
            covs: vec![0.1, 0.1],
        }
    }

    fn model() -> Box<dyn RiskModel> {
        Box::new(VulnerabilityModel {
            loss_types: vec!["structural".to_string()],
            functions: BTreeMap::from([("RC".to_string(), vec![vf()]), ("W".to_string(), vec![vf()])]),
        })
    }

    fn assets() -> AssetCollection {
        let a = |i: u32, tax: &str, site: u32, kid: u16| Asset {
            ordinal: AssetId(i),
            taxonomy: tax.to_string(),
            site_id: SiteId(site),
            values: vec![100.0],
            kid: Some(AggKey(kid)),
            deductible: 0.1,
            insurance_limit: 0.5,
        };
        AssetCollection::new(
            vec![a(0, "RC", 1, 0), a(1, "W", 2, 1), a(2, "RC", 3, 1)],
            vec!["a".to_string(), "b".to_string()],
        )
    }

    fn params() -> RiskParams {
        RiskParams { ignore_master_seed: true, ..RiskParams::default() }
    }

    fn ctx(params: RiskParams) -> TaskContext {
        TaskContext::new(assets(), model(), Events::new(vec![RlzId(0), RlzId(1), RlzId(0)], 2), params)
    }

    fn row(site: u32, eid: u32, gmv: f32) -> GmfRecord {
        GmfRecord { site_id: SiteId(site), event_id: EventId(eid), gmvs: vec![gmv] }
    }

    fn run(ctx: &TaskContext, rows: &[GmfRecord]) -> Vec<TaskOutput> {
        let out = RefCell::new(Vec::new());
        event_based_risk(TaskNo(0), rows, &["PGA".to_string()], ctx, &mut |o| out.borrow_mut().push(o))
            .unwrap();
        out.into_inner()
    }

    fn table(outputs: &[TaskOutput]) -> &AggLossTable {
        outputs
            .iter()
            .find_map(|o| match o {
                TaskOutput::EventLosses(t) => Some(t),
                _ => None,
            })
            .expect("no event losses")
    }

    #[test]
    fn losses_per_key_and_total() {
        let ctx = ctx(params());
        let outputs = run(&ctx, &[row(1, 0, 0.5), row(2, 0, 0.2), row(3, 2, 0.4)]);
        let t = table(&outputs);
        let rows: Vec<(u32, u16, f64)> =
            (0..t.len()).map(|i| (t.event_id[i], t.agg_id[i], t.values[0][i])).collect();
        assert_eq!(rows.len(), 5);
        let find = |e: u32, k: u16| rows.iter().find(|r| r.0 == e && r.1 == k).map(|r| r.2);
        assert!((find(0, 0).unwrap() - 50.0).abs() < 1e-4);
        assert!((find(0, 1).unwrap() - 20.0).abs() < 1e-4);
        assert!((find(0, 2).unwrap() - 70.0).abs() < 1e-4);
        assert!((find(2, 2).unwrap() - 40.0).abs() < 1e-4);
        assert!(matches!(outputs.last(), Some(TaskOutput::Diagnostics(info)) if info.row_count == 3));
    }

    #[test]
    fn taxonomies_without_rows_are_skipped() {
        let ctx = ctx(params());
        let outputs = run(&ctx, &[row(1, 0, 0.5)]);
        let avg_rows: usize = outputs
            .iter()
            .filter_map(|o| match o {
                TaskOutput::AvgLosses(a) => Some(a.len()),
                _ => None,
            })
            .sum();
        assert_eq!(avg_rows, 1);
    }

    #[test]
    fn empty_chunk_only_reports_diagnostics() {
        let ctx = ctx(params());
        let outputs = run(&ctx, &[]);
        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], TaskOutput::Diagnostics(_)));
    }

    #[test]
    fn insured_losses_get_their_own_loss_id() {
        let ctx = ctx(RiskParams { insured_losses: true, ..params() });
        assert_eq!(ctx.loss_types, vec!["structural", "structural_ins"]);
        let outputs = run(&ctx, &[row(1, 0, 0.5)]);
        let t = table(&outputs);
        let insured: Vec<f64> = (0..t.len()).filter(|&i| t.loss_id[i] == 1).map(|i| t.values[0][i]).collect();
        // loss 50, deductible 10, limit 50
        assert!(insured.iter().all(|&l| (l - 40.0).abs() < 1e-4), "{insured:?}");
    }

    #[test]
    fn minimum_asset_loss_drops_small_losses() {
        let ctx = ctx(RiskParams {
            minimum_asset_loss: BTreeMap::from([("structural".to_string(), 30.0)]),
            ..params()
        });
        let outputs = run(&ctx, &[row(1, 0, 0.5), row(2, 0, 0.2)]);
        let t = table(&outputs);
        let total = (0..t.len()).find(|&i| t.agg_id[i] == 2).map(|i| t.values[0][i]);
        assert!((total.unwrap() - 50.0).abs() < 1e-4);
    }

    #[test]
    fn damage_mode_sums_fractions() {
        let fragility = FragilityModel {
            loss_types: vec!["structural".to_string()],
            damage_states: vec!["no_damage".to_string(), "complete".to_string()],
            functions: ["RC", "W"]
                .map(|tax| {
                    let ff = FragilityFunction {
                        imt: "PGA".to_string(),
                        imls: vec![0.0, 1.0],
                        poes: vec![vec![0.0, 1.0]],
                    };
                    (tax.to_string(), ff)
                })
                .into_iter()
                .collect(),
        };
        let params = RiskParams {
            avg_losses: false,
            output_mode: OutputMode::Damage { damage_states: fragility.damage_states.clone() },
            ..params()
        };
        let ctx = TaskContext::new(assets(), Box::new(fragility), Events::new(vec![RlzId(0)], 1), params);
        let outputs = run(&ctx, &[row(1, 0, 0.25), row(3, 0, 0.75)]);
        let t = table(&outputs);
        assert_eq!(t.values.len(), 2);
        let total = (0..t.len()).find(|&i| t.agg_id[i] == 2).expect("total row");
        assert!((t.values[0][total] - 1.0).abs() < 1e-9);
        assert!((t.values[1][total] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn model_in_the_wrong_mode_fails_the_task() {
        let fragility = FragilityModel {
            loss_types: vec!["structural".to_string()],
            damage_states: vec!["no_damage".to_string(), "complete".to_string()],
            functions: BTreeMap::from([(
                "RC".to_string(),
                FragilityFunction { imt: "PGA".to_string(), imls: vec![0.0, 1.0], poes: vec![vec![0.0, 1.0]] },
            )]),
        };
        let ctx = TaskContext::new(assets(), Box::new(fragility), Events::new(vec![RlzId(0)], 1), params());
        let err = event_based_risk(TaskNo(0), &[row(1, 0, 0.5)], &["PGA".to_string()], &ctx, &mut |_| {})
            .unwrap_err();
        match err {
            TaskError::OutputMismatch { taxonomy, expected, got } => {
                assert_eq!((taxonomy.as_str(), expected, got), ("RC", "losses", "damages"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_ebrisk_spawns_all_but_last_block() {
        let ctx = TaskContext::new(
            assets(),
            model(),
            Events::new(vec![RlzId(0); 4], 1),
            RiskParams { correlation: Correlation::FullyCorrelated, ..params() },
        );
        let computer = SyntheticGmfComputer {
            imts: vec!["PGA".to_string()],
            master_seed: 1,
            min_iml: vec![0.0],
            half_distance_km: 10.0,
        };
        let rupture = |id: u32| Rupture {
            id: RuptureId(id),
            rlz_id: RlzId(0),
            first_eid: EventId(id),
            n_occ: 1,
            sites: vec![RuptureSite { site_id: SiteId(1), distance_km: 1.0 }],
            median: vec![0.3],
            sigma: 0.1,
        };
        let spawned = RefCell::new(Vec::new());
        let outputs = RefCell::new(Vec::new());
        start_ebrisk(
            TaskNo(0),
            (0..4).map(rupture).collect(),
            2,
            &computer,
            &ctx,
            &|block| spawned.borrow_mut().push(block.len()),
            &mut |o| outputs.borrow_mut().push(o),
        )
        .unwrap();
        assert_eq!(spawned.into_inner(), vec![2]);
        let outputs = outputs.into_inner();
        let infos = outputs.iter().find_map(|o| match o {
            TaskOutput::GmfInfo(i) => Some(i.len()),
            _ => None,
        });
        assert_eq!(infos, Some(2));
    }
}
