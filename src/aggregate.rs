//! Per-event aggregation of asset losses and long-run average losses.

use std::collections::{BTreeMap, HashMap};

use crate::store::{ColumnData, Metadata, StoredArray};
use crate::types::{AggKey, AssetId, Correlation, EventId, LossTypeIdx, RlzId};
use crate::vulnerability::{DamageRecord, LossRecord};

/// A value that can be summed into an accumulator slot.
pub trait Accumulate: Clone {
    fn accumulate(&mut self, other: &Self);

    /// Values written to the event-loss table once accumulation is over.
    fn row_values(&self, correlation: Correlation) -> Vec<f64>;
}

/// Running `(Σ loss, Σ x)` for one `(event, key)` pair.
///
/// `x` is the variance when losses are uncorrelated and the standard deviation
/// when they are fully correlated; it is squared back in `row_values`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossVariance {
    pub loss: f64,
    pub x: f64,
}

impl LossVariance {
    pub fn from_record(record: &LossRecord, correlation: Correlation) -> Self {
        let x = if correlation.is_correlated() { record.variance.sqrt() } else { record.variance };
        LossVariance { loss: record.loss, x }
    }

    pub fn variance(&self, correlation: Correlation) -> f64 {
        if correlation.is_correlated() { self.x * self.x } else { self.x }
    }
}

impl Accumulate for LossVariance {
    fn accumulate(&mut self, other: &Self) {
        self.loss += other.loss;
        self.x += other.x;
    }

    fn row_values(&self, correlation: Correlation) -> Vec<f64> {
        vec![self.loss, self.variance(correlation)]
    }
}

/// Expected number of assets per damage state.
#[derive(Debug, Clone, PartialEq)]
pub struct DamageDist(pub Vec<f64>);

impl Accumulate for DamageDist {
    fn accumulate(&mut self, other: &Self) {
        if self.0.len() < other.0.len() {
            self.0.resize(other.0.len(), 0.0);
        }
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a += b;
        }
    }

    fn row_values(&self, _correlation: Correlation) -> Vec<f64> {
        self.0.clone()
    }
}

/// Sparse accumulator keyed by `(event, aggregation key)`.
#[derive(Debug, Clone)]
pub struct EventKeyAccumulator<V> {
    slots: HashMap<(EventId, AggKey), V>,
}

impl<V> Default for EventKeyAccumulator<V> {
    fn default() -> Self {
        EventKeyAccumulator { slots: HashMap::new() }
    }
}

impl<V: Accumulate> EventKeyAccumulator<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, eid: EventId, kid: AggKey) -> Option<&V> {
        self.slots.get(&(eid, kid))
    }

    /// Add `value` into the slot, treating a missing slot as zero.
    pub fn upsert_add(&mut self, eid: EventId, kid: AggKey, value: &V) {
        match self.slots.get_mut(&(eid, kid)) {
            Some(slot) => slot.accumulate(value),
            None => {
                self.slots.insert((eid, kid), value.clone());
            }
        }
    }

    /// Fold another accumulator into this one.
    pub fn merge(&mut self, other: EventKeyAccumulator<V>) {
        for ((eid, kid), v) in other.slots {
            self.upsert_add(eid, kid, &v);
        }
    }

    /// Rows sorted by `(event, key)` with their final values.
    pub fn finalize(self, correlation: Correlation) -> Vec<(EventId, AggKey, Vec<f64>)> {
        let mut rows: Vec<_> = self
            .slots
            .into_iter()
            .map(|((eid, kid), v)| (eid, kid, v.row_values(correlation)))
            .collect();
        rows.sort_unstable_by_key(|&(eid, kid, _)| (eid, kid));
        rows
    }
}

/// Slots a record of asset `aid` contributes to: its own key (if any) and the total.
fn keys_for(aid: AssetId, num_keys: usize, kids: &[Option<AggKey>]) -> (Option<AggKey>, AggKey) {
    let own = if num_keys > 0 { kids.get(aid.0 as usize).copied().flatten() } else { None };
    (own, AggKey::total(num_keys))
}

/// Sum losses per `(event, key)` and per event into the total key `K`.
///
/// `kids` holds each asset's key by ordinal and is ignored when `num_keys == 0`.
pub fn aggregate_losses(
    records: &[LossRecord],
    num_keys: usize,
    kids: &[Option<AggKey>],
    correlation: Correlation,
) -> EventKeyAccumulator<LossVariance> {
    let mut acc = EventKeyAccumulator::new();
    for r in records {
        let lv = LossVariance::from_record(r, correlation);
        let (own, total) = keys_for(r.asset_id, num_keys, kids);
        if let Some(kid) = own {
            acc.upsert_add(r.event_id, kid, &lv);
        }
        acc.upsert_add(r.event_id, total, &lv);
    }
    acc
}

pub fn aggregate_damages(
    records: &[DamageRecord],
    num_keys: usize,
    kids: &[Option<AggKey>],
) -> EventKeyAccumulator<DamageDist> {
    let mut acc = EventKeyAccumulator::new();
    for r in records {
        let dd = DamageDist(r.fractions.clone());
        let (own, total) = keys_for(r.asset_id, num_keys, kids);
        if let Some(kid) = own {
            acc.upsert_add(r.event_id, kid, &dd);
        }
        acc.upsert_add(r.event_id, total, &dd);
    }
    acc
}

/// Column-oriented event-loss rows produced by one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggLossTable {
    pub event_id: Vec<u32>,
    pub agg_id: Vec<u16>,
    pub loss_id: Vec<u8>,
    /// One column per value name (`loss`, `variance` or damage states).
    pub values: Vec<Vec<f64>>,
}

impl AggLossTable {
    pub fn len(&self) -> usize {
        self.event_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_id.is_empty()
    }

    pub fn nbytes(&self) -> usize {
        self.len() * (4 + 2 + 1 + 8 * self.values.len())
    }

    /// Columns in store order: `event_id, agg_id, loss_id, values…`.
    pub fn into_columns(self) -> Vec<ColumnData> {
        let mut cols = vec![
            ColumnData::U32(self.event_id),
            ColumnData::U16(self.agg_id),
            ColumnData::U8(self.loss_id),
        ];
        cols.extend(self.values.into_iter().map(ColumnData::F64));
        cols
    }
}

/// Flatten per-loss-type accumulators into table rows.
///
/// Rows are ordered by loss type, then event, then key.
pub fn build_agg_loss_table<V: Accumulate>(
    per_loss_type: Vec<(LossTypeIdx, EventKeyAccumulator<V>)>,
    num_value_columns: usize,
    correlation: Correlation,
) -> AggLossTable {
    let mut table = AggLossTable { values: vec![Vec::new(); num_value_columns], ..Default::default() };
    for (lti, acc) in per_loss_type {
        for (eid, kid, vals) in acc.finalize(correlation) {
            table.event_id.push(eid.0);
            table.agg_id.push(kid.0);
            table.loss_id.push(lti.0);
            for (col, v) in table.values.iter_mut().zip(vals.into_iter().chain(std::iter::repeat(0.0))) {
                col.push(v);
            }
        }
    }
    table
}

/// Sparse `(asset, rlz) → Σ loss` partial sums of one loss type.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseAvg {
    pub loss_id: LossTypeIdx,
    pub entries: Vec<(AssetId, RlzId, f64)>,
}

impl SparseAvg {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sum losses per asset and realization; all realizations collapse to 0 when
/// `collect_rlzs` is set.
pub fn average_contributions(
    records: &[LossRecord],
    loss_id: LossTypeIdx,
    rlz_of: impl Fn(EventId) -> RlzId,
    collect_rlzs: bool,
) -> SparseAvg {
    let mut sums: BTreeMap<(AssetId, RlzId), f64> = BTreeMap::new();
    for r in records {
        let rlz = if collect_rlzs { RlzId(0) } else { rlz_of(r.event_id) };
        *sums.entry((r.asset_id, rlz)).or_insert(0.0) += r.loss;
    }
    SparseAvg {
        loss_id,
        entries: sums.into_iter().map(|((aid, rlz), loss)| (aid, rlz, loss)).collect(),
    }
}

/// Dense `A × R × L` average-loss array owned by the reducer.
#[derive(Debug, Clone, PartialEq)]
pub struct AvgLosses {
    num_assets: usize,
    num_rlzs: usize,
    num_loss_types: usize,
    data: Vec<f64>,
}

impl AvgLosses {
    pub fn zeros(num_assets: usize, num_rlzs: usize, num_loss_types: usize) -> Self {
        AvgLosses {
            num_assets,
            num_rlzs,
            num_loss_types,
            data: vec![0.0; num_assets * num_rlzs * num_loss_types],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.num_assets, self.num_rlzs, self.num_loss_types]
    }

    fn index(&self, aid: usize, rlz: usize, lti: usize) -> usize {
        (aid * self.num_rlzs + rlz) * self.num_loss_types + lti
    }

    pub fn get(&self, aid: AssetId, rlz: RlzId, lti: LossTypeIdx) -> f64 {
        self.data[self.index(aid.0 as usize, rlz.0 as usize, lti.0 as usize)]
    }

    /// Add a task's partial sums. Entries outside the array are ignored and counted.
    pub fn add(&mut self, sparse: &SparseAvg) -> usize {
        let lti = sparse.loss_id.0 as usize;
        let mut dropped = 0;
        for &(aid, rlz, loss) in &sparse.entries {
            let (a, r) = (aid.0 as usize, rlz.0 as usize);
            if a >= self.num_assets || r >= self.num_rlzs || lti >= self.num_loss_types {
                dropped += 1;
                continue;
            }
            let i = self.index(a, r, lti);
            self.data[i] += loss;
        }
        dropped
    }

    /// Multiply every value of one realization by `factor`.
    pub fn scale_rlz(&mut self, rlz: usize, factor: f64) {
        for a in 0..self.num_assets {
            for l in 0..self.num_loss_types {
                let i = self.index(a, rlz, l);
                self.data[i] *= factor;
            }
        }
    }

    /// Portfolio totals, `[rlz][loss_type]`.
    pub fn sum_over_assets(&self) -> Vec<Vec<f64>> {
        let mut totals = vec![vec![0.0; self.num_loss_types]; self.num_rlzs];
        for a in 0..self.num_assets {
            for (r, row) in totals.iter_mut().enumerate() {
                for (l, t) in row.iter_mut().enumerate() {
                    *t += self.data[self.index(a, r, l)];
                }
            }
        }
        totals
    }

    pub fn to_array(&self, metadata: Metadata) -> StoredArray {
        StoredArray { shape: self.shape().to_vec(), data: self.data.clone(), metadata }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn rec(eid: u32, aid: u32, loss: f64, variance: f64) -> LossRecord {
        LossRecord { event_id: EventId(eid), asset_id: AssetId(aid), loss, variance }
    }

    fn kids(raw: &[u16]) -> Vec<Option<AggKey>> {
        raw.iter().map(|&k| Some(AggKey(k))).collect()
    }

    #[test]
    fn uncorrelated_variances_add() {
        let records = [rec(1, 0, 10.0, 4.0), rec(1, 1, 20.0, 9.0)];
        let acc = aggregate_losses(&records, 0, &[], Correlation::Uncorrelated);
        assert_eq!(acc.len(), 1);
        let total = acc.get(EventId(1), AggKey(0)).unwrap();
        assert_eq!(total.row_values(Correlation::Uncorrelated), vec![30.0, 13.0]);
    }

    #[test]
    fn correlated_standard_deviations_add() {
        let records = [rec(1, 0, 10.0, 4.0), rec(1, 1, 20.0, 9.0)];
        let acc = aggregate_losses(&records, 0, &[], Correlation::FullyCorrelated);
        let total = acc.get(EventId(1), AggKey(0)).unwrap();
        // (2 + 3)^2
        assert_eq!(total.row_values(Correlation::FullyCorrelated), vec![30.0, 25.0]);
    }

    #[test]
    fn explicit_keys_and_total() {
        let records = [rec(1, 0, 1.0, 0.0), rec(1, 1, 2.0, 0.0), rec(2, 1, 5.0, 0.0)];
        let acc = aggregate_losses(&records, 2, &kids(&[0, 1]), Correlation::Uncorrelated);
        let rows = acc.finalize(Correlation::Uncorrelated);
        let keys: Vec<(u32, u16)> = rows.iter().map(|(e, k, _)| (e.0, k.0)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 1), (1, 2), (2, 1), (2, 2)]);
        assert_eq!(rows[2].2[0], 3.0);
        assert_eq!(rows[4].2[0], 5.0);
    }

    #[test]
    fn merge_equals_single_pass() {
        let a = [rec(1, 0, 1.0, 1.0), rec(2, 1, 2.0, 4.0)];
        let b = [rec(1, 1, 3.0, 9.0)];
        let k = kids(&[0, 1]);
        let mut merged = aggregate_losses(&a, 2, &k, Correlation::FullyCorrelated);
        merged.merge(aggregate_losses(&b, 2, &k, Correlation::FullyCorrelated));
        let all: Vec<LossRecord> = a.iter().chain(&b).copied().collect();
        let single = aggregate_losses(&all, 2, &k, Correlation::FullyCorrelated);
        assert_eq!(
            merged.finalize(Correlation::FullyCorrelated),
            single.finalize(Correlation::FullyCorrelated)
        );
    }

    #[test]
    fn damages_sum_per_state() {
        let records = [
            DamageRecord { event_id: EventId(1), asset_id: AssetId(0), fractions: vec![0.5, 0.5] },
            DamageRecord { event_id: EventId(1), asset_id: AssetId(1), fractions: vec![0.25, 0.75] },
        ];
        let acc = aggregate_damages(&records, 2, &kids(&[0, 0]));
        assert_eq!(acc.get(EventId(1), AggKey(0)), Some(&DamageDist(vec![0.75, 1.25])));
        assert_eq!(acc.get(EventId(1), AggKey(2)), Some(&DamageDist(vec![0.75, 1.25])));
        assert_eq!(acc.get(EventId(1), AggKey(1)), None);
    }

    #[test]
    fn table_rows_ordered_by_loss_type_then_event() {
        let lt0 = aggregate_losses(&[rec(2, 0, 1.0, 0.0), rec(1, 0, 2.0, 0.0)], 0, &[], Correlation::Uncorrelated);
        let lt1 = aggregate_losses(&[rec(1, 0, 3.0, 0.0)], 0, &[], Correlation::Uncorrelated);
        let table = build_agg_loss_table(
            vec![(LossTypeIdx(0), lt0), (LossTypeIdx(1), lt1)],
            2,
            Correlation::Uncorrelated,
        );
        assert_eq!(table.event_id, vec![1, 2, 1]);
        assert_eq!(table.loss_id, vec![0, 0, 1]);
        assert_eq!(table.values[0], vec![2.0, 1.0, 3.0]);
        assert_eq!(table.into_columns().len(), 5);
    }

    #[test]
    fn average_contributions_per_rlz_or_collected() {
        let records = [rec(1, 0, 1.0, 0.0), rec(2, 0, 2.0, 0.0), rec(3, 1, 4.0, 0.0)];
        let rlz_of = |e: EventId| RlzId((e.0 % 2) as u16);
        let per_rlz = average_contributions(&records, LossTypeIdx(0), rlz_of, false);
        assert_eq!(
            per_rlz.entries,
            vec![(AssetId(0), RlzId(0), 2.0), (AssetId(0), RlzId(1), 1.0), (AssetId(1), RlzId(1), 4.0)]
        );
        let collected = average_contributions(&records, LossTypeIdx(0), rlz_of, true);
        assert_eq!(collected.entries, vec![(AssetId(0), RlzId(0), 3.0), (AssetId(1), RlzId(0), 4.0)]);
    }

    #[test]
    fn dense_avg_add_and_scale() {
        let mut avg = AvgLosses::zeros(2, 2, 1);
        let sparse = SparseAvg {
            loss_id: LossTypeIdx(0),
            entries: vec![(AssetId(0), RlzId(1), 4.0), (AssetId(1), RlzId(1), 6.0), (AssetId(9), RlzId(0), 1.0)],
        };
        assert_eq!(avg.add(&sparse), 1);
        avg.add(&sparse);
        avg.scale_rlz(1, 0.5);
        assert_eq!(avg.get(AssetId(0), RlzId(1), LossTypeIdx(0)), 4.0);
        assert_eq!(avg.sum_over_assets(), vec![vec![0.0], vec![10.0]]);
        assert_eq!(avg.to_array(Metadata::new()).shape, vec![2, 2, 1]);
    }

    fn arb_records() -> impl Strategy<Value = Vec<LossRecord>> {
        prop::collection::vec((0u32..8, 0u32..6, 0.0f64..1_000.0, 0.0f64..100.0), 0..60)
            .prop_map(|v| v.into_iter().map(|(e, a, l, var)| rec(e, a, l, var)).collect())
    }

    fn correlation() -> impl Strategy<Value = Correlation> {
        prop_oneof![Just(Correlation::Uncorrelated), Just(Correlation::FullyCorrelated)]
    }

    proptest! {
        /// Splitting the records anywhere and merging gives the same table.
        #[test]
        fn prop_additive_over_partitions(records in arb_records(), cut in 0usize..60, corr in correlation()) {
            let k = kids(&[0, 1, 2, 0, 1, 2]);
            let cut = cut.min(records.len());
            let mut left = aggregate_losses(&records[..cut], 3, &k, corr);
            left.merge(aggregate_losses(&records[cut..], 3, &k, corr));
            let whole = aggregate_losses(&records, 3, &k, corr);
            let a = left.finalize(corr);
            let b = whole.finalize(corr);
            prop_assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(&b) {
                prop_assert_eq!((x.0, x.1), (y.0, y.1));
                for (u, v) in x.2.iter().zip(&y.2) {
                    prop_assert!((u - v).abs() <= 1e-9 * v.abs().max(1.0));
                }
            }
        }

        /// Losses over explicit keys add up to the total key.
        #[test]
        fn prop_total_equals_sum_of_keys(records in arb_records(), corr in correlation()) {
            let k = kids(&[0, 1, 2, 0, 1, 2]);
            let acc = aggregate_losses(&records, 3, &k, corr);
            let mut per_event: HashMap<EventId, (f64, f64)> = HashMap::new();
            for (eid, kid, vals) in acc.finalize(corr) {
                let e = per_event.entry(eid).or_default();
                if kid.is_total(3) { e.1 += vals[0] } else { e.0 += vals[0] }
            }
            for (eid, (keys, total)) in per_event {
                prop_assert!((keys - total).abs() <= 1e-6 * total.abs().max(1.0), "event {:?}", eid);
            }
        }
    }
}
