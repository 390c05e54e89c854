use ebrisk::config::RiskConfig;
use ebrisk::scenario::Scenario;
use ebrisk::types::{AggKey, AssetId, EventId};
use ebrisk::vulnerability::LossRecord;

pub struct Size {
    pub grid_size: u32,
    pub num_rlzs: usize,
    pub annual_rate: f64,
}

pub const SMALL: Size = Size { grid_size: 5, num_rlzs: 2, annual_rate: 0.2 };

pub const MEDIUM: Size = Size { grid_size: 15, num_rlzs: 4, annual_rate: 0.4 };

pub const LARGE: Size = Size { grid_size: 30, num_rlzs: 8, annual_rate: 0.8 };

pub fn build_scenario(size: &Size, seed: u64) -> Scenario {
    let mut config = RiskConfig::canonical();
    config.portfolio.grid_size = size.grid_size;
    config.catalogue.num_rlzs = size.num_rlzs;
    config.catalogue.annual_rate = size.annual_rate;
    config.params.master_seed = seed;
    Scenario::from_config(config).expect("canonical config is valid")
}

/// `num_events × num_assets` dense loss records, event-major.
pub fn loss_records(num_events: u32, num_assets: u32) -> Vec<LossRecord> {
    (0..num_events)
        .flat_map(|e| {
            (0..num_assets).map(move |a| LossRecord {
                event_id: EventId(e),
                asset_id: AssetId(a),
                loss: f64::from(a % 17 + e % 5),
                variance: 0.1,
            })
        })
        .collect()
}

/// Assets spread round-robin over `num_keys` keys.
pub fn kids(num_assets: u32, num_keys: u16) -> Vec<Option<AggKey>> {
    (0..num_assets).map(|a| Some(AggKey((a % u32::from(num_keys)) as u16))).collect()
}

/// Sorted event ids with `rows_per_event` rows each.
pub fn sorted_eids(num_events: u32, rows_per_event: usize) -> Vec<EventId> {
    (0..num_events).flat_map(|e| std::iter::repeat_n(EventId(e), rows_per_event)).collect()
}
