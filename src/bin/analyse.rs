//! Consistency checks and loss distributions for a finished run.
//!
//! Reads the output directory written by `ebrisk` (default `output/`), then
//! prints the event loss table invariants (PASS/FAIL) and per-key loss
//! distributions.

use ebrisk::analysis::{TableViolation, event_losses, key_distributions, top_events, verify_table};
use ebrisk::calculator::AGG_LOSS_TABLE;
use ebrisk::store::{ColumnStore, NdjsonStore};

fn main() {
    let dir = std::env::args().nth(1).unwrap_or_else(|| "output".to_string());

    let mut store = NdjsonStore::open(&dir).unwrap_or_else(|e| {
        eprintln!("error: cannot open {dir}: {e}");
        eprintln!("Run `cargo run --release` first to produce the loss tables.");
        std::process::exit(1);
    });
    let metadata = store.table_metadata(AGG_LOSS_TABLE).cloned().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    let num_keys = metadata.get("K").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    let loss_types: Vec<String> = metadata
        .get("loss_types")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let agg_keys: Vec<String> = metadata
        .get("agg_keys")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let rows = store
        .read_table(AGG_LOSS_TABLE)
        .and_then(|columns| event_losses(&columns))
        .unwrap_or_else(|e| {
            eprintln!("error: {e}");
            std::process::exit(1);
        });

    // ── Table invariants ──────────────────────────────────────────────────────
    let violations = verify_table(&rows, num_keys, 1e-6);
    let has = |f: fn(&TableViolation) -> bool| if violations.iter().any(f) { "FAIL" } else { "PASS" };

    println!("=== Event loss table invariants ({} rows) ===", rows.len());
    println!("  [1] One row per (event, key, loss type): {}", has(|v| matches!(v, TableViolation::DuplicateRow { .. })));
    println!("  [2] Keys within 0..=K:                   {}", has(|v| matches!(v, TableViolation::KeyOutOfRange { .. })));
    println!("  [3] Total row present:                   {}", has(|v| matches!(v, TableViolation::MissingTotal { .. })));
    println!("  [4] Total equals sum of keys:            {}", has(|v| matches!(v, TableViolation::TotalMismatch { .. })));
    println!("  [5] Losses non-negative:                 {}", has(|v| matches!(v, TableViolation::NegativeLoss { .. })));
    if !violations.is_empty() {
        println!("\n  {} violation(s):", violations.len());
        for v in violations.iter().take(20) {
            println!("    {v}");
        }
    }

    // ── Loss distributions ────────────────────────────────────────────────────
    let key_label = |k: u16| -> String {
        if k == num_keys {
            "total".to_string()
        } else {
            agg_keys.get(k as usize).cloned().unwrap_or_else(|| k.to_string())
        }
    };
    let lt_label = |l: u8| loss_types.get(l as usize).cloned().unwrap_or_else(|| l.to_string());

    println!("\n=== Per-event loss by key ===");
    println!(
        "{:>8} | {:>16} | {:>6} | {:>10} | {:>10} | {:>10} | {:>10} | {:>10}",
        "Key", "Loss type", "Events", "p50", "p95", "max", "mean", "stddev"
    );
    println!("{}", "-".repeat(100));
    for d in key_distributions(&rows) {
        println!(
            "{:>8} | {:>16} | {:>6} | {:>10.2} | {:>10.2} | {:>10.2} | {:>10.2} | {:>10.2}",
            key_label(d.agg_id),
            lt_label(d.loss_id),
            d.loss.n,
            d.loss.p50,
            d.loss.p95,
            d.loss.max,
            d.loss.mean,
            d.loss.std_dev,
        );
    }

    println!("\n=== Largest events ===");
    for (l, name) in loss_types.iter().enumerate() {
        let top = top_events(&rows, num_keys, l as u8, 5);
        let listed: Vec<String> = top.iter().map(|(eid, loss)| format!("{eid}:{loss:.1}")).collect();
        println!("  {name:<16} {}", listed.join("  "));
    }
}
