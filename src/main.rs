use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::process;
use std::str::FromStr;

use ebrisk::calculator::{EventBasedRisk, HazardInput, RiskSummary};
use ebrisk::config::RiskConfig;
use ebrisk::error::RiskError;
use ebrisk::hazard::GmfTable;
use ebrisk::logging;
use ebrisk::scenario::Scenario;
use ebrisk::store::NdjsonStore;
use ebrisk::types::{AggKey, LossTypeIdx, RlzId};

fn parse<T: FromStr>(args: &[String], i: usize, flag: &str, what: &str) -> T {
    match args.get(i).and_then(|s| s.parse().ok()) {
        Some(v) => v,
        None => {
            eprintln!("error: {flag} requires {what}");
            process::exit(2);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut seed_override: Option<u64> = None;
    let mut tasks_override: Option<u32> = None;
    let mut workers_override: Option<usize> = None;
    let mut max_weight_override: Option<u64> = None;
    let mut output_dir = "output".to_string();
    let mut gmfs_path: Option<String> = None;
    let mut from_ruptures = false;
    let mut quiet = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = Some(parse(&args, i, "--config", "a path"));
            }
            "--seed" => {
                i += 1;
                seed_override = Some(parse(&args, i, "--seed", "a u64"));
            }
            "--tasks" => {
                i += 1;
                tasks_override = Some(parse(&args, i, "--tasks", "a positive integer"));
            }
            "--workers" => {
                i += 1;
                workers_override = Some(parse(&args, i, "--workers", "a thread count"));
            }
            "--max-weight" => {
                i += 1;
                max_weight_override = Some(parse(&args, i, "--max-weight", "a positive integer"));
            }
            "--output-dir" => {
                i += 1;
                output_dir = parse(&args, i, "--output-dir", "a path");
            }
            "--gmfs" => {
                i += 1;
                gmfs_path = Some(parse(&args, i, "--gmfs", "a path"));
            }
            "--from-ruptures" => from_ruptures = true,
            "--quiet" => quiet = true,
            other => {
                eprintln!("error: unknown argument {other}");
                process::exit(2);
            }
        }
        i += 1;
    }

    logging::init(if quiet { "warn" } else { "info" });

    let mut config = match &config_path {
        Some(path) => RiskConfig::from_json_file(path).unwrap_or_else(|e| fail(&e.into())),
        None => RiskConfig::canonical(),
    };
    if let Some(seed) = seed_override {
        config.params.master_seed = seed;
    }
    if let Some(n) = tasks_override {
        config.params.concurrent_tasks = n;
    }
    if let Some(n) = workers_override {
        config.params.num_workers = n;
    }
    if max_weight_override.is_some() {
        config.params.max_weight = max_weight_override;
    }

    let scenario = Scenario::from_config(config).unwrap_or_else(|e| fail(&e.into()));
    let hazard = match &gmfs_path {
        Some(path) => {
            let file = File::open(path).unwrap_or_else(|e| {
                eprintln!("error: cannot open {path}: {e}");
                process::exit(1);
            });
            let mut table = GmfTable::read_ndjson(scenario.config.imts.clone(), BufReader::new(file))
                .unwrap_or_else(|e| fail(&e.into()));
            table.sort_by_event();
            HazardInput::Gmfs(table)
        }
        None => scenario.hazard(from_ruptures),
    };

    let store = NdjsonStore::create(&output_dir).unwrap_or_else(|e| fail(&e.into()));
    let mut calc = EventBasedRisk::new(scenario.into_context(), store).unwrap_or_else(|e| fail(&e));
    let summary = calc.run(&hazard).unwrap_or_else(|e| fail(&e));

    let path = format!("{output_dir}/summary.txt");
    if let Err(e) = write_summary(&summary, &path) {
        eprintln!("error: cannot write {path}: {e}");
        process::exit(1);
    }
    if !quiet {
        print_summary(&summary, &output_dir);
    }
}

fn fail(err: &RiskError) -> ! {
    eprintln!("error: {err}");
    process::exit(1);
}

fn write_summary(summary: &RiskSummary, path: &str) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "events={}", summary.num_events)?;
    writeln!(w, "tasks={}", summary.run.tasks)?;
    writeln!(w, "gmf_rows={}", summary.gmf_rows)?;
    writeln!(w, "loss_rows={}", summary.loss_rows)?;
    writeln!(w, "avg_ratio={:?}", summary.avg_ratio)?;
    if let Some(ok) = summary.consistent {
        writeln!(w, "agg_losses_consistent={ok}")?;
    }
    w.flush()
}

fn print_summary(summary: &RiskSummary, output_dir: &str) {
    println!("\n=== Run ===");
    println!("  Events:          {}", summary.num_events);
    println!("  Tasks planned:   {}", summary.num_tasks);
    println!("  Tasks run:       {} ({} skipped)", summary.run.tasks, summary.run.skipped);
    println!("  GMF rows:        {}", summary.gmf_rows);
    println!("  Loss rows:       {}", summary.loss_rows);
    println!("  Output:          {output_dir}/");

    if let Some(agg) = &summary.agg_losses {
        println!("\n=== Aggregate losses (key × realization) ===");
        print!("{:>6} | {:>4}", "Key", "Rlz");
        for lt in &summary.loss_types {
            print!(" | {lt:>16}");
        }
        println!();
        println!("{}", "-".repeat(14 + 19 * summary.loss_types.len()));
        for k in 0..=agg.num_keys {
            let label = if k == agg.num_keys { "total".to_string() } else { k.to_string() };
            for r in 0..agg.num_rlzs {
                print!("{label:>6} | {r:>4}");
                for l in 0..agg.num_loss_types {
                    print!(" | {:>16.2}", agg.get(AggKey(k as u16), RlzId(r as u16), LossTypeIdx(l as u8)));
                }
                println!();
            }
        }
    }

    if let Some(ok) = summary.consistent {
        println!("\n  agg_losses == sum(avg_losses): {}", if ok { "PASS" } else { "FAIL" });
    }
}
