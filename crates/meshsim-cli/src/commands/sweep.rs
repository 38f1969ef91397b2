use super::run::{execute, load};
use anyhow::Context;
use meshsim_core::SimConfig;
use meshsim_engine::SimulationSummary;
use tracing::info;

/// Seeds to run: the explicit list, or `runs` consecutive seeds from `base`.
fn seed_list(seeds: Vec<u64>, runs: u64, base: u64) -> Vec<u64> {
    if !seeds.is_empty() {
        return seeds;
    }
    (0..runs).map(|i| base.wrapping_add(i)).collect()
}

/// Run one replication per seed on the blocking pool.
pub async fn replicate(base: &SimConfig, seeds: &[u64]) -> anyhow::Result<Vec<SimulationSummary>> {
    let mut handles = Vec::with_capacity(seeds.len());
    for &seed in seeds {
        let mut config = base.clone();
        config.experiment.seed = seed;
        handles.push(tokio::task::spawn_blocking(move || {
            execute(config).map(|outcome| outcome.summary)
        }));
    }

    let mut summaries = Vec::with_capacity(handles.len());
    for (seed, handle) in seeds.iter().zip(handles) {
        let summary = handle
            .await
            .with_context(|| format!("replication with seed {seed} did not finish"))??;
        summaries.push(summary);
    }
    Ok(summaries)
}

pub async fn sweep(path: &str, seeds: Vec<u64>, runs: u64, format: &str) -> anyhow::Result<()> {
    let base = load(path, None, None)?;
    let seeds = seed_list(seeds, runs, base.experiment.seed);
    info!(experiment = %base.experiment.name, replications = seeds.len(), "sweep starting");
    let summaries = replicate(&base, &seeds).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summaries)?),
        _ => print!("{}", format_table(&summaries)),
    }
    Ok(())
}

fn format_table(summaries: &[SimulationSummary]) -> String {
    let mut out = format!(
        "{:<12} {:>10} {:>10} {:>10} {:>9} {:>10} {:>10}\n",
        "SEED", "GENERATED", "COMPLETED", "FAILED", "SUCCESS", "MEAN (s)", "P99 (s)"
    );
    for s in summaries {
        out.push_str(&format!(
            "{:<12} {:>10} {:>10} {:>10} {:>8.1}% {:>10.4} {:>10.4}\n",
            s.seed,
            s.generated,
            s.completed,
            s.failed,
            s.success_rate() * 100.0,
            s.response_times.mean,
            s.response_times.p99
        ));
    }
    if !summaries.is_empty() {
        let n = summaries.len() as f64;
        let success = summaries.iter().map(|s| s.success_rate()).sum::<f64>() / n;
        let mean = summaries.iter().map(|s| s.response_times.mean).sum::<f64>() / n;
        out.push_str(&format!(
            "{:<12} {:>10} {:>10} {:>10} {:>8.1}% {:>10.4}\n",
            "average", "", "", "", success * 100.0, mean
        ));
    }
    out
}
