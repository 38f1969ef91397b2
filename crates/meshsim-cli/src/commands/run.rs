use anyhow::Context;
use meshsim_core::SimConfig;
use meshsim_engine::{DependencyGraph, Reporter, Simulation, SimulationSummary};
use std::path::Path;
use tracing::info;

/// Load an experiment file and apply command-line overrides.
pub fn load(path: &str, seed: Option<u64>, duration: Option<f64>) -> anyhow::Result<SimConfig> {
    let mut config = SimConfig::from_file(Path::new(path))
        .with_context(|| format!("failed to load experiment {path}"))?;
    if let Some(seed) = seed {
        config.experiment.seed = seed;
    }
    if let Some(duration) = duration {
        config.experiment.duration = duration;
    }
    config
        .validate()
        .with_context(|| format!("invalid experiment {path}"))?;
    Ok(config)
}

/// Everything one finished run produced.
pub struct Outcome {
    pub summary: SimulationSummary,
    pub reporter: Reporter,
    pub graph: DependencyGraph,
}

/// Run one experiment to its end.
pub fn execute(config: SimConfig) -> anyhow::Result<Outcome> {
    let name = config.experiment.name.clone();
    let mut sim = Simulation::new(config).context("failed to build simulation")?;
    let summary = sim
        .run()
        .with_context(|| format!("experiment '{name}' aborted"))?;
    Ok(Outcome {
        summary,
        reporter: sim.reporter().clone(),
        graph: sim.dependency_graph(),
    })
}

/// Graphviz for `.dot` paths, JSON otherwise.
fn write_graph(graph: &DependencyGraph, path: &str) -> anyhow::Result<()> {
    let rendered = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("dot" | "gv") => graph.to_dot(),
        _ => graph.to_json()?,
    };
    std::fs::write(path, rendered).with_context(|| format!("failed to write {path}"))?;
    info!(path, services = graph.nodes.len(), links = graph.links.len(), "dependency graph written");
    Ok(())
}

pub struct RunArgs<'a> {
    pub seed: Option<u64>,
    pub duration: Option<f64>,
    pub format: &'a str,
    pub output: Option<&'a str>,
    pub graph: Option<&'a str>,
}

pub fn run(path: &str, args: RunArgs<'_>) -> anyhow::Result<()> {
    let config = load(path, args.seed, args.duration)?;
    info!(experiment = %config.experiment.name, seed = config.experiment.seed, "running experiment");
    let Outcome {
        summary,
        reporter,
        graph,
    } = execute(config)?;

    match args.format {
        "json" => println!("{}", summary.to_json()?),
        _ => print!("{summary}"),
    }

    if let Some(output) = args.output {
        std::fs::write(output, reporter.to_json()?)
            .with_context(|| format!("failed to write {output}"))?;
        info!(path = output, series = reporter.len(), "time series written");
    }
    if let Some(path) = args.graph {
        write_graph(&graph, path)?;
    }
    Ok(())
}
