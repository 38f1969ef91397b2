use super::run::load;
use anyhow::{Context, bail};
use meshsim_core::SimConfig;
use meshsim_engine::Simulation;
use std::path::Path;

pub fn validate(path: &str) -> anyhow::Result<()> {
    let config = load(path, None, None)?;
    // Building reads load profiles and resolves every reference.
    Simulation::new(config.clone()).with_context(|| format!("invalid experiment {path}"))?;
    let operations: usize = config.services.iter().map(|s| s.operations.len()).sum();
    println!(
        "✓ {path}: {} services, {operations} operations, {} generators, {} events",
        config.services.len(),
        config.generators.len(),
        config.events.len()
    );
    Ok(())
}

pub fn init(name: &str, path: &str, force: bool) -> anyhow::Result<()> {
    let output = Path::new(path);
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let config = SimConfig::scaffold(name);
    std::fs::write(output, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
