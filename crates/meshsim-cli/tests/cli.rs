use std::path::PathBuf;
use std::process::Command;

fn meshsim() -> Command {
    Command::new(env!("CARGO_BIN_EXE_meshsim"))
}

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    path.to_str().unwrap().to_string()
}

#[test]
fn test_validate_accepts_fixture() {
    let out = meshsim()
        .args(["validate", "--config", &fixture("two_tier.toml")])
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("2 services, 2 operations, 1 generators, 0 events"));
}

#[test]
fn test_validate_rejects_unknown_dependency() {
    let out = meshsim()
        .args(["validate", "--config", &fixture("unknown_dependency.toml")])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("backend"), "stderr: {stderr}");
}

#[test]
fn test_run_prints_json_summary_and_writes_series() {
    let dir = tempfile::tempdir().unwrap();
    let series = dir.path().join("series.json");
    let out = meshsim()
        .args([
            "run",
            "--config",
            &fixture("two_tier.toml"),
            "--duration",
            "2.0",
            "--format",
            "json",
            "--output",
            series.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(out.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["experiment"], "two-tier");
    assert_eq!(summary["seed"], 3);
    assert!(summary["completed"].as_u64().unwrap() > 0);

    let series: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&series).unwrap()).unwrap();
    assert!(series["series"]["gateway.instance_count"].is_array());
}

#[test]
fn test_run_is_reproducible_per_seed() {
    let run = |seed: &str| {
        let out = meshsim()
            .args([
                "run",
                "--config",
                &fixture("two_tier.toml"),
                "--seed",
                seed,
                "--format",
                "json",
            ])
            .output()
            .unwrap();
        assert!(out.status.success());
        out.stdout
    };
    assert_eq!(run("21"), run("21"));
}

#[test]
fn test_sweep_runs_each_seed() {
    let out = meshsim()
        .args([
            "sweep",
            "--config",
            &fixture("two_tier.toml"),
            "--seeds",
            "1,2,3",
            "--format",
            "json",
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    let summaries: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let seeds: Vec<u64> = summaries
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["seed"].as_u64().unwrap())
        .collect();
    assert_eq!(seeds, vec![1, 2, 3]);
}

#[test]
fn test_run_replays_load_profile() {
    let out = meshsim()
        .args(["run", "--config", &fixture("profiled.toml"), "--format", "json"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let summary: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(summary["generated"], 5);
    assert_eq!(summary["completed"], 5);
}

#[test]
fn test_run_writes_dependency_graph() {
    let dir = tempfile::tempdir().unwrap();
    let graph = dir.path().join("deps.dot");
    let out = meshsim()
        .args([
            "run",
            "--config",
            &fixture("two_tier.toml"),
            "--duration",
            "1.0",
            "--graph",
            graph.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    let dot = std::fs::read_to_string(&graph).unwrap();
    assert!(dot.starts_with("digraph \"two-tier\""));
    assert!(dot.contains("\"gateway\" -> \"backend\" [label=\"index -> query\"];"));
    assert!(dot.contains("gateway\\nindex\\n2 instances"));
}
