use meshsim_core::{FailureReason, SimConfig};
use meshsim_engine::{InstanceState, Simulation};
use meshsim_patterns::BreakerStatus;

fn simulation(toml: &str) -> Simulation {
    let config = SimConfig::from_toml_str(toml).unwrap();
    Simulation::new(config).unwrap()
}

fn instance_names(sim: &Simulation, service: &str) -> Vec<String> {
    sim.service(service)
        .unwrap()
        .instances()
        .map(|i| i.name().to_string())
        .collect()
}

const SOLO: &str = r#"
[experiment]
name = "solo"
duration = 10.0

[[services]]
name = "solo"
capacity = 4
instances = 1

[[services.operations]]
name = "work"
demand = 8
"#;

#[test]
fn test_single_request_completes_after_demand_over_capacity() {
    let mut sim = simulation(SOLO);
    let id = sim.submit_request("solo", "work").unwrap();
    assert!(id.is_some());

    sim.run_until(1.999).unwrap();
    assert_eq!(sim.stats().completed(), 0);
    assert_eq!(sim.requests_in_system(), 1);

    sim.run_until(2.0).unwrap();
    assert_eq!(sim.stats().completed(), 1);
    assert_eq!(sim.stats().response_times(), &[2.0]);
    assert_eq!(sim.requests_in_system(), 0);

    let service = sim.service("solo").unwrap();
    let instance = service.instances().next().unwrap();
    assert_eq!(instance.requests_in_system(), 0);
    assert!(instance.cpu().is_idle());
}

#[test]
fn test_unknown_target_is_rejected() {
    let mut sim = simulation(SOLO);
    assert!(sim.submit_request("solo", "missing").is_err());
    assert!(sim.submit_request("nowhere", "work").is_err());
}

const FAN_OUT: &str = r#"
[experiment]
name = "fan-out"
duration = 10.0

[[services]]
name = "gateway"
capacity = 10

[[services.operations]]
name = "index"
demand = 10
dependencies = [
    { service = "backend", operation = "query" },
    { service = "cache", operation = "get" },
]

[[services]]
name = "backend"
capacity = 10

[[services.operations]]
name = "query"
demand = 10

[[services]]
name = "cache"
capacity = 10

[[services.operations]]
name = "get"
demand = 10
"#;

#[test]
fn test_dependencies_complete_before_parent_computes() {
    let mut sim = simulation(FAN_OUT);
    sim.submit_request("gateway", "index").unwrap();

    sim.run_until(1.0).unwrap();
    let gateway = sim.service("gateway").unwrap().instances().next().unwrap();
    assert_eq!(gateway.open_dependency_count(), 0);
    assert_eq!(gateway.requests_in_system(), 1);
    assert_eq!(sim.stats().completed(), 0);

    sim.run_until(5.0).unwrap();
    assert_eq!(sim.stats().completed(), 1);
    assert!((sim.stats().response_times()[0] - 2.0).abs() < 1e-9);
    assert_eq!(sim.requests_in_system(), 0);
    for service in sim.services() {
        for instance in service.instances() {
            assert!(instance.is_quiescent(), "{} not quiescent", instance.name());
        }
    }
}

const BROKEN_BACKEND: &str = r#"
[experiment]
name = "broken"
duration = 12.0

[[services]]
name = "gateway"
capacity = 1000

[[services.patterns]]
type = "circuit_breaker"
rolling_window = 4
error_threshold = 0.5
sleep_window = 10.0

[[services.operations]]
name = "index"
demand = 10
dependencies = [{ service = "backend", operation = "query" }]

[[services]]
name = "backend"
instances = 0

[[services.operations]]
name = "query"
demand = 10

[[generators]]
service = "gateway"
operation = "index"
interval = 1.0
count = 10
"#;

#[test]
fn test_circuit_breaker_opens_after_full_window_of_failures() {
    let mut sim = simulation(BROKEN_BACKEND);
    let summary = sim.run().unwrap();

    let stats = sim.stats();
    assert_eq!(stats.generated(), 10);
    assert_eq!(stats.dependency_failures(FailureReason::NoInstanceAvailable), 4);
    assert_eq!(stats.dependency_failures(FailureReason::CircuitOpen), 6);
    assert_eq!(stats.failures(FailureReason::DependencyNotAvailable), 10);
    assert_eq!(summary.completed, 0);
    assert_eq!(sim.requests_in_system(), 0);

    let backend = sim.registry().service_id("backend").unwrap();
    let gateway = sim.service("gateway").unwrap().instances().next().unwrap();
    let breaker = gateway.patterns().breaker.as_ref().unwrap();
    assert!(breaker.state(backend).unwrap().is_open());
    assert_eq!(breaker.active_connections(backend), 0);
}

fn breaker_status(sim: &Simulation) -> BreakerStatus {
    let backend = sim.registry().service_id("backend").unwrap();
    let gateway = sim.service("gateway").unwrap().instances().next().unwrap();
    let breaker = gateway.patterns().breaker.as_ref().unwrap();
    breaker.state(backend).unwrap().status()
}

#[test]
fn test_open_circuit_retries_after_sleep_window() {
    let toml = BROKEN_BACKEND.replace("sleep_window = 10.0", "sleep_window = 2.0");
    let mut sim = simulation(&toml);

    sim.run_until(2.5).unwrap();
    assert_eq!(breaker_status(&sim), BreakerStatus::Closed);
    sim.run_until(3.0).unwrap();
    assert_eq!(breaker_status(&sim), BreakerStatus::Open);

    // Half-open at 3 + 2: the trial request goes out and fails again.
    sim.run_until(4.9).unwrap();
    assert_eq!(sim.stats().dependency_failures(FailureReason::NoInstanceAvailable), 4);
    assert_eq!(sim.stats().dependency_failures(FailureReason::CircuitOpen), 1);
    sim.run_until(5.0).unwrap();
    assert_eq!(sim.stats().dependency_failures(FailureReason::NoInstanceAvailable), 5);
    assert_eq!(breaker_status(&sim), BreakerStatus::Open);

    // Reopened with a fresh timer: rejected at 6, trial again at 7.
    sim.run_until(6.0).unwrap();
    assert_eq!(sim.stats().dependency_failures(FailureReason::CircuitOpen), 2);
    sim.run_until(7.0).unwrap();
    assert_eq!(sim.stats().dependency_failures(FailureReason::NoInstanceAvailable), 6);

    // Last trial at 9 re-arms for 11; no traffic after that.
    sim.run().unwrap();
    let stats = sim.stats();
    assert_eq!(stats.dependency_failures(FailureReason::NoInstanceAvailable), 7);
    assert_eq!(stats.dependency_failures(FailureReason::CircuitOpen), 3);
    assert_eq!(stats.failures(FailureReason::DependencyNotAvailable), 10);
    assert_eq!(breaker_status(&sim), BreakerStatus::HalfOpen);
    assert_eq!(sim.requests_in_system(), 0);
}

#[test]
fn test_circuit_closes_when_backend_recovers() {
    let toml = format!(
        "{}\n[[events]]\nkind = \"scale\"\nservice = \"backend\"\ninstances = 1\nat = 4.5\n",
        BROKEN_BACKEND.replace("sleep_window = 10.0", "sleep_window = 2.0")
    );
    let mut sim = simulation(&toml);

    sim.run_until(4.9).unwrap();
    assert_eq!(breaker_status(&sim), BreakerStatus::Open);
    assert_eq!(sim.service("backend").unwrap().running_count(), 1);

    // The half-open trial at 5 reaches the new backend and closes the circuit.
    sim.run_until(5.5).unwrap();
    assert_eq!(breaker_status(&sim), BreakerStatus::Closed);
    assert_eq!(sim.stats().completed(), 1);

    let summary = sim.run().unwrap();
    let stats = sim.stats();
    assert_eq!(stats.dependency_failures(FailureReason::NoInstanceAvailable), 4);
    assert_eq!(stats.dependency_failures(FailureReason::CircuitOpen), 1);
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 5);
    assert_eq!(breaker_status(&sim), BreakerStatus::Closed);
}

#[test]
fn test_retries_until_budget_is_spent() {
    let toml = r#"
[experiment]
name = "retry"
duration = 5.0

[[services]]
name = "gateway"

[[services.patterns]]
type = "retry"
max_tries = 3
base_backoff = 0.1
backoff_base = 2.0
jitter = false

[[services.operations]]
name = "index"
demand = 10
dependencies = [{ service = "backend", operation = "query" }]

[[services]]
name = "backend"
instances = 0

[[services.operations]]
name = "query"
demand = 10
"#;
    let mut sim = simulation(toml);
    sim.submit_request("gateway", "index").unwrap();

    sim.run_until(0.69).unwrap();
    assert_eq!(sim.stats().retries(), 3);
    assert_eq!(sim.stats().failed(), 0);

    sim.run_until(5.0).unwrap();
    let stats = sim.stats();
    assert_eq!(stats.retries(), 3);
    assert_eq!(stats.dependency_failures(FailureReason::MaxRetriesReached), 1);
    assert_eq!(stats.failures(FailureReason::DependencyNotAvailable), 1);
    assert_eq!(sim.requests_in_system(), 0);

    let gateway = sim.service("gateway").unwrap().instances().next().unwrap();
    assert_eq!(gateway.patterns().retry.as_ref().unwrap().tracked(), 0);
}

const POOL: &str = r#"
[experiment]
name = "pool"
duration = 30.0

[[services]]
name = "svc"
capacity = 10
instances = 3
load_balancer = "round_robin"

[[services.operations]]
name = "work"
demand = 100
"#;

#[test]
fn test_scale_down_drains_least_utilized_instances_first() {
    let mut sim = simulation(POOL);
    sim.submit_request("svc", "work").unwrap();
    sim.submit_request("svc", "work").unwrap();
    sim.run_until(0.0).unwrap();

    sim.scale("svc", 2).unwrap();
    assert_eq!(instance_names(&sim, "svc"), vec!["svc#0", "svc#1"]);

    // Both remaining instances are busy; the older one drains.
    sim.scale("svc", 1).unwrap();
    let svc = sim.service("svc").unwrap();
    assert_eq!(svc.instance_count(), 1);
    let states: Vec<InstanceState> = svc.instances().map(|i| i.state()).collect();
    assert_eq!(states, vec![InstanceState::ShuttingDown, InstanceState::Running]);

    sim.run_until(10.0).unwrap();
    assert_eq!(sim.stats().completed(), 2);
    assert_eq!(instance_names(&sim, "svc"), vec!["svc#1"]);
}

#[test]
fn test_draining_instance_waits_for_open_dependencies() {
    let toml = r#"
[experiment]
name = "drain"
duration = 10.0

[[services]]
name = "gateway"
capacity = 10
instances = 2

[[services.operations]]
name = "index"
demand = 10
dependencies = [{ service = "backend", operation = "query" }]

[[services]]
name = "backend"
capacity = 100

[[services.operations]]
name = "query"
demand = 100
"#;
    let mut sim = simulation(toml);
    sim.submit_request("gateway", "index").unwrap();
    sim.submit_request("gateway", "index").unwrap();
    sim.run_until(0.5).unwrap();

    // Both gateways idle on their dependency; the older one drains.
    sim.scale("gateway", 1).unwrap();
    let gateway = sim.service("gateway").unwrap();
    let states: Vec<InstanceState> = gateway.instances().map(|i| i.state()).collect();
    assert_eq!(states, vec![InstanceState::ShuttingDown, InstanceState::Running]);
    let draining = gateway.instances().next().unwrap();
    assert_eq!(draining.open_dependency_count(), 1);
    assert_eq!(draining.requests_in_system(), 1);

    // The answer is still accepted and the parent computes.
    sim.run_until(1.5).unwrap();
    let draining = sim.service("gateway").unwrap().instances().next().unwrap();
    assert_eq!(draining.name(), "gateway#0");
    assert_eq!(draining.state(), InstanceState::ShuttingDown);
    assert_eq!(draining.open_dependency_count(), 0);
    assert_eq!(draining.requests_in_system(), 1);

    sim.run_until(10.0).unwrap();
    let stats = sim.stats();
    assert_eq!(stats.completed(), 2);
    assert_eq!(stats.failed(), 0);
    assert_eq!(sim.requests_in_system(), 0);
    assert_eq!(instance_names(&sim, "gateway"), vec!["gateway#1"]);
}

#[test]
fn test_killed_instance_fails_its_requests() {
    let mut sim = simulation(POOL);
    sim.submit_request("svc", "work").unwrap();
    sim.submit_request("svc", "work").unwrap();
    sim.run_until(1.0).unwrap();

    assert_eq!(sim.kill_instances("svc", 1).unwrap(), 1);
    assert_eq!(instance_names(&sim, "svc"), vec!["svc#1", "svc#2"]);

    sim.run_until(20.0).unwrap();
    let stats = sim.stats();
    assert_eq!(stats.failures(FailureReason::HandlingInstanceDied), 1);
    assert_eq!(stats.completed(), 1);
    assert_eq!(sim.requests_in_system(), 0);
}

#[test]
fn test_kill_event_from_experiment() {
    let toml = format!(
        "{POOL}\n[[events]]\nkind = \"kill_instances\"\nservice = \"svc\"\ncount = 5\nat = 1.0\n"
    );
    let mut sim = simulation(&toml);
    sim.submit_request("svc", "work").unwrap();
    let summary = sim.run().unwrap();
    assert_eq!(summary.failures.get(&FailureReason::HandlingInstanceDied), Some(&1));
    assert_eq!(summary.instances.get("svc"), Some(&0));
}

#[test]
fn test_injected_delay_slows_dependency() {
    let toml = r#"
[experiment]
name = "delay"
duration = 10.0

[[services]]
name = "gateway"
capacity = 10

[[services.operations]]
name = "index"
demand = 10
dependencies = [{ service = "backend", operation = "query" }]

[[services]]
name = "backend"
capacity = 10

[[services.operations]]
name = "query"
demand = 10

[[generators]]
service = "gateway"
operation = "index"
interval = 5.0
start = 1.0

[[events]]
kind = "delay"
service = "gateway"
extra = 0.5
at = 0.5
duration = 3.0
"#;
    let mut sim = simulation(toml);
    sim.run().unwrap();
    let times = sim.stats().response_times();
    assert_eq!(times.len(), 2);
    // First request inside the injection window, second after it ended.
    assert!((times[0] - 2.5).abs() < 1e-9);
    assert!((times[1] - 2.0).abs() < 1e-9);
}

#[test]
fn test_autoscaler_reacts_to_overload() {
    let toml = r#"
[experiment]
name = "autoscale"
duration = 3.0

[[services]]
name = "api"
capacity = 100

[services.autoscaler]
target_demand = 0.5
min_instances = 1
max_instances = 4
interval = 1.0
scale_up_hold = 0.0

[[services.operations]]
name = "call"
demand = 50

[[generators]]
service = "api"
operation = "call"
interval = 0.1
"#;
    let mut sim = simulation(toml);
    sim.run_until(1.5).unwrap();
    assert_eq!(sim.service("api").unwrap().instance_count(), 4);
}

#[test]
fn test_reporter_samples_every_interval() {
    let toml = SOLO.replace("duration = 10.0", "duration = 3.0\nreport_interval = 1.0");
    let mut sim = simulation(&toml);
    sim.submit_request("solo", "work").unwrap();
    sim.run().unwrap();

    let count = sim.reporter().series("solo.instance_count").unwrap();
    let times: Vec<f64> = count.iter().map(|p| p.time).collect();
    assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0]);

    let busy = sim.reporter().series("solo#0.cpu.usage").unwrap();
    assert_eq!(busy[1].value, 1.0);
    assert_eq!(busy[3].value, 0.0);
}

#[test]
fn test_same_seed_same_outcome() {
    let run = |seed: u64| {
        let mut config = SimConfig::scaffold("determinism");
        config.experiment.duration = 5.0;
        config.experiment.seed = seed;
        config.network.max_latency = 0.05;
        let mut sim = Simulation::new(config).unwrap();
        sim.run().unwrap().to_json().unwrap()
    };
    assert_eq!(run(11), run(11));
}

#[test]
fn test_profile_generator_replays_load_curve() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("load.csv"), "0.5;2\n1.5;1\n").unwrap();
    let toml = format!(
        "{SOLO}\n[[generators]]\nservice = \"solo\"\noperation = \"work\"\nprofile = \"load.csv\"\nrepeating = true\nrepetition_skip = 2.0\nstop = 6.0\n"
    );
    let mut config = SimConfig::from_toml_str(&toml).unwrap();
    config.resolve_paths(dir.path());
    let mut sim = Simulation::new(config).unwrap();
    let summary = sim.run().unwrap();

    // Passes start at 0.5 and 3.5; the third one would start at 6.5.
    assert_eq!(summary.generated, 6);
    let generator = sim.generators().first().unwrap();
    assert_eq!(generator.fired(), 6);
}

#[test]
fn test_missing_load_profile_fails_construction() {
    let toml = format!(
        "{SOLO}\n[[generators]]\nservice = \"solo\"\noperation = \"work\"\nprofile = \"/nonexistent/load.csv\"\n"
    );
    let config = SimConfig::from_toml_str(&toml).unwrap();
    assert!(matches!(
        Simulation::new(config),
        Err(meshsim_core::SimError::ProfileUnreadable { .. })
    ));
}

#[test]
fn test_dependency_graph_reflects_live_instances() {
    let mut sim = simulation(FAN_OUT);
    sim.scale("backend", 3).unwrap();
    let graph = sim.dependency_graph();
    assert_eq!(graph.experiment, "fan-out");
    let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["gateway", "backend", "cache"]);
    assert_eq!(graph.nodes[1].instances, 3);
    let targets: Vec<usize> = graph.links.iter().map(|l| l.target).collect();
    assert_eq!(targets, vec![1, 2]);
    assert!(graph.links.iter().all(|l| l.source == 0));
}
