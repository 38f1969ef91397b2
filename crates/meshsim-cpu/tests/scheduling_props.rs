use meshsim_core::config::PolicyConfig;
use meshsim_core::{EventId, ProcessId, SimTime};
use meshsim_cpu::scheduling::{MIN_QUANTUM, MultiLevelFeedback, RoundRobin, SchedulingPolicy};
use meshsim_cpu::{BurstOutcome, BurstScheduler, Cpu, build_policy};
use proptest::prelude::*;
use std::collections::HashMap;

const PROPTEST_CASES: u32 = 128;

#[derive(Default)]
struct Clock {
    now: f64,
    next: u64,
    pending: Vec<(EventId, ProcessId, u64, f64)>,
}

impl Clock {
    fn pop_earliest(&mut self) -> Option<(ProcessId, u64)> {
        let idx = (0..self.pending.len())
            .min_by(|&a, &b| self.pending[a].3.total_cmp(&self.pending[b].3))?;
        let (_, process, quantum, at) = self.pending.remove(idx);
        self.now = at;
        Some((process, quantum))
    }
}

impl BurstScheduler for Clock {
    fn now(&self) -> SimTime {
        SimTime(self.now)
    }

    fn schedule_burst(&mut self, process: ProcessId, quantum: u64, after: f64) -> EventId {
        let id = EventId(self.next);
        self.next += 1;
        self.pending.push((id, process, quantum, self.now + after));
        id
    }

    fn cancel_burst(&mut self, event: EventId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.0 != event);
        before != self.pending.len()
    }
}

fn policy_strategy() -> impl Strategy<Value = PolicyConfig> {
    prop_oneof![
        Just(PolicyConfig::Fifo),
        Just(PolicyConfig::ShortestProcessNext),
        Just(PolicyConfig::RoundRobin { min_quantum: None }),
        Just(PolicyConfig::MultiLevelFeedback { levels: None }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

    #[test]
    fn test_cpu_runs_all_demand_within_pool(
        policy in policy_strategy(),
        demands in proptest::collection::vec(0u64..500, 1..24),
        pool in 1usize..5,
    ) {
        let mut cpu = Cpu::new(100, pool, build_policy(&policy));
        let mut clock = Clock::default();
        let mut remaining: HashMap<ProcessId, u64> = HashMap::new();
        for demand in &demands {
            let id = cpu.submit(*demand, None, &mut clock);
            remaining.insert(id, *demand);
            prop_assert!(cpu.active_count() <= pool);
        }

        let mut finished = 0;
        while let Some((process, quantum)) = clock.pop_earliest() {
            let left = remaining[&process];
            prop_assert!(quantum <= left);
            match cpu.on_burst_completed(process, quantum, &mut clock).unwrap() {
                BurstOutcome::Finished(p) => {
                    prop_assert_eq!(left, quantum);
                    prop_assert_eq!(p.remainder(), 0);
                    finished += 1;
                }
                BurstOutcome::Continuing => {
                    let now_left = cpu.process(process).unwrap().remainder();
                    prop_assert!(now_left < left);
                    prop_assert_eq!(now_left, left - quantum);
                    remaining.insert(process, now_left);
                }
            }
            prop_assert!(cpu.active_count() <= pool);
        }

        prop_assert_eq!(finished, demands.len());
        prop_assert!(cpu.is_idle());
        if pool == 1 {
            let total: u64 = demands.iter().sum();
            prop_assert!((clock.now - total as f64 / 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_round_robin_quantum_is_floored_median(
        demands in proptest::collection::vec(0u64..1000, 1..32),
    ) {
        let mut rr = RoundRobin::default();
        for (i, demand) in demands.iter().enumerate() {
            rr.enter(ProcessId(i as u64), *demand);
        }
        rr.retrieve_next_no_reschedule().unwrap();

        let mut sorted = demands.clone();
        sorted.sort_unstable();
        let n = sorted.len();
        let median = if n % 2 == 0 { (sorted[n / 2 - 1] + sorted[n / 2]) / 2 } else { sorted[n / 2] };
        prop_assert_eq!(rr.quantum(), median.max(MIN_QUANTUM));
    }

    #[test]
    fn test_feedback_demotes_one_level_per_unfinished_grant(
        demands in proptest::collection::vec(1u64..800, 1..16),
        levels in 1usize..5,
    ) {
        let mut mlfq = MultiLevelFeedback::new(levels);
        let mut left: HashMap<ProcessId, u64> = HashMap::new();
        let mut expected_level: HashMap<ProcessId, usize> = HashMap::new();
        for (i, demand) in demands.iter().enumerate() {
            let id = ProcessId(i as u64);
            mlfq.enter(id, *demand);
            left.insert(id, *demand);
            expected_level.insert(id, 0);
            prop_assert_eq!(mlfq.level_of(id), Some(0));
        }

        while let Some(grant) = mlfq.retrieve_next_no_reschedule() {
            prop_assert_eq!(grant.remaining, left[&grant.process]);
            let rest = grant.remaining - grant.quantum;
            let after = mlfq.level_of(grant.process);
            if rest == 0 {
                prop_assert_eq!(after, None);
                left.remove(&grant.process);
            } else {
                let demoted = (expected_level[&grant.process] + 1).min(levels - 1);
                prop_assert_eq!(after, Some(demoted));
                mlfq.enter(grant.process, rest);
                prop_assert_eq!(mlfq.level_of(grant.process), Some(demoted));
                expected_level.insert(grant.process, demoted);
                left.insert(grant.process, rest);
            }
        }
        prop_assert!(left.is_empty());
    }
}

#[test]
fn test_feedback_demotion_follows_grant_level() {
    let mut mlfq = MultiLevelFeedback::new(3);
    mlfq.enter(ProcessId(0), 1000);
    mlfq.enter(ProcessId(1), 10);
    mlfq.enter(ProcessId(2), 20);

    let first = mlfq.retrieve_next_no_reschedule().unwrap();
    assert_eq!(first.process, ProcessId(0));
    assert_eq!(mlfq.level_of(ProcessId(0)), Some(1));
    mlfq.enter(ProcessId(0), first.remaining - first.quantum);

    // both short processes drain from level 0 before level 1 is touched
    assert_eq!(mlfq.retrieve_next_no_reschedule().unwrap().process, ProcessId(1));
    assert_eq!(mlfq.retrieve_next_no_reschedule().unwrap().process, ProcessId(2));
    let again = mlfq.retrieve_next_no_reschedule().unwrap();
    assert_eq!(again.process, ProcessId(0));
}
