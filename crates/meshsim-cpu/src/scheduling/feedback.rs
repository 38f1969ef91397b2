use super::round_robin::RoundRobin;
use super::{Grant, SchedulingPolicy};
use meshsim_core::ProcessId;
use std::collections::HashMap;

pub(crate) const DEFAULT_LEVELS: usize = 3;

/// Multi-level feedback queue built from nested round robin levels.
///
/// New processes enter level 0. A process granted a burst that does not
/// finish it is demoted one level; the last level keeps its members. Levels
/// are scanned from highest to lowest priority, so sustained load on upper
/// levels starves the lower ones.
#[derive(Debug)]
pub struct MultiLevelFeedback {
    levels: Vec<RoundRobin>,
    /// Level a process enters on its next `enter`.
    assignments: HashMap<ProcessId, usize>,
}

impl Default for MultiLevelFeedback {
    fn default() -> Self {
        Self::new(DEFAULT_LEVELS)
    }
}

impl MultiLevelFeedback {
    /// A level count of zero is raised to one.
    pub fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels.max(1)).map(|_| RoundRobin::default()).collect(),
            assignments: HashMap::new(),
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Level the process is queued in, or will be entered into next.
    pub fn level_of(&self, process: ProcessId) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.contains(process))
            .or_else(|| self.assignments.get(&process).copied())
    }

    fn last(&self) -> usize {
        self.levels.len() - 1
    }

    fn next_from_levels(&mut self) -> Option<(usize, Grant)> {
        self.levels
            .iter_mut()
            .enumerate()
            .find_map(|(i, level)| level.retrieve_next_no_reschedule().map(|g| (i, g)))
    }
}

impl SchedulingPolicy for MultiLevelFeedback {
    fn name(&self) -> &'static str {
        "multi_level_feedback"
    }

    fn enter(&mut self, process: ProcessId, remaining: u64) {
        let level = *self.assignments.entry(process).or_insert(0);
        self.levels[level].enter(process, remaining);
    }

    fn retrieve_next(&mut self) -> Option<Grant> {
        let (level, grant) = self.next_from_levels()?;
        if grant.finishes() {
            self.assignments.remove(&grant.process);
        } else {
            let target = (level + 1).min(self.last());
            self.assignments.insert(grant.process, target);
            self.levels[target].enter(grant.process, grant.remaining - grant.quantum);
        }
        Some(grant)
    }

    fn retrieve_next_no_reschedule(&mut self) -> Option<Grant> {
        let (level, grant) = self.next_from_levels()?;
        if grant.finishes() {
            self.assignments.remove(&grant.process);
        } else {
            self.assignments
                .insert(grant.process, (level + 1).min(self.last()));
        }
        Some(grant)
    }

    fn has_work(&self) -> bool {
        self.levels.iter().any(|l| l.has_work())
    }

    fn total_demand(&self) -> u64 {
        self.levels.iter().map(|l| l.total_demand()).sum()
    }

    fn clear(&mut self) {
        self.levels.iter_mut().for_each(|l| l.clear());
        self.assignments.clear();
    }

    fn len(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }
}
