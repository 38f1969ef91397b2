//! Workload generators: fixed intervals or replayed load profiles.

use crate::operation::OperationRegistry;
use meshsim_core::config::{ArrivalConfig, GeneratorConfig};
use meshsim_core::{OperationId, ServiceId, SimError, SimResult, SimTime};
use std::path::Path;
use tracing::debug;

/// A load curve: `rate` requests at each step time, steps sorted by time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProfile {
    steps: Vec<(f64, u32)>,
}

impl LoadProfile {
    pub fn from_file(path: &Path) -> SimResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SimError::ProfileUnreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Self::parse(&content).map_err(|e| match e {
            SimError::InvalidConfig(msg) => {
                SimError::InvalidConfig(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse `time;rate` or `time,rate` lines.
    ///
    /// Rates are rounded to whole requests. Steps at negative times or
    /// without load are dropped.
    pub fn parse(content: &str) -> SimResult<Self> {
        let mut steps = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split([';', ',']).map(str::trim).collect();
            let malformed =
                || SimError::InvalidConfig(format!("malformed load profile line {}: '{line}'", idx + 1));
            let [time, rate] = fields.as_slice() else {
                return Err(malformed());
            };
            let (Ok(time), Ok(rate)) = (time.parse::<f64>(), rate.parse::<f64>()) else {
                return Err(malformed());
            };
            let rate = rate.round();
            if time.is_finite() && time >= 0.0 && rate >= 1.0 {
                steps.push((time, rate.min(f64::from(u32::MAX)) as u32));
            }
        }
        if steps.is_empty() {
            return Err(SimError::InvalidConfig(
                "load profile defines no arrivals".to_string(),
            ));
        }
        steps.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { steps })
    }

    /// Time between the first and the last step.
    pub fn span(&self) -> f64 {
        match (self.steps.first(), self.steps.last()) {
            (Some(first), Some(last)) => last.0 - first.0,
            _ => 0.0,
        }
    }

    /// Requests in one pass over the profile.
    pub fn total_requests(&self) -> u64 {
        self.steps.iter().map(|(_, rate)| u64::from(*rate)).sum()
    }

    pub fn steps(&self) -> &[(f64, u32)] {
        &self.steps
    }
}

/// Position in a profile, counting repetitions.
#[derive(Debug, Clone)]
struct ProfileCursor {
    profile: LoadProfile,
    /// Offset between two passes; a single pass when absent.
    period: Option<f64>,
    step: usize,
    emitted: u32,
    pass: u32,
}

impl ProfileCursor {
    /// Offset of the next arrival from the generator start.
    fn next_offset(&mut self) -> Option<f64> {
        if self.step >= self.profile.steps.len() {
            self.period?;
            self.step = 0;
            self.pass += 1;
        }
        let (time, rate) = *self.profile.steps.get(self.step)?;
        self.emitted += 1;
        if self.emitted >= rate {
            self.step += 1;
            self.emitted = 0;
        }
        let shift = self.period.map_or(0.0, |p| p * f64::from(self.pass));
        Some(time + shift)
    }
}

#[derive(Debug, Clone)]
enum Arrivals {
    Interval(f64),
    Profile(ProfileCursor),
}

/// Fires user requests for one operation.
#[derive(Debug, Clone)]
pub struct Generator {
    service: ServiceId,
    operation: OperationId,
    arrivals: Arrivals,
    start: f64,
    stop: Option<f64>,
    limit: Option<u64>,
    fired: u64,
}

impl Generator {
    /// Resolve the target and, for profile generators, read the profile.
    pub fn from_config(config: &GeneratorConfig, registry: &OperationRegistry) -> SimResult<Self> {
        let operation = registry.lookup(&config.service, &config.operation)?;
        let arrivals = match &config.arrivals {
            ArrivalConfig::Interval { interval } => Arrivals::Interval(*interval),
            ArrivalConfig::Profile {
                profile,
                repeating,
                repetition_skip,
            } => {
                let profile = LoadProfile::from_file(profile)?;
                let period = repeating.then(|| profile.span() + repetition_skip);
                if period.is_some_and(|p| p <= 0.0) {
                    return Err(SimError::InvalidConfig(format!(
                        "repeating profile of {}.{} needs a positive repetition_skip",
                        config.service, config.operation
                    )));
                }
                debug!(
                    service = %config.service,
                    operation = %config.operation,
                    steps = profile.steps().len(),
                    requests = profile.total_requests(),
                    "load profile read"
                );
                Arrivals::Profile(ProfileCursor {
                    profile,
                    period,
                    step: 0,
                    emitted: 0,
                    pass: 0,
                })
            }
        };
        Ok(Self {
            service: registry.service_id(&config.service)?,
            operation,
            arrivals,
            start: config.start.max(0.0),
            stop: config.stop,
            limit: config.count,
            fired: 0,
        })
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    fn allowed_at(&self, time: f64) -> bool {
        let within_stop = self.stop.is_none_or(|stop| time < stop);
        let within_limit = self.limit.is_none_or(|limit| self.fired < limit);
        within_stop && within_limit
    }

    /// Time of the first request, if any is fired at all.
    pub fn first_fire(&mut self) -> Option<SimTime> {
        let first = match &mut self.arrivals {
            Arrivals::Interval(_) => self.start,
            Arrivals::Profile(cursor) => self.start + cursor.next_offset()?,
        };
        self.allowed_at(first).then_some(SimTime(first))
    }

    /// Count one fired request and return when the next one is due.
    pub fn fire(&mut self, now: SimTime) -> Option<SimTime> {
        self.fired += 1;
        let next = match &mut self.arrivals {
            Arrivals::Interval(interval) if *interval > 0.0 => now + *interval,
            Arrivals::Interval(_) => return None,
            Arrivals::Profile(cursor) => SimTime(self.start + cursor.next_offset()?),
        };
        self.allowed_at(next.as_secs()).then_some(next)
    }
}
