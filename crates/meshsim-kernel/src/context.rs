//! Simulation context: the event queue plus the run's only source of randomness.

use crate::event_queue::{EventQueue, Priority};
use meshsim_core::{EventId, SimTime};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub struct SimContext<E> {
    queue: EventQueue<E>,
    rng: ChaCha8Rng,
    seed: u64,
}

impl<E> SimContext<E> {
    pub fn new(seed: u64) -> Self {
        Self {
            queue: EventQueue::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    pub fn schedule_at(&mut self, time: SimTime, priority: Priority, event: E) -> EventId {
        self.queue.schedule_at(time, priority, event)
    }

    pub fn schedule_in(&mut self, delay: f64, priority: Priority, event: E) -> EventId {
        self.queue.schedule_in(delay, priority, event)
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.queue.cancel(id)
    }

    pub fn is_scheduled(&self, id: EventId) -> bool {
        self.queue.is_scheduled(id)
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.queue.peek_time()
    }

    pub fn pop_next(&mut self) -> Option<(EventId, E)> {
        self.queue.pop_next()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
