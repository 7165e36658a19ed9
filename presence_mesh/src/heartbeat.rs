use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Round-robin liveness probe queue.
///
/// One timer serves the whole mesh: the next turn fires `budget / max(1, len)`
/// after the previous one, so the aggregate probe rate stays at one per budget
/// interval no matter how many peers are linked, and each peer gets a turn
/// roughly every `len` budget intervals.
#[derive(Debug)]
pub(crate) struct HeartbeatScheduler {
    queue: VecDeque<Uuid>,
    budget: Duration,
    deadline: Instant,
}

impl HeartbeatScheduler {
    pub fn new(budget: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            budget,
            deadline: Instant::now() + budget,
        }
    }

    pub fn interval(&self) -> Duration {
        self.budget / self.queue.len().max(1) as u32
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Adds a link to the rotation. A link is never queued twice.
    pub fn enqueue(&mut self, id: Uuid) {
        if !self.queue.contains(&id) {
            self.queue.push_back(id);
        }
    }

    pub fn requeue(&mut self, id: Uuid) {
        self.enqueue(id);
    }

    pub fn remove(&mut self, id: Uuid) {
        self.queue.retain(|queued| *queued != id);
    }

    /// Takes the head of the queue for its turn and arms the next tick. The
    /// caller decides whether to requeue it.
    pub fn tick(&mut self) -> Option<Uuid> {
        self.deadline = Instant::now() + self.interval();
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadline = Instant::now() + self.budget;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }
}
