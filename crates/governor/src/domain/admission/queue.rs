//! Fair-share ordering of waiting requests

use std::cmp::Reverse;

use priority_queue::PriorityQueue;

use super::types::RequestId;

/// Queue priority: request priority, then team weight, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub priority: i32,
    pub weight: u32,
    pub arrival: Reverse<u64>,
}

impl QueueKey {
    pub fn new(priority: i32, weight: u32, arrival: u64) -> Self {
        Self {
            priority,
            weight,
            arrival: Reverse(arrival),
        }
    }
}

#[derive(Debug, Default)]
pub struct FairShareQueue {
    queue: PriorityQueue<RequestId, QueueKey>,
}

impl FairShareQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: RequestId, key: QueueKey) {
        self.queue.push(id, key);
    }

    pub fn remove(&mut self, id: &RequestId) -> bool {
        self.queue.remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.queue.get(id).is_some()
    }

    /// Updates the team weight of a waiting request.
    pub fn reweight(&mut self, id: &RequestId, weight: u32) {
        if let Some((_, key)) = self.queue.get(id) {
            let key = QueueKey { weight, ..*key };
            self.queue.change_priority(id, key);
        }
    }

    /// Waiting requests, first in line first.
    pub fn ordered(&self) -> Vec<RequestId> {
        let mut entries: Vec<(&RequestId, &QueueKey)> = self.queue.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// 1-based position of a waiting request.
    pub fn position(&self, id: &RequestId) -> Option<usize> {
        let (_, key) = self.queue.get(id)?;
        Some(self.queue.iter().filter(|(_, other)| *other > key).count() + 1)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
