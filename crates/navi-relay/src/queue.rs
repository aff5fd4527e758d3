use std::collections::VecDeque;

use crate::error::RelayError;

/// Client messages held until the orchestration endpoint reports ready.
/// Owned by a single connection.
#[derive(Debug)]
pub struct PendingQueue {
    items: VecDeque<String>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hold a message. A full queue rejects the newest message.
    pub fn push(&mut self, message: String) -> Result<(), RelayError> {
        if self.items.len() >= self.capacity {
            return Err(RelayError::QueueFull(self.capacity));
        }
        self.items.push_back(message);
        Ok(())
    }

    /// Take every held message in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.items.drain(..)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
