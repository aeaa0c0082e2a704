use std::collections::VecDeque;

use crate::protocol::Command;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full ({0} commands waiting)")]
    Full(usize),
}

/// FIFO buffer of commands waiting for the executor to pull them.
///
/// Unbounded unless a depth cap is configured. Order is global across all
/// client connections.
#[derive(Debug, Default)]
pub struct CommandQueue {
    max_depth: Option<usize>,
    entries: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            max_depth,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether one more command would be accepted.
    pub fn has_room(&self) -> bool {
        self.max_depth.map_or(true, |max| self.entries.len() < max)
    }

    pub fn enqueue(&mut self, command: Command) -> Result<(), QueueError> {
        if !self.has_room() {
            return Err(QueueError::Full(self.entries.len()));
        }
        self.entries.push_back(command);
        Ok(())
    }

    /// Put back a command whose pickup never reached the executor. It goes to
    /// the head so global order is unchanged; the depth cap does not apply.
    pub fn requeue_front(&mut self, command: Command) {
        self.entries.push_front(command);
    }

    /// Remove the oldest command; `None` means there is nothing to do.
    pub fn dequeue(&mut self) -> Option<Command> {
        self.entries.pop_front()
    }
}
