//! Global admission: caps the number of workers running across all groups.

use crate::error::{QueueError, ReleaseScope};

/// Counts running workers against a fixed ceiling.
#[derive(Debug)]
pub struct GlobalAdmission {
    max_concurrent: usize,
    running: usize,
}

impl GlobalAdmission {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            running: 0,
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        if self.running < self.max_concurrent {
            self.running += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot. Releasing with nothing running is a scheduler bug and
    /// leaves the count at zero.
    pub fn release(&mut self) -> Result<(), QueueError> {
        if self.running == 0 {
            return Err(QueueError::DoubleRelease {
                scope: ReleaseScope::Global,
                group_id: None,
            });
        }
        self.running -= 1;
        Ok(())
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self) -> bool {
        self.running < self.max_concurrent
    }
}
