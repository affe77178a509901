//! PID allocation
//!
//! Small positive integers, unique among currently held identifiers.
//! Under the forward policy the cursor rests on the last issued PID and only
//! moves up, so a freed PID below the cursor waits for the wrap.

use crate::config::PidPolicy;
use std::collections::BTreeSet;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Every PID in `1..=max` is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidError {
    pub max: u32,
}

impl std::fmt::Display for PidError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no free pid (max {})", self.max)
    }
}

impl std::error::Error for PidError {}

/// Pool of held PIDs plus the scan cursor
#[derive(Debug)]
pub struct PidPool {
    held: BTreeSet<u32>,
    cursor: u32,
    max: u32,
    policy: PidPolicy,
}

impl PidPool {
    pub fn new(policy: PidPolicy, max: u32) -> Self {
        Self {
            held: BTreeSet::new(),
            cursor: 1,
            max: max.max(1),
            policy,
        }
    }

    /// Allocate a PID that no live process holds
    pub fn acquire(&mut self) -> Result<Pid, PidError> {
        if self.held.len() as u64 >= self.max as u64 {
            return Err(PidError { max: self.max });
        }

        let pid = match self.policy {
            PidPolicy::Forward => {
                while self.held.contains(&self.cursor) {
                    self.cursor = if self.cursor >= self.max {
                        1
                    } else {
                        self.cursor + 1
                    };
                }
                self.cursor
            }
            PidPolicy::LowestFree => (1..=self.max)
                .find(|candidate| !self.held.contains(candidate))
                .ok_or(PidError { max: self.max })?,
        };

        self.held.insert(pid);
        Ok(Pid(pid))
    }

    /// Return a PID to the pool. Unknown PIDs are ignored.
    pub fn release(&mut self, pid: Pid) -> bool {
        self.held.remove(&pid.0)
    }

    pub fn is_held(&self, pid: Pid) -> bool {
        self.held.contains(&pid.0)
    }

    /// Number of live PIDs
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Default for PidPool {
    fn default() -> Self {
        Self::new(PidPolicy::Forward, crate::config::DEFAULT_PID_MAX)
    }
}
