use serde::{Deserialize, Serialize};

/// Options controlling a scheduling run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    /// Turn reshape, bitcast, concat and slice nodes into views where possible
    pub enable_alias_motion: bool,
    /// Check that no two live buffers share memory after allocation
    pub verify_allocations: bool,
    /// Schedule the bodies of call nodes after their caller
    pub schedule_callees: bool,
    /// Threads used to schedule independent targets (0 = use system default)
    pub thread_count: usize,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            enable_alias_motion: true,
            verify_allocations: true,
            schedule_callees: true,
            thread_count: 0,
        }
    }
}

impl ScheduleOptions {
    /// Create a new schedule options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable alias motion
    pub fn enable_alias_motion(mut self, enable: bool) -> Self {
        self.enable_alias_motion = enable;
        self
    }

    /// Enable or disable the post-allocation overlap check
    pub fn verify_allocations(mut self, enable: bool) -> Self {
        self.verify_allocations = enable;
        self
    }

    /// Enable or disable scheduling of call bodies
    pub fn schedule_callees(mut self, enable: bool) -> Self {
        self.schedule_callees = enable;
        self
    }

    /// Set the number of threads used across targets
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }
}
