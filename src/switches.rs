//! Runtime operational switches.
//!
//! Flipping a switch takes effect on the next scheduler or partition tick;
//! nothing already running is interrupted.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::AppConfig;

/// Names of the operational switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// Global kill switch for scheduled batch execution
    ExecuteBatchedMigrationsOnSchedule,
    /// Partition creation and detachment
    PartitionManagerSync,
}

impl Switch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteBatchedMigrationsOnSchedule => "execute_batched_migrations_on_schedule",
            Self::PartitionManagerSync => "partition_manager_sync",
        }
    }
}

#[derive(Debug)]
pub struct OperationalSwitches {
    execute_batched_migrations_on_schedule: AtomicBool,
    partition_manager_sync: AtomicBool,
}

impl OperationalSwitches {
    pub fn new(execute_on_schedule: bool, partition_sync: bool) -> Self {
        Self {
            execute_batched_migrations_on_schedule: AtomicBool::new(execute_on_schedule),
            partition_manager_sync: AtomicBool::new(partition_sync),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.scheduler.enabled, config.partitioning.enabled)
    }

    pub fn is_enabled(&self, switch: Switch) -> bool {
        self.flag(switch).load(Ordering::SeqCst)
    }

    pub fn set(&self, switch: Switch, enabled: bool) {
        let previous = self.flag(switch).swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(switch = switch.as_str(), enabled, "Operational switch changed");
        }
    }

    fn flag(&self, switch: Switch) -> &AtomicBool {
        match switch {
            Switch::ExecuteBatchedMigrationsOnSchedule => &self.execute_batched_migrations_on_schedule,
            Switch::PartitionManagerSync => &self.partition_manager_sync,
        }
    }
}

impl Default for OperationalSwitches {
    fn default() -> Self {
        Self::new(true, true)
    }
}
