//! CLI flag definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use group_sync_reconciler::{
    ControllerConfig, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_RESYNC_PERIOD, TARGET_GROUP_ENV,
    resolve_target_group,
};

/// group-sync - per-member projects for one group
#[derive(Parser, Debug)]
#[command(name = "group-sync")]
#[command(version)]
#[command(about = "Keeps one project and edit role binding per member of a watched group")]
#[command(
    long_about = "group-sync watches a single group and, for every member, keeps a project named after them with a <member>-edit role binding granting the edit cluster role. Members leaving the group lose their project."
)]
pub struct Cli {
    /// Group whose membership is reconciled (blank falls back to the default)
    #[arg(long, env = TARGET_GROUP_ENV)]
    pub target_group: Option<String>,

    /// Seconds between redeliveries of the cached group state
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = DEFAULT_RESYNC_PERIOD.as_secs())]
    pub resync_secs: u64,

    /// Capacity of the queue between observer and control loop
    #[arg(long, default_value_t = DEFAULT_EVENT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// YAML manifest of groups, re-read once per resync period
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,
}

impl Cli {
    /// Build the controller configuration from the parsed flags.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::new()
            .with_target_group(resolve_target_group(self.target_group.as_deref()))
            .with_resync_period(Duration::from_secs(self.resync_secs))
            .with_event_queue_capacity(self.queue_capacity)
    }
}
