//! Control loop: observer events in, reconciliation passes out.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::ControllerConfig;
use crate::diff::diff;
use crate::error::{Error, Result};
use crate::observer::GroupObserver;
use crate::reconciler::Reconciler;
use crate::types::{GroupEvent, PassReport};

/// Lifecycle of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Syncing,
    Watching,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Syncing => "syncing",
            Self::Watching => "watching",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    /// Events taken off the queue.
    pub events_handled: usize,
    /// Reconciliation passes run.
    pub passes: usize,
    /// Member failures across all passes.
    pub members_failed: usize,
}

impl LoopSummary {
    fn record(&mut self, report: Option<&PassReport>) {
        self.events_handled = self.events_handled.saturating_add(1);
        if let Some(report) = report {
            self.passes = self.passes.saturating_add(1);
            self.members_failed = self.members_failed.saturating_add(report.failures.len());
        }
    }
}

/// Turns group events into reconciliation passes.
#[derive(Clone)]
pub struct GroupEventHandler {
    reconciler: Arc<Reconciler>,
}

impl GroupEventHandler {
    /// Create a handler backed by `reconciler`.
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Handle one group event, returning the pass report if a pass ran.
    pub async fn handle(&self, event: GroupEvent) -> Option<PassReport> {
        trace!(group = %event.group_name(), kind = event.kind(), "Handling group event");
        match event {
            GroupEvent::Created(group) => {
                info!(group = %group.name, "Detected creation of Group");
                debug!(group = %group.name, resource_version = %group.resource_version, "New Group ResourceVersion");
                let delta = diff(None, &group.member_set());
                Some(self.reconciler.reconcile(&group.name, &delta).await)
            }
            GroupEvent::Updated { old, new } => {
                if old.resource_version == new.resource_version {
                    debug!(group = %new.name, "Resync of Group");
                } else {
                    info!(group = %new.name, "Detected update to Group");
                }
                debug!(
                    group = %new.name,
                    old_resource_version = %old.resource_version,
                    new_resource_version = %new.resource_version,
                    "Group ResourceVersion change"
                );
                let delta = diff(Some(&old.member_set()), &new.member_set());
                Some(self.reconciler.reconcile(&new.name, &delta).await)
            }
            GroupEvent::Deleted(group) => {
                debug!(group = %group.name, "Group was deleted (ignoring)");
                None
            }
        }
    }
}

/// Watches one group and reconciles every membership change.
///
/// Events are consumed one at a time; a pass always finishes before the next
/// event is read or a stop request is honoured.
pub struct ControlLoop<O: GroupObserver> {
    config: ControllerConfig,
    observer: O,
    handler: GroupEventHandler,
    state_tx: watch::Sender<LoopState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<O: GroupObserver> ControlLoop<O> {
    /// Create a new control loop.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(config: ControllerConfig, observer: O, reconciler: Arc<Reconciler>) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(LoopState::Initializing);
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            config,
            observer,
            handler: GroupEventHandler::new(reconciler),
            state_tx,
            stop_tx,
            stop_rx,
        })
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Watch the loop's lifecycle state.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Get the configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Get the event handler.
    pub fn handler(&self) -> &GroupEventHandler {
        &self.handler
    }

    /// Run until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established or the
    /// initial sync does not complete. Per-member failures never surface here.
    pub async fn run(mut self) -> Result<LoopSummary> {
        let group = self.config.target_group.clone();
        let handler = self.handler.clone();
        let mut stop_rx = self.stop_rx.clone();
        let mut summary = LoopSummary::default();

        self.set_state(LoopState::Initializing);
        info!(group = %group, "Starting controller");
        let mut events = match self.observer.subscribe(&group).await {
            Ok(events) => events,
            Err(e) => {
                error!(group = %group, error = %e, "Failed to subscribe to group");
                self.set_state(LoopState::Stopped);
                return Err(e);
            }
        };

        self.set_state(LoopState::Syncing);
        if let Err(e) = self.observer.start().await {
            error!(group = %group, error = %e, "Failed to start observer");
            self.shutdown().await;
            return Err(e);
        }

        let synced = if *stop_rx.borrow_and_update() {
            None
        } else {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => None,
                synced = self.observer.wait_for_initial_sync() => Some(synced),
            }
        };
        match synced {
            None => {
                info!(group = %group, "Stopped before initial sync completed");
                self.shutdown().await;
                return Ok(summary);
            }
            Some(false) => {
                error!(group = %group, "Failed to wait for caches to sync");
                self.shutdown().await;
                return Err(Error::sync_failed(group.as_str()));
            }
            Some(true) => {}
        }

        self.set_state(LoopState::Watching);
        info!(group = %group, "Controller started successfully, watching for updates to Group");

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    info!(group = %group, "Stop requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let report = handler.handle(event).await;
                        summary.record(report.as_ref());
                    }
                    None => {
                        warn!(group = %group, "Event stream closed");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!(
            group = %group,
            events = summary.events_handled,
            passes = summary.passes,
            members_failed = summary.members_failed,
            "Controller shut down gracefully"
        );
        Ok(summary)
    }

    async fn shutdown(&mut self) {
        self.set_state(LoopState::ShuttingDown);
        info!(group = %self.config.target_group, "Shutting down controller");
        self.observer.close().await;
        self.set_state(LoopState::Stopped);
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Control loop state change");
        }
    }
}

/// Handle to stop a control loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
