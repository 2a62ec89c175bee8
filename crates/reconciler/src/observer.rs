//! Group observation.
//!
//! A [`GroupObserver`] delivers lifecycle events for exactly one group over a
//! bounded channel. [`SnapshotObserver`] derives those events from observed
//! group states pushed through a [`GroupFeed`]: it keeps the cached copy of
//! the target group, diffs each new observation against it and redelivers the
//! cached state on every resync tick.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::types::{Group, GroupEvent, GroupName};

/// Source of lifecycle events for a single named group.
#[async_trait]
pub trait GroupObserver: Send {
    /// Scope the observer to `group` and return its event stream.
    ///
    /// Events for any other group never appear on the returned receiver.
    async fn subscribe(&mut self, group: &GroupName) -> Result<mpsc::Receiver<GroupEvent>>;

    /// Begin delivering events.
    async fn start(&mut self) -> Result<()>;

    /// Wait until the initial state has been delivered.
    ///
    /// Returns `false` if that can no longer happen.
    async fn wait_for_initial_sync(&mut self) -> bool;

    /// Stop delivering events and release resources.
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Pending,
    Synced,
    Abandoned,
}

#[derive(Debug)]
enum FeedUpdate {
    Upsert(Group),
    Remove(GroupName),
    Synced,
}

/// Handle used by the transport to push observed group states.
#[derive(Debug, Clone)]
pub struct GroupFeed {
    tx: mpsc::UnboundedSender<FeedUpdate>,
}

impl GroupFeed {
    /// Report the current state of a group.
    ///
    /// # Errors
    ///
    /// Returns `Error::Observer` once the observer has stopped.
    pub fn upsert(&self, group: Group) -> Result<()> {
        self.push(FeedUpdate::Upsert(group))
    }

    /// Report that a group no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::Observer` once the observer has stopped.
    pub fn remove(&self, name: impl Into<GroupName>) -> Result<()> {
        self.push(FeedUpdate::Remove(name.into()))
    }

    /// Report that the initial listing is complete.
    ///
    /// # Errors
    ///
    /// Returns `Error::Observer` once the observer has stopped.
    pub fn mark_synced(&self) -> Result<()> {
        self.push(FeedUpdate::Synced)
    }

    /// Whether the observer has stopped taking updates.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn push(&self, update: FeedUpdate) -> Result<()> {
        self.tx
            .send(update)
            .map_err(|_| Error::observer("observer is no longer running"))
    }
}

/// Observer that turns pushed group states into informer-style events.
pub struct SnapshotObserver {
    resync_period: Duration,
    queue_capacity: usize,
    feed_rx: Option<mpsc::UnboundedReceiver<FeedUpdate>>,
    subscription: Option<(GroupName, mpsc::Sender<GroupEvent>)>,
    sync_rx: watch::Receiver<SyncState>,
    sync_tx: Option<watch::Sender<SyncState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotObserver {
    /// Create an observer and the feed that drives it.
    #[must_use]
    pub fn new(resync_period: Duration, queue_capacity: usize) -> (Self, GroupFeed) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = watch::channel(SyncState::Pending);
        let (stop_tx, _) = watch::channel(false);

        let observer = Self {
            resync_period: resync_period.max(Duration::from_millis(1)),
            queue_capacity: queue_capacity.max(1),
            feed_rx: Some(feed_rx),
            subscription: None,
            sync_rx,
            sync_tx: Some(sync_tx),
            stop_tx,
            task: None,
        };
        (observer, GroupFeed { tx: feed_tx })
    }

    /// Create an observer using the resync period and queue bound of `config`.
    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> (Self, GroupFeed) {
        Self::new(config.resync_period, config.event_queue_capacity)
    }
}

#[async_trait]
impl GroupObserver for SnapshotObserver {
    async fn subscribe(&mut self, group: &GroupName) -> Result<mpsc::Receiver<GroupEvent>> {
        if self.subscription.is_some() {
            return Err(Error::subscription_failed(
                group.as_str(),
                "observer already has a subscription",
            ));
        }
        let (events_tx, events_rx) = mpsc::channel(self.queue_capacity);
        self.subscription = Some((group.clone(), events_tx));
        debug!(group = %group, capacity = self.queue_capacity, "Subscribed to group");
        Ok(events_rx)
    }

    async fn start(&mut self) -> Result<()> {
        let Some((target, events_tx)) = self.subscription.clone() else {
            return Err(Error::observer("start called before subscribe"));
        };
        let (Some(feed_rx), Some(sync_tx)) = (self.feed_rx.take(), self.sync_tx.take()) else {
            return Err(Error::observer("observer already started"));
        };

        let informer = Informer {
            target,
            cache: None,
            synced: false,
            events_tx,
            sync_tx,
        };
        let stop_rx = self.stop_tx.subscribe();
        self.task = Some(tokio::spawn(informer.run(
            feed_rx,
            stop_rx,
            self.resync_period,
        )));
        // The informer task now holds the only sender.
        self.subscription = None;
        Ok(())
    }

    async fn wait_for_initial_sync(&mut self) -> bool {
        match self
            .sync_rx
            .wait_for(|state| *state != SyncState::Pending)
            .await
        {
            Ok(state) => *state == SyncState::Synced,
            Err(_) => false,
        }
    }

    async fn close(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Observer task ended abnormally");
            }
        }
        self.subscription = None;
        debug!("Observer closed");
    }
}

/// Task state: the cached copy of the target group.
struct Informer {
    target: GroupName,
    cache: Option<Group>,
    synced: bool,
    events_tx: mpsc::Sender<GroupEvent>,
    sync_tx: watch::Sender<SyncState>,
}

impl Informer {
    async fn run(
        mut self,
        mut feed_rx: mpsc::UnboundedReceiver<FeedUpdate>,
        mut stop_rx: watch::Receiver<bool>,
        resync_period: Duration,
    ) {
        let first_resync = Instant::now()
            .checked_add(resync_period)
            .unwrap_or_else(Instant::now);
        let mut resync = tokio::time::interval_at(first_resync, resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        loop {
            let event = tokio::select! {
                _ = stop_rx.changed() => break,
                update = feed_rx.recv(), if feed_open => match update {
                    Some(update) => self.apply(update),
                    None => {
                        feed_open = false;
                        if !self.synced {
                            warn!(group = %self.target, "Feed closed before initial sync");
                            self.sync_tx.send_replace(SyncState::Abandoned);
                            break;
                        }
                        debug!(group = %self.target, "Feed closed, continuing with resync only");
                        None
                    }
                },
                _ = resync.tick() => self.resync_event(),
            };

            let Some(event) = event else { continue };
            if !self.deliver(event, &mut stop_rx).await {
                break;
            }
            if self.synced && *self.sync_tx.borrow() == SyncState::Pending {
                self.sync_tx.send_replace(SyncState::Synced);
                info!(group = %self.target, "Initial sync complete");
            }
        }
        debug!(group = %self.target, "Informer stopped");
    }

    /// Fold one feed update into the cache, returning the event to deliver.
    fn apply(&mut self, update: FeedUpdate) -> Option<GroupEvent> {
        match update {
            FeedUpdate::Upsert(group) if group.name != self.target => {
                trace!(group = %group.name, "Ignoring group outside the subscription");
                None
            }
            FeedUpdate::Remove(name) if name != self.target => {
                trace!(group = %name, "Ignoring group outside the subscription");
                None
            }
            FeedUpdate::Upsert(group) => {
                let previous = self.cache.replace(group.clone());
                if !self.synced {
                    return None;
                }
                match previous {
                    None => Some(GroupEvent::Created(group)),
                    Some(old) if old == group => None,
                    Some(old) => Some(GroupEvent::Updated { old, new: group }),
                }
            }
            FeedUpdate::Remove(_) => {
                let previous = self.cache.take();
                if !self.synced {
                    return None;
                }
                previous.map(GroupEvent::Deleted)
            }
            FeedUpdate::Synced => {
                if self.synced {
                    return None;
                }
                self.synced = true;
                match self.cache.clone() {
                    Some(group) => Some(GroupEvent::Created(group)),
                    None => {
                        self.sync_tx.send_replace(SyncState::Synced);
                        info!(group = %self.target, "Initial sync complete, group not present");
                        None
                    }
                }
            }
        }
    }

    fn resync_event(&self) -> Option<GroupEvent> {
        if !self.synced {
            return None;
        }
        self.cache.clone().map(|group| {
            trace!(group = %group.name, "Resync");
            GroupEvent::Updated {
                old: group.clone(),
                new: group,
            }
        })
    }

    /// Push an event to the consumer; false once nobody is listening.
    async fn deliver(&self, event: GroupEvent, stop_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = stop_rx.changed() => false,
            sent = self.events_tx.send(event) => sent.is_ok(),
        }
    }
}
