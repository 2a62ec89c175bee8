//! Local group source: a YAML manifest polled into the observer feed.
//!
//! ```yaml
//! groups:
//!   - name: redhat-ai-dev-users
//!     users: [alice, bob]
//! ```
//!
//! Groups without a `resource_version` get a generation number that bumps
//! whenever their member list changes.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use group_sync_reconciler::{Group, GroupFeed, GroupName};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    groups: Vec<Group>,
}

/// Parse a manifest document.
///
/// # Errors
///
/// Returns an error if the document is not a valid manifest.
pub fn parse_groups(document: &str) -> Result<Vec<Group>> {
    if document.trim().is_empty() {
        return Ok(Vec::new());
    }
    let manifest: Manifest = serde_yaml::from_str(document).context("Invalid group manifest")?;
    Ok(manifest.groups)
}

/// Manifest file plus the last state pushed from it.
#[derive(Debug)]
pub struct ManifestSource {
    path: PathBuf,
    seen: BTreeMap<GroupName, Group>,
    generation: u64,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest and return its groups with versions assigned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(&mut self) -> Result<Vec<Group>> {
        let document = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read manifest {}", self.path.display()))?;
        let groups = parse_groups(&document)
            .with_context(|| format!("Failed to parse manifest {}", self.path.display()))?;
        Ok(groups.into_iter().map(|g| self.versioned(g)).collect())
    }

    /// Push the current manifest into `feed`, removing groups that vanished.
    ///
    /// Returns how many groups were pushed or removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be loaded or the observer has
    /// stopped.
    pub async fn sync(&mut self, feed: &GroupFeed) -> Result<usize> {
        let groups = self.load().await?;
        let current: BTreeMap<GroupName, Group> =
            groups.into_iter().map(|g| (g.name.clone(), g)).collect();

        let removed: Vec<GroupName> = self
            .seen
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        for name in &removed {
            debug!(group = %name, "Group no longer in manifest");
            feed.remove(name.clone())?;
        }
        for group in current.values() {
            feed.upsert(group.clone())?;
        }

        let changes = removed.len().saturating_add(current.len());
        self.seen = current;
        Ok(changes)
    }

    fn versioned(&mut self, mut group: Group) -> Group {
        if !group.resource_version.is_empty() {
            return group;
        }
        match self.seen.get(&group.name) {
            Some(previous) if previous.users == group.users => {
                group.resource_version.clone_from(&previous.resource_version);
            }
            _ => {
                self.generation = self.generation.saturating_add(1);
                group.resource_version = self.generation.to_string();
            }
        }
        group
    }
}

/// Load the manifest once, mark the listing synced, then re-read it every
/// `period` until the observer stops.
///
/// # Errors
///
/// Returns an error if the first load fails.
pub async fn spawn_poller(
    mut source: ManifestSource,
    feed: GroupFeed,
    period: Duration,
) -> Result<JoinHandle<()>> {
    let pushed = source.sync(&feed).await?;
    feed.mark_synced()?;
    info!(manifest = %source.path().display(), groups = pushed, "Loaded group manifest");

    Ok(tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            if feed.is_closed() {
                debug!("Observer stopped, ending manifest poll");
                break;
            }
            match source.sync(&feed).await {
                Ok(count) => debug!(groups = count, "Re-read group manifest"),
                Err(e) => warn!(error = %e, "Failed to re-read group manifest"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::io::Write;

    use group_sync_reconciler::{GroupEvent, GroupObserver, SnapshotObserver};
    use tempfile::NamedTempFile;

    fn manifest(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn rewrite(file: &NamedTempFile, contents: &str) {
        std::fs::write(file.path(), contents).unwrap();
    }

    #[test]
    fn test_parse_groups_reads_members() {
        let groups = parse_groups(
            "groups:\n  - name: devs\n    users: [alice, bob]\n    resource_version: \"9\"\n",
        )
        .unwrap();

        assert_eq!(
            groups,
            vec![Group::new("devs", ["alice", "bob"]).with_resource_version("9")]
        );
    }

    #[test]
    fn test_empty_document_has_no_groups() {
        assert!(parse_groups("").unwrap().is_empty());
        assert!(parse_groups("groups: []\n").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        assert!(parse_groups("groups: {name: devs").is_err());
    }

    #[tokio::test]
    async fn test_generation_bumps_only_on_member_change() {
        let file = manifest("groups:\n  - name: devs\n    users: [alice]\n");
        let mut source = ManifestSource::new(file.path());
        let (_observer, feed) = SnapshotObserver::new(Duration::from_secs(600), 8);
        let version = |groups: Vec<Group>| groups.into_iter().next().map(|g| g.resource_version);

        source.sync(&feed).await.unwrap();
        assert_eq!(version(source.load().await.unwrap()).as_deref(), Some("1"));

        rewrite(&file, "groups:\n  - name: devs\n    users: [alice, bob]\n");
        assert_eq!(version(source.load().await.unwrap()).as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_missing_file_fails_load() {
        let mut source = ManifestSource::new("/nonexistent/groups.yaml");
        assert!(source.load().await.is_err());
    }

    /// Given a manifest listing the target group
    /// When the poller starts and the manifest later changes
    /// Then the observer sees the listing as Created and the change as Updated
    #[tokio::test]
    async fn test_poller_feeds_observer() {
        let file = manifest("groups:\n  - name: devs\n    users: [alice]\n  - name: ops\n    users: [root]\n");
        let (mut observer, feed) = SnapshotObserver::new(Duration::from_secs(600), 8);
        let mut events = observer.subscribe(&GroupName::from("devs")).await.unwrap();
        observer.start().await.unwrap();

        let poller = spawn_poller(
            ManifestSource::new(file.path()),
            feed,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert!(observer.wait_for_initial_sync().await);
        assert_eq!(
            events.recv().await,
            Some(GroupEvent::Created(
                Group::new("devs", ["alice"]).with_resource_version("1")
            ))
        );

        rewrite(&file, "groups:\n  - name: devs\n    users: [bob]\n");
        let update = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(
            update,
            Some(GroupEvent::Updated {
                old: Group::new("devs", ["alice"]).with_resource_version("1"),
                new: Group::new("devs", ["bob"]).with_resource_version("3"),
            })
        );

        poller.abort();
        observer.close().await;
    }
}
