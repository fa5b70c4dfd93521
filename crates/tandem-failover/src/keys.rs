//! Encryption key synchroniser.
//!
//! The MASTER caches every pool and dataset passphrase it learns and mirrors
//! the cache to the standby, so a takeover can unlock the pools it imports.
//! The cache lives in memory only.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_journal::AlertSink;
use tandem_types::{AlertKind, EncryptionKeys, HaStatus, KeyEntry, KeyRemoval, KeyUpdate};
use tracing::{debug, error, info, warn};

use crate::service::FailoverService;
use crate::{HaError, HaResult};

/// How a dataset's key is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    Passphrase,
    Hex,
    Raw,
}

/// A dataset key as reported by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetKey {
    pub name: String,
    pub key_format: KeyFormat,
    pub key: Option<String>,
}

/// A `change_key` on an encrypted dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    pub name: String,
    pub old_format: KeyFormat,
    pub new_format: KeyFormat,
    pub key: Option<String>,
}

/// Merges `update` into the cache.
pub(crate) fn merge_keys(keys: &mut EncryptionKeys, update: &KeyUpdate) {
    for entry in &update.pools {
        keys.geli.insert(entry.name.clone(), entry.passphrase.clone());
    }
    for entry in &update.datasets {
        keys.zfs.insert(entry.name.clone(), entry.passphrase.clone());
    }
}

/// Drops the named keys; a dataset also drops its children.
pub(crate) fn drop_keys(keys: &mut EncryptionKeys, removal: &KeyRemoval) {
    for name in &removal.pools {
        keys.geli.remove(name);
    }
    for name in &removal.datasets {
        let prefix = format!("{name}/");
        keys.zfs
            .retain(|existing, _| existing != name && !existing.starts_with(&prefix));
    }
}

impl FailoverService {
    /// Copy of the cache.
    pub fn encryption_keys(&self) -> EncryptionKeys {
        self.lock_keys().clone()
    }

    /// `failover.update_encryption_keys`
    pub fn update_encryption_keys(&self, update: KeyUpdate) -> HaResult<()> {
        if update.pools.is_empty() && update.datasets.is_empty() {
            return Err(HaError::Validation(
                "Please specify pools/datasets to update".to_string(),
            ));
        }
        let mut keys = self.lock_keys();
        merge_keys(&mut keys, &update);
        if update.sync_keys {
            self.push_keys(&keys);
        }
        Ok(())
    }

    /// `failover.remove_encryption_keys`
    pub fn remove_encryption_keys(&self, removal: KeyRemoval) -> HaResult<()> {
        if removal.pools.is_empty() && removal.datasets.is_empty() {
            return Err(HaError::Validation(
                "Please specify keys to remove".to_string(),
            ));
        }
        let mut keys = self.lock_keys();
        drop_keys(&mut keys, &removal);
        if removal.sync_keys {
            self.push_keys(&keys);
        }
        Ok(())
    }

    /// Replaces the cache with the copy pushed by the MASTER.
    pub fn put_encryption_keys(&self, keys: EncryptionKeys) {
        debug!(pools = keys.geli.len(), datasets = keys.zfs.len(), "key cache replaced by peer");
        *self.lock_keys() = keys;
    }

    /// `failover.sync_keys_to_remote_node`
    ///
    /// Pushes the cache and the KMIP memory keys to the standby. Only acts
    /// when licensed, MASTER, and the peer answers.
    pub fn sync_keys_to_remote_node(&self) {
        let keys = self.lock_keys();
        self.push_keys(&keys);
    }

    /// Pushes while the caller holds the cache lock.
    fn push_keys(&self, keys: &EncryptionKeys) {
        if !self.licensed() || self.current_status() != HaStatus::Master {
            return;
        }
        if !self.peer_answers() {
            return;
        }

        match self.peer.put_encryption_keys(keys.clone()) {
            Ok(()) => self.alerts.clear(AlertKind::FailoverKeysSyncFailed),
            Err(e) => {
                error!(error = %e, "failed to sync keys with the standby");
                self.alerts
                    .raise(AlertKind::FailoverKeysSyncFailed, e.to_string());
            }
        }

        match self
            .peer
            .kmip_update_memory_keys(self.platform.kmip.memory_keys())
        {
            Ok(()) => self.alerts.clear(AlertKind::FailoverKmipKeysSyncFailed),
            Err(e) => {
                error!(error = %e, "failed to sync KMIP keys with the standby");
                self.alerts
                    .raise(AlertKind::FailoverKmipKeysSyncFailed, e.to_string());
            }
        }
    }

    /// `failover.sync_keys_from_remote_node`
    ///
    /// Asks the MASTER to push its cache here. Only acts when licensed,
    /// BACKUP, and the peer answers.
    pub fn sync_keys_from_remote_node(&self) {
        if !self.licensed() || self.current_status() != HaStatus::Backup {
            return;
        }
        if !self.peer_answers() {
            return;
        }
        if let Err(e) = self.peer.request_keys() {
            error!(error = %e, "failed to sync keys from the active controller");
        }
    }

    pub(crate) fn peer_answers(&self) -> bool {
        matches!(self.peer.ping(Duration::from_secs(2)), Ok(true))
    }

    /// Unlocks every imported pool with the cached keys.
    ///
    /// Returns false if any pool failed to unlock.
    pub fn unlock(&self) -> bool {
        let mut all = true;
        for pool in self.platform.pools.configured().into_iter().filter(|p| p.imported) {
            let keys = self.unlock_zfs_datasets(&pool.name);
            if keys.is_empty() {
                continue;
            }
            if let Err(e) = self.platform.pools.unlock(&pool.name, &keys) {
                warn!(pool = %pool.name, error = %e, "failed to unlock datasets");
                all = false;
            }
        }
        all
    }

    /// Cached keys for `pool` and its datasets.
    pub fn unlock_zfs_datasets(&self, pool: &str) -> Vec<KeyEntry> {
        self.lock_keys().zfs_keys_for_pool(pool)
    }

    // ========================================================================
    // Storage hooks
    // ========================================================================

    pub fn on_pool_export(&self, pool: &str) -> HaResult<()> {
        self.remove_dataset_key(pool)
    }

    /// Datasets unlocked by the user; passphrase keys are cached.
    pub fn on_dataset_unlock(&self, datasets: &[DatasetKey]) -> HaResult<()> {
        let entries: Vec<KeyEntry> = datasets
            .iter()
            .filter(|d| d.key_format == KeyFormat::Passphrase)
            .filter_map(|d| d.key.as_ref().map(|k| KeyEntry::new(d.name.clone(), k.clone())))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        self.update_encryption_keys(KeyUpdate {
            pools: Vec::new(),
            datasets: entries,
            sync_keys: true,
        })
    }

    pub fn on_dataset_create(&self, dataset: &DatasetKey) -> HaResult<()> {
        match (&dataset.key_format, &dataset.key) {
            (KeyFormat::Passphrase, Some(key)) => self.update_encryption_keys(KeyUpdate {
                pools: Vec::new(),
                datasets: vec![KeyEntry::new(dataset.name.clone(), key.clone())],
                sync_keys: true,
            }),
            _ => {
                self.push_kmip_keys();
                Ok(())
            }
        }
    }

    /// Dataset deleted or locked.
    pub fn on_dataset_delete_or_lock(&self, name: &str) -> HaResult<()> {
        self.remove_dataset_key(name)
    }

    pub fn on_dataset_change_key(&self, change: &KeyChange) -> HaResult<()> {
        match (change.new_format, &change.key) {
            (KeyFormat::Passphrase, Some(key)) => self.update_encryption_keys(KeyUpdate {
                pools: Vec::new(),
                datasets: vec![KeyEntry::new(change.name.clone(), key.clone())],
                sync_keys: true,
            }),
            _ if change.old_format == KeyFormat::Passphrase => {
                self.remove_dataset_key(&change.name)
            }
            _ => {
                self.push_kmip_keys();
                Ok(())
            }
        }
    }

    /// The dataset now inherits its parent's encryption root.
    pub fn on_inherit_parent_encryption_root(&self, name: &str) -> HaResult<()> {
        self.remove_dataset_key(name)
    }

    pub fn on_kmip_sync(&self) {
        self.push_kmip_keys();
    }

    fn remove_dataset_key(&self, name: &str) -> HaResult<()> {
        self.remove_encryption_keys(KeyRemoval {
            pools: Vec::new(),
            datasets: vec![name.to_string()],
            sync_keys: true,
        })
    }

    fn push_kmip_keys(&self) {
        if !self.platform.kmip.manages_zfs_keys() {
            return;
        }
        info!("syncing KMIP keys with the standby");
        self.sync_keys_to_remote_node();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tandem_peer::{PeerError, RemoteError, Request};
    use tandem_types::Errno;

    use super::*;
    use crate::testing::{ScriptedPeer, fixture, healthy_backup};

    fn update(datasets: &[(&str, &str)]) -> KeyUpdate {
        KeyUpdate {
            pools: Vec::new(),
            datasets: datasets.iter().map(|(n, p)| KeyEntry::new(*n, *p)).collect(),
            sync_keys: false,
        }
    }

    #[test]
    fn test_empty_requests_rejected() {
        let fx = fixture(ScriptedPeer::down());
        assert!(matches!(
            fx.service.update_encryption_keys(KeyUpdate::default()),
            Err(HaError::Validation(_))
        ));
        assert!(matches!(
            fx.service.remove_encryption_keys(KeyRemoval::default()),
            Err(HaError::Validation(_))
        ));
    }

    #[test]
    fn test_removing_dataset_drops_children() {
        let fx = fixture(ScriptedPeer::down());
        fx.service
            .update_encryption_keys(update(&[("tank/a", "1"), ("tank/a/b", "2"), ("tank/ab", "3")]))
            .unwrap();
        fx.service
            .remove_encryption_keys(KeyRemoval {
                pools: Vec::new(),
                datasets: vec!["tank/a".into()],
                sync_keys: false,
            })
            .unwrap();
        let keys = fx.service.encryption_keys();
        assert_eq!(keys.zfs.keys().collect::<Vec<_>>(), vec!["tank/ab"]);
    }

    #[test]
    fn test_master_pushes_cache_and_kmip_keys() {
        let fx = fixture(ScriptedPeer::new(healthy_backup));
        fx.make_master();
        let mut sync = update(&[("tank/secret", "pw")]);
        sync.sync_keys = true;
        fx.service.update_encryption_keys(sync).unwrap();

        let pushed: Vec<Request> = fx
            .peer
            .calls()
            .into_iter()
            .filter(|r| matches!(r, Request::CachePutEncryptionKeys(_) | Request::KmipUpdateMemoryKeys(_)))
            .collect();
        assert_eq!(pushed.len(), 2);
        match &pushed[0] {
            Request::CachePutEncryptionKeys(keys) => assert_eq!(keys.zfs["tank/secret"], "pw"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backup_does_not_push() {
        let fx = fixture(ScriptedPeer::new(healthy_backup));
        let mut sync = update(&[("tank/secret", "pw")]);
        sync.sync_keys = true;
        fx.service.update_encryption_keys(sync).unwrap();
        assert!(!fx.peer.methods().contains(&"cache.put"));
    }

    #[test]
    fn test_push_failure_raises_alert_then_clears() {
        let fx = fixture(ScriptedPeer::new(|request| match request {
            Request::CachePutEncryptionKeys(keys) if keys.zfs.contains_key("bad") => Err(
                PeerError::Remote(RemoteError::new(Errno::Efault, "cache full")),
            ),
            other => healthy_backup(other),
        }));
        fx.make_master();
        let mut bad = update(&[("bad", "x")]);
        bad.sync_keys = true;
        fx.service.update_encryption_keys(bad).unwrap();
        assert!(fx.service.alerts().is_active(AlertKind::FailoverKeysSyncFailed));
        assert!(!fx.service.alerts().is_active(AlertKind::FailoverKmipKeysSyncFailed));

        fx.service
            .remove_encryption_keys(KeyRemoval {
                pools: Vec::new(),
                datasets: vec!["bad".into()],
                sync_keys: true,
            })
            .unwrap();
        assert!(!fx.service.alerts().is_active(AlertKind::FailoverKeysSyncFailed));
    }

    #[test]
    fn test_change_key_from_passphrase_removes() {
        let fx = fixture(ScriptedPeer::down());
        fx.service.update_encryption_keys(update(&[("tank/d", "pw")])).unwrap();
        fx.service
            .on_dataset_change_key(&KeyChange {
                name: "tank/d".into(),
                old_format: KeyFormat::Passphrase,
                new_format: KeyFormat::Hex,
                key: Some("00ff".into()),
            })
            .unwrap();
        assert!(fx.service.encryption_keys().is_empty());
    }

    #[test]
    fn test_unlock_hook_caches_only_passphrases() {
        let fx = fixture(ScriptedPeer::down());
        fx.service
            .on_dataset_unlock(&[
                DatasetKey {
                    name: "tank/p".into(),
                    key_format: KeyFormat::Passphrase,
                    key: Some("pw".into()),
                },
                DatasetKey {
                    name: "tank/h".into(),
                    key_format: KeyFormat::Hex,
                    key: Some("00".into()),
                },
            ])
            .unwrap();
        assert_eq!(fx.service.encryption_keys().zfs.len(), 1);
        assert_eq!(fx.service.unlock_zfs_datasets("tank").len(), 1);
    }

    proptest! {
        #[test]
        fn prop_update_is_idempotent(
            entries in proptest::collection::vec(("[a-c]{1,2}(/[a-c]{1,2}){0,2}", "[a-z]{1,8}"), 1..8)
        ) {
            let update = KeyUpdate {
                pools: Vec::new(),
                datasets: entries.iter().map(|(n, p)| KeyEntry::new(n.clone(), p.clone())).collect(),
                sync_keys: false,
            };
            let mut once = EncryptionKeys::default();
            merge_keys(&mut once, &update);
            let mut twice = once.clone();
            merge_keys(&mut twice, &update);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_removal_leaves_no_descendants(
            names in proptest::collection::vec("[a-c]{1,2}(/[a-c]{1,2}){0,2}", 1..10),
            target in "[a-c]{1,2}(/[a-c]{1,2}){0,1}",
        ) {
            let mut keys = EncryptionKeys::default();
            for name in &names {
                keys.zfs.insert(name.clone(), "pw".into());
            }
            let removal = KeyRemoval { pools: Vec::new(), datasets: vec![target.clone()], sync_keys: false };
            drop_keys(&mut keys, &removal);
            let prefix = format!("{target}/");
            prop_assert!(keys.zfs.keys().all(|n| *n != target && !n.starts_with(&prefix)));
        }
    }
}
