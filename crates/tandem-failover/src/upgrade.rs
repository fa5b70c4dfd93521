//! Rolling upgrade of the pair.
//!
//! `upgrade` installs the new image on both controllers and reboots the
//! standby into it while the MASTER keeps serving from the old boot
//! environment. `upgrade_finish` (or a failover onto the upgraded standby)
//! completes it.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::PoisonError;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tandem_types::{BootEnvironment, Errno, HaStatus, JobState};
use tracing::{debug, info};

use crate::bus::FailoverEvent;
use crate::locks::{FAILOVER_UPGRADE, FAILOVER_UPGRADE_FINISH};
use crate::platform::HA_UPGRADE_FLAG;
use crate::service::FailoverService;
use crate::{HaError, HaResult};

/// Progress of the running upgrade job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProgress {
    pub percent: Option<u8>,
    pub description: String,
}

/// First free boot environment name: `version`, then `version-1`, `version-2`...
pub fn boot_environment_name(version: &str, existing: &BTreeSet<String>) -> String {
    if !existing.contains(version) {
        return version.to_string();
    }
    (1..)
        .map(|n| format!("{version}-{n}"))
        .find(|name| !existing.contains(name))
        .unwrap_or_else(|| version.to_string())
}

fn active_boot_environment(environments: &[BootEnvironment]) -> Option<&BootEnvironment> {
    environments.iter().find(|be| be.active)
}

impl FailoverService {
    fn progress(&self, percent: Option<u8>, description: &str) {
        info!(?percent, "{description}");
        *self
            .upgrade_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(UpgradeProgress {
            percent,
            description: description.to_string(),
        });
    }

    pub fn upgrade_progress(&self) -> Option<UpgradeProgress> {
        self.upgrade_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `failover.upgrade`
    pub fn upgrade(&self, train: Option<&str>) -> HaResult<bool> {
        let _job = self.locks.acquire(FAILOVER_UPGRADE)?;
        self.require_master()?;
        if !self.peer.system_ready()? {
            return Err(HaError::failed("Standby Controller is not ready."));
        }

        self.progress(Some(5), "Staging update image");
        let image = self.platform.updates.stage(train)?;

        let local_environments = self.platform.updates.boot_environments()?;
        let previous = active_boot_environment(&local_environments)
            .map(|be| be.id.clone())
            .ok_or_else(|| HaError::failed("Could not find current boot environment."))?;
        let existing: BTreeSet<String> = local_environments
            .iter()
            .chain(self.peer.boot_environments()?.iter())
            .map(|be| be.id.clone())
            .collect();
        let name = boot_environment_name(&image.version, &existing);

        self.progress(Some(10), "Sending update image to Standby Controller");
        let remote_dir = self.peer.recreate_upload_area()?;
        let file_name = image
            .path
            .file_name()
            .ok_or_else(|| HaError::Validation(format!("bad image path {}", image.path.display())))?;
        let remote_image = remote_dir.join(file_name);
        self.peer.send_file(&image.path, &remote_image)?;

        self.progress(Some(20), "Installing update on both controllers");
        self.run_updates(&image.path, &remote_image, &name)?;

        self.progress(Some(80), "Rebooting Standby Controller");
        let boot_id = self.peer.boot_id()?;
        self.peer.reboot(self.settings.upgrade_reboot_delay.as_secs())?;
        self.wait_standby_down()?;

        self.progress(Some(90), "Waiting for Standby Controller to boot");
        if !self.upgrade_waitstandby()? {
            return Err(HaError::Timeout {
                what: "Standby Controller to boot".to_string(),
                waited: self.settings.boot_wait,
            });
        }
        if self.peer.boot_id()? == boot_id {
            return Err(HaError::failed("Standby Controller failed to reboot."));
        }

        // Keep serving from the old image until the upgrade is finished.
        self.platform.updates.activate(&previous)?;
        self.platform.settings.set_flag(HA_UPGRADE_FLAG, true)?;
        self.progress(Some(100), "Standby Controller upgraded");
        Ok(true)
    }

    fn run_updates(&self, local_image: &Path, remote_image: &Path, name: &str) -> HaResult<()> {
        let local_job = self.platform.updates.start_update(local_image, name)?;
        let remote_job = self.peer.start_update(remote_image, name)?;
        loop {
            let local = self.platform.updates.job_status(local_job)?;
            let remote = self.peer.job_status(remote_job)?;
            if let JobState::Failed(reason) = &local {
                return Err(HaError::failed(format!("Local update failed: {reason}")));
            }
            if let JobState::Failed(reason) = &remote {
                return Err(HaError::failed(format!(
                    "Standby Controller update failed: {reason}"
                )));
            }
            if local == JobState::Success && remote == JobState::Success {
                return Ok(());
            }
            let combined = u16::from(local.percent().min(remote.percent()));
            self.progress(
                Some(20 + (combined * 6 / 10) as u8),
                "Installing update on both controllers",
            );
            thread::sleep(self.settings.upgrade_poll);
        }
    }

    /// Waits for the rebooting standby to stop answering.
    fn wait_standby_down(&self) -> HaResult<()> {
        let started = Instant::now();
        while started.elapsed() < self.settings.shutdown_wait {
            match self.peer.ping(Duration::from_secs(5)) {
                Ok(true) => thread::sleep(self.settings.upgrade_poll),
                _ => return Ok(()),
            }
        }
        Err(HaError::with_errno(
            Errno::Etimedout,
            "Timed out waiting for Standby Controller to reboot.",
        ))
    }

    /// Waits until the standby is up, idle and BACKUP.
    ///
    /// Network failures while it boots are retried; other errors abort.
    pub fn upgrade_waitstandby(&self) -> HaResult<bool> {
        let started = Instant::now();
        while started.elapsed() < self.settings.boot_wait {
            match self.standby_settled() {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_peer_down() || e.errno() == Some(Errno::Etimedout) => {
                    debug!(error = %e, "standby not reachable yet");
                }
                Err(e) => return Err(e),
            }
            thread::sleep(self.settings.upgrade_poll);
        }
        Ok(false)
    }

    fn standby_settled(&self) -> HaResult<bool> {
        Ok(self.peer.system_ready()?
            && !self.peer.in_progress()?
            && self.peer.status()? == HaStatus::Backup)
    }

    /// `failover.upgrade_pending`
    pub fn upgrade_pending(&self) -> HaResult<bool> {
        self.require_master()?;
        if !self.platform.settings.flag(HA_UPGRADE_FLAG) {
            return Ok(false);
        }
        if !matches!(self.peer.ping(Duration::from_secs(5)), Ok(true)) {
            return Ok(true);
        }
        if self.platform.system.version() == self.peer.version()? {
            self.platform.settings.set_flag(HA_UPGRADE_FLAG, false)?;
            return Ok(false);
        }
        let Some(pending) = self.pending_boot_environment()? else {
            return Ok(false);
        };
        Ok(self
            .peer
            .boot_environments()?
            .iter()
            .any(|be| be.id == pending.id))
    }

    /// The upgraded boot environment: present locally but not booted.
    fn pending_boot_environment(&self) -> HaResult<Option<BootEnvironment>> {
        Ok(self
            .platform
            .updates
            .boot_environments()?
            .into_iter()
            .rev()
            .find(|be| !be.active))
    }

    /// `failover.upgrade_finish`
    ///
    /// Activates the new boot environment on the standby and reboots it.
    pub fn upgrade_finish(&self) -> HaResult<bool> {
        let _job = self.locks.acquire(FAILOVER_UPGRADE_FINISH)?;
        self.require_master()?;

        self.progress(None, "Waiting for Standby Controller to boot");
        if !self.upgrade_waitstandby()? {
            return Err(HaError::Timeout {
                what: "Standby Controller to boot".to_string(),
                waited: self.settings.boot_wait,
            });
        }

        self.progress(None, "Activating new boot environment");
        let pending = self
            .pending_boot_environment()?
            .ok_or_else(|| HaError::failed("Could not find current boot environment."))?;
        self.peer.activate_boot_environment(&pending.id)?;

        self.progress(None, "Rebooting Standby Controller");
        self.peer.reboot(self.settings.finish_reboot_delay.as_secs())?;
        self.platform.settings.set_flag(HA_UPGRADE_FLAG, false)?;
        Ok(true)
    }

    /// Runs once the node reports ready after boot.
    ///
    /// A BACKUP pulls the key cache from the MASTER, and announces an
    /// upgrade left half done (`HA_UPGRADE` still set) so an operator can
    /// finish it from the MASTER.
    pub fn on_system_ready(&self) {
        if !self.licensed() || self.current_status() != HaStatus::Backup {
            return;
        }
        self.sync_keys_from_remote_node();
        if self.platform.settings.flag(HA_UPGRADE_FLAG) {
            info!("upgrade pending, waiting for it to be finished");
            self.bus
                .publish(FailoverEvent::UpgradePendingAdded { pending: true });
        }
    }
}
