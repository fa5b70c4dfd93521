//! Kernel target stacks: SCST for iSCSI, nvmet for NVMe-oF.
//!
//! Path states are written straight into sysfs/configfs; target enablement
//! and session teardown go through `scstadmin`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tandem_target::{PathState, Protocol, TargetBackend, TargetEndpoint, TargetError, TargetResult};
use tracing::{debug, info, warn};

use crate::command;

const SCST_CONFIG: &str = "/etc/scst.conf";
const NVMET_CONFIG: &str = "/etc/nvmet/config.json";
/// SCST device group holding every HA LUN.
const DEVICE_GROUP: &str = "targets";
/// ANA group used for HA namespaces.
const ANA_GROUP: u32 = 2;

#[derive(Debug, Clone)]
pub struct KernelTargets {
    scst_root: PathBuf,
    nvmet_root: PathBuf,
    /// This controller's target port group (iSCSI) / nvmet port.
    local_group: String,
}

fn io_error(path: &Path, err: &io::Error) -> TargetError {
    TargetError::Backend(format!("{}: {err}", path.display()))
}

fn alua_state(state: PathState) -> &'static str {
    match state {
        PathState::Optimized => "active",
        PathState::NonOptimized => "nonoptimized",
        PathState::Inaccessible => "unavailable",
    }
}

fn ana_state(state: PathState) -> &'static str {
    match state {
        PathState::Optimized => "optimized",
        PathState::NonOptimized => "non-optimized",
        PathState::Inaccessible => "inaccessible",
    }
}

impl KernelTargets {
    pub fn new(local_group: impl Into<String>) -> Self {
        Self::with_roots("/sys/kernel/scst_tgt", "/sys/kernel/config/nvmet", local_group)
    }

    pub fn with_roots(
        scst_root: impl Into<PathBuf>,
        nvmet_root: impl Into<PathBuf>,
        local_group: impl Into<String>,
    ) -> Self {
        Self {
            scst_root: scst_root.into(),
            nvmet_root: nvmet_root.into(),
            local_group: local_group.into(),
        }
    }

    fn target_group_dir(&self) -> PathBuf {
        self.scst_root
            .join("device_groups")
            .join(DEVICE_GROUP)
            .join("target_groups")
            .join(&self.local_group)
    }

    fn ana_state_file(&self) -> PathBuf {
        self.nvmet_root
            .join("ports")
            .join(&self.local_group)
            .join("ana_groups")
            .join(ANA_GROUP.to_string())
            .join("ana_state")
    }

    fn iscsi_target_dir(&self, iqn: &str) -> PathBuf {
        self.scst_root.join("targets").join("iscsi").join(iqn)
    }

    fn nvmet_port_link(&self, nqn: &str) -> PathBuf {
        self.nvmet_root
            .join("ports")
            .join(&self.local_group)
            .join("subsystems")
            .join(nqn)
    }

    fn scstadmin(args: &[&str]) -> TargetResult<()> {
        command::execute(Command::new("scstadmin").arg("-noprompt").args(args))?;
        Ok(())
    }

    fn write_attr(path: &Path, value: &str) -> TargetResult<()> {
        fs::write(path, value).map_err(|e| io_error(path, &e))?;
        debug!(path = %path.display(), value, "target attribute written");
        Ok(())
    }
}

impl TargetBackend for KernelTargets {
    fn reload(&self) -> TargetResult<()> {
        Self::scstadmin(&["-config", SCST_CONFIG])?;
        if Path::new(NVMET_CONFIG).exists() {
            command::execute(Command::new("nvmetcli").args(["restore", NVMET_CONFIG]))?;
        }
        info!("target configuration reloaded");
        Ok(())
    }

    fn set_path_state(&self, endpoint: &TargetEndpoint, state: PathState) -> TargetResult<()> {
        match endpoint.protocol {
            Protocol::Iscsi => {
                Self::write_attr(&self.target_group_dir().join("state"), alua_state(state))
            }
            Protocol::NvmeOf => Self::write_attr(&self.ana_state_file(), ana_state(state)),
        }
    }

    fn notify_path_change(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        // SCST queues the ALUA unit attention and nvmet the ANA change event
        // when the state attribute is written.
        debug!(endpoint = %endpoint.name, "path change announced by the target stack");
        Ok(())
    }

    fn drop_sessions(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        match endpoint.protocol {
            Protocol::Iscsi => Self::scstadmin(&[
                "-close_sessions",
                "-target",
                &endpoint.identity.portal,
                "-driver",
                "iscsi",
            ]),
            // Unlinking the port disconnects NVMe hosts.
            Protocol::NvmeOf => self.withdraw(endpoint),
        }
    }

    fn advertise(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        let portal = &endpoint.identity.portal;
        match endpoint.protocol {
            Protocol::Iscsi => {
                Self::scstadmin(&["-enable_target", portal, "-driver", "iscsi"])
            }
            Protocol::NvmeOf => {
                let link = self.nvmet_port_link(portal);
                if link.exists() {
                    return Ok(());
                }
                let subsystem = self.nvmet_root.join("subsystems").join(portal);
                std::os::unix::fs::symlink(&subsystem, &link).map_err(|e| io_error(&link, &e))
            }
        }
    }

    fn withdraw(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        let portal = &endpoint.identity.portal;
        match endpoint.protocol {
            Protocol::Iscsi => {
                Self::scstadmin(&["-disable_target", portal, "-driver", "iscsi"])
            }
            Protocol::NvmeOf => {
                let link = self.nvmet_port_link(portal);
                match fs::remove_file(&link) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(&link, &e)),
                    _ => Ok(()),
                }
            }
        }
    }

    fn active_sessions(&self, name: &str) -> Vec<String> {
        let dir = self.iscsi_target_dir(name).join("sessions");
        match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(target = name, error = %e, "failed to list sessions");
                Vec::new()
            }
        }
    }

    fn remove_target(&self, name: &str) -> TargetResult<()> {
        Self::scstadmin(&["-rem_target", name, "-driver", "iscsi"])
    }

    fn alua_settled(&self) -> bool {
        let groups = self
            .scst_root
            .join("device_groups")
            .join(DEVICE_GROUP)
            .join("target_groups");
        let Ok(entries) = fs::read_dir(&groups) else {
            return true;
        };
        entries.filter_map(Result::ok).all(|group| {
            fs::read_to_string(group.path().join("state"))
                .map(|state| !state.trim().starts_with("transitioning"))
                .unwrap_or(true)
        })
    }

    fn lun_present(&self, naa: &str) -> bool {
        let devices = self.scst_root.join("devices");
        let Ok(entries) = fs::read_dir(&devices) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|device| {
            fs::read_to_string(device.path().join("naa_id"))
                .is_ok_and(|id| id.trim().trim_start_matches("0x") == naa.trim_start_matches("0x"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_target::{FailoverMode, LunIdentity};
    use tempfile::TempDir;
    use test_case::test_case;

    fn endpoint(protocol: Protocol) -> TargetEndpoint {
        TargetEndpoint {
            name: "vol1".into(),
            protocol,
            identity: LunIdentity {
                naa: "0x6589cfc000000a1b".into(),
                nguid: "6589cfc0000001c3".into(),
                serial: "f1e2d3".into(),
                portal: "iqn.2005-10.org.tandem.ctl:vol1".into(),
            },
            backing_path: PathBuf::from("/dev/zvol/tank/vol1"),
            lun: 0,
            mode: FailoverMode::AluaAna,
        }
    }

    fn targets() -> (TempDir, KernelTargets) {
        let dir = TempDir::new().unwrap();
        let targets = KernelTargets::with_roots(dir.path().join("scst"), dir.path().join("nvmet"), "controller_A");
        (dir, targets)
    }

    #[test_case(Protocol::Iscsi, PathState::NonOptimized => "nonoptimized")]
    #[test_case(Protocol::Iscsi, PathState::Optimized => "active")]
    #[test_case(Protocol::NvmeOf, PathState::Inaccessible => "inaccessible")]
    fn test_set_path_state_writes_attribute(protocol: Protocol, state: PathState) -> String {
        let (_dir, targets) = targets();
        let file = match protocol {
            Protocol::Iscsi => targets.target_group_dir().join("state"),
            Protocol::NvmeOf => targets.ana_state_file(),
        };
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        targets.set_path_state(&endpoint(protocol), state).unwrap();
        fs::read_to_string(file).unwrap()
    }

    #[test]
    fn test_alua_settled_waits_for_transitioning() {
        let (_dir, targets) = targets();
        assert!(targets.alua_settled());
        let group = targets.target_group_dir();
        fs::create_dir_all(&group).unwrap();
        fs::write(group.join("state"), "transitioning\n").unwrap();
        assert!(!targets.alua_settled());
        fs::write(group.join("state"), "active\n").unwrap();
        assert!(targets.alua_settled());
    }

    #[test]
    fn test_lun_present_matches_naa() {
        let (dir, targets) = targets();
        let device = dir.path().join("scst/devices/vol1");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("naa_id"), "0x6589cfc000000a1b\n").unwrap();
        assert!(targets.lun_present("0x6589cfc000000a1b"));
        assert!(targets.lun_present("6589cfc000000a1b"));
        assert!(!targets.lun_present("0x6589cfc000000fff"));
    }

    #[test]
    fn test_nvme_advertise_and_withdraw_link_port() {
        let (_dir, targets) = targets();
        let nvme = endpoint(Protocol::NvmeOf);
        let link = targets.nvmet_port_link(&nvme.identity.portal);
        fs::create_dir_all(link.parent().unwrap()).unwrap();

        targets.advertise(&nvme).unwrap();
        assert!(link.symlink_metadata().is_ok());
        targets.withdraw(&nvme).unwrap();
        assert!(link.symlink_metadata().is_err());
        targets.withdraw(&nvme).unwrap();
    }

    #[test]
    fn test_sessions_listed_from_sysfs() {
        let (_dir, targets) = targets();
        let iqn = "iqn.2005-10.org.tandem.ctl:vol1";
        assert!(targets.active_sessions(iqn).is_empty());
        let sessions = targets.iscsi_target_dir(iqn).join("sessions");
        fs::create_dir_all(sessions.join("iqn.1993-08.org.debian:01:host1")).unwrap();
        assert_eq!(targets.active_sessions(iqn), vec!["iqn.1993-08.org.debian:01:host1"]);
    }
}
