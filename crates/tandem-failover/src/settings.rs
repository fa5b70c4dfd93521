//! Failover settings: `config`, `update`, `control`.

use tandem_types::{ControlAction, HaConfig, HaConfigUpdate, HaConfigView, NodeSlot};
use tracing::info;

use crate::service::FailoverService;
use crate::{HaError, HaResult};

impl FailoverService {
    /// `failover.config`, as seen from this node.
    pub fn config(&self) -> HaResult<HaConfigView> {
        Ok(self.ha_config()?.view(self.slot()))
    }

    /// Slot that becomes MASTER when this node asks for `master`.
    fn master_slot(&self, master: bool) -> HaResult<NodeSlot> {
        let local = self.slot();
        let chosen = if master { Some(local) } else { local.peer() };
        chosen.ok_or_else(|| {
            HaError::Validation("Unable to change node state in MANUAL mode".to_string())
        })
    }

    /// `failover.update`
    ///
    /// Disabling failover while this node (or the peer) is the configured
    /// MASTER forces that node to take over.
    pub fn update(&self, update: HaConfigUpdate) -> HaResult<HaConfigView> {
        let _job = self.locks.acquire(crate::locks::UPDATE)?;
        let old = self.ha_config()?;
        let mut new = old;
        if let Some(disabled) = update.disabled {
            new.disabled = disabled;
        }
        if let Some(timeout) = update.timeout {
            new.timeout_seconds = timeout;
        }
        if let Some(master) = update.master {
            new.master_slot = self.master_slot(master)?;
        }

        if !new.disabled
            && !self
                .platform
                .network
                .interfaces()
                .iter()
                .any(|i| i.critical)
        {
            return Err(HaError::Validation(
                "You need at least one critical interface to enable failover.".to_string(),
            ));
        }

        self.platform.settings.save_ha_config(&new)?;
        info!(disabled = new.disabled, master = %new.master_slot.as_char(), timeout = new.timeout_seconds, "failover settings updated");

        if new.disabled {
            self.force_configured_master(&new)?;
        }
        self.status_refresh();
        Ok(new.view(self.slot()))
    }

    /// With failover disabled, VRRP no longer elects; the configured MASTER
    /// has to take over explicitly.
    fn force_configured_master(&self, config: &HaConfig) -> HaResult<()> {
        if config.master_slot == self.slot() {
            self.force_master()?;
        } else {
            self.peer.force_master()?;
        }
        Ok(())
    }

    /// `failover.control`
    ///
    /// Returns false if failover already was in the requested state.
    pub fn control(&self, action: ControlAction, active: bool) -> HaResult<bool> {
        let mut config = self.ha_config()?;
        let disable = action == ControlAction::Disable;
        if config.disabled == disable {
            return Ok(false);
        }
        config.disabled = disable;
        config.master_slot = self.master_slot(active)?;
        self.platform.settings.save_ha_config(&config)?;
        info!(?action, master = %config.master_slot.as_char(), "failover control");
        self.status_refresh();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use tandem_peer::Request;

    use super::*;
    use crate::testing::{ScriptedPeer, fixture, fixture_with, healthy_backup};

    #[test]
    fn test_view_is_relative_to_caller() {
        let fx = fixture_with(NodeSlot::B, ScriptedPeer::down());
        let view = fx.service.config().unwrap();
        assert!(!view.master);
        assert_eq!(view.timeout, HaConfig::DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn test_enable_requires_critical_interface() {
        let fx = fixture(ScriptedPeer::down());
        fx.node.state().interfaces[0].critical = false;
        let err = fx
            .service
            .update(HaConfigUpdate {
                timeout: Some(5),
                ..HaConfigUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, HaError::Validation(_)));
    }

    #[test]
    fn test_manual_slot_cannot_choose_master() {
        let fx = fixture_with(NodeSlot::Manual, ScriptedPeer::down());
        let err = fx
            .service
            .update(HaConfigUpdate {
                master: Some(true),
                ..HaConfigUpdate::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Unable to change node state in MANUAL mode");
    }

    #[test]
    fn test_disable_forces_configured_peer() {
        let fx = fixture(ScriptedPeer::new(|request| match request {
            Request::ForceMaster => Ok(tandem_peer::Reply::Bool(true)),
            other => healthy_backup(other),
        }));
        let view = fx
            .service
            .update(HaConfigUpdate {
                disabled: Some(true),
                master: Some(false),
                timeout: None,
            })
            .unwrap();
        assert!(view.disabled);
        assert!(!view.master);
        assert_eq!(fx.node.state().config.master_slot, NodeSlot::B);
        assert!(fx.peer.calls().contains(&Request::ForceMaster));
    }

    #[test]
    fn test_control_is_idempotent() {
        let fx = fixture(ScriptedPeer::down());
        assert!(!fx.service.control(ControlAction::Enable, true).unwrap());
        assert!(fx.service.control(ControlAction::Disable, false).unwrap());
        assert!(fx.node.state().config.disabled);
        assert_eq!(fx.node.state().config.master_slot, NodeSlot::B);
        assert!(!fx.service.control(ControlAction::Disable, true).unwrap());
    }
}
