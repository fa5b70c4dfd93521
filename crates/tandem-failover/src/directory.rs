//! Directory service join and leave.
//!
//! The domain-specific work (Kerberos, keytabs, SPNs) lives behind
//! [`DomainJoiner`]; this module picks the joiner for a [`DirectoryKind`],
//! serializes the jobs and enforces that only the active controller joins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem_types::HaStatus;
use tracing::{info, warn};

use crate::locks::DIRECTORY_JOIN_LEAVE;
use crate::service::FailoverService;
use crate::{HaError, HaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DirectoryKind {
    #[serde(rename = "ACTIVEDIRECTORY")]
    Ad,
    Ipa,
    Ldap,
}

impl fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DirectoryKind::Ad => "ACTIVEDIRECTORY",
            DirectoryKind::Ipa => "IPA",
            DirectoryKind::Ldap => "LDAP",
        })
    }
}

pub trait DomainJoiner: Send + Sync {
    fn kind(&self) -> DirectoryKind;

    fn join(&self, domain: &str) -> HaResult<()>;

    /// Work after the machine account exists (keytab, SPNs, services).
    /// A failure here rolls the join back.
    fn post_join(&self, _domain: &str) -> HaResult<()> {
        Ok(())
    }

    fn leave(&self, domain: &str) -> HaResult<()>;
}

pub struct DirectoryServices {
    service: Arc<FailoverService>,
    joiners: BTreeMap<DirectoryKind, Arc<dyn DomainJoiner>>,
}

impl DirectoryServices {
    pub fn new(service: Arc<FailoverService>) -> Self {
        Self {
            service,
            joiners: BTreeMap::new(),
        }
    }

    /// Registers `joiner` for its kind, replacing any previous one.
    pub fn register(&mut self, joiner: Arc<dyn DomainJoiner>) {
        self.joiners.insert(joiner.kind(), joiner);
    }

    fn joiner(&self, kind: DirectoryKind) -> HaResult<&Arc<dyn DomainJoiner>> {
        self.joiners
            .get(&kind)
            .ok_or_else(|| HaError::Validation(format!("{kind} is not supported on this system")))
    }

    fn require_active(&self) -> HaResult<()> {
        match self.service.current_status() {
            HaStatus::Master | HaStatus::Single => Ok(()),
            status => Err(HaError::failed(format!(
                "{status}: may only be joined to a directory through the active storage \
                 controller and if high availability is healthy."
            ))),
        }
    }

    pub fn join(&self, kind: DirectoryKind, domain: &str) -> HaResult<()> {
        let _job = self.service.locks().acquire(DIRECTORY_JOIN_LEAVE)?;
        self.require_active()?;
        let joiner = self.joiner(kind)?;

        joiner.join(domain)?;
        if let Err(e) = joiner.post_join(domain) {
            warn!(%kind, domain, error = %e, "post-join actions failed, rolling back");
            if let Err(rollback) = joiner.leave(domain) {
                warn!(%kind, domain, error = %rollback, "rollback of failed join failed");
            }
            return Err(e);
        }
        info!(%kind, domain, "joined directory");
        Ok(())
    }

    pub fn leave(&self, kind: DirectoryKind, domain: &str) -> HaResult<()> {
        let _job = self.service.locks().acquire(DIRECTORY_JOIN_LEAVE)?;
        self.require_active()?;
        self.joiner(kind)?.leave(domain)?;
        info!(%kind, domain, "left directory");
        Ok(())
    }
}
