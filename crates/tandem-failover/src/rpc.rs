//! Glue between the failover service and the interlink.
//!
//! - [`Dispatcher`] serves inbound calls from the other controller
//! - [`PeerLink`] feeds the journal replicator
//! - [`PeerTargets`] lets the target engine coordinate with the peer

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tandem_journal::{JournalEntry, LinkError, ReplicaLink};
use tandem_peer::{
    PeerClient, PeerError, RemoteError, Reply, Request, RequestHandler, Response, Session,
};
use tandem_target::{TargetBackend, TargetError, TargetPeer, TargetResult};
use tandem_types::{Errno, JournalGeneration};
use tokio::sync::mpsc;
use tracing::trace;

use crate::database::ship_database;
use crate::events::VrrpEvent;
use crate::service::FailoverService;
use crate::{HaError, HaResult};

// ============================================================================
// Inbound
// ============================================================================

/// Serves every [`Request`] from the local failover service.
pub struct Dispatcher {
    service: Arc<FailoverService>,
    targets: Arc<dyn TargetBackend>,
    events: Option<mpsc::Sender<(String, VrrpEvent)>>,
}

impl Dispatcher {
    pub fn new(service: Arc<FailoverService>, targets: Arc<dyn TargetBackend>) -> Self {
        Self {
            service,
            targets,
            events: None,
        }
    }

    /// Routes `failover.vrrp_event` notifications to an [`crate::EventHandler`].
    pub fn with_events(mut self, events: mpsc::Sender<(String, VrrpEvent)>) -> Self {
        self.events = Some(events);
        self
    }

    /// Queues a VRRP notification. Runs on a blocking thread.
    fn queue_event(&self, interface: String, event: &str) -> HaResult<()> {
        let event: VrrpEvent = event.parse()?;
        let Some(events) = &self.events else {
            return Err(HaError::with_errno(
                Errno::Enomethod,
                "this node does not handle VRRP events",
            ));
        };
        events
            .blocking_send((interface, event))
            .map_err(|_| HaError::failed("failover event handler is not running"))
    }

    fn dispatch(&self, session: &Session, request: Request) -> HaResult<Reply> {
        let service = &self.service;
        let platform = service.platform();
        let reply = match request {
            Request::Status => Reply::Status(service.status(session)),
            Request::DisabledReasons => Reply::Reasons(service.disabled_reasons(session)),
            Request::Config => Reply::Config(service.config()?),
            Request::Update(update) => Reply::Config(service.update(update)?),
            Request::ForceMaster => Reply::Bool(service.force_master()?),
            Request::SyncToPeer { reboot } => {
                service.sync_to_peer(reboot)?;
                Reply::Unit
            }
            Request::SyncFromPeer => {
                service.sync_from_peer()?;
                Reply::Unit
            }
            Request::SendDatabase => {
                service.send_database()?;
                Reply::Unit
            }
            Request::ReceiveDatabase { generation } => {
                service.receive_database(generation)?;
                Reply::Unit
            }
            Request::UpdateEncryptionKeys(update) => {
                service.update_encryption_keys(update)?;
                Reply::Unit
            }
            Request::RemoveEncryptionKeys(removal) => {
                service.remove_encryption_keys(removal)?;
                Reply::Unit
            }
            Request::SyncKeysToRemoteNode => {
                service.sync_keys_to_remote_node();
                Reply::Unit
            }
            Request::SyncKeysFromRemoteNode => {
                service.sync_keys_from_remote_node();
                Reply::Unit
            }
            Request::Upgrade { train } => Reply::Bool(service.upgrade(train.as_deref())?),
            Request::UpgradeFinish => Reply::Bool(service.upgrade_finish()?),
            Request::UpgradePending => Reply::Bool(service.upgrade_pending()?),
            Request::Control { action, active } => Reply::Bool(service.control(action, active)?),
            Request::InProgress => Reply::Bool(service.in_progress()),
            Request::VrrpEvent { interface, event } => {
                self.queue_event(interface, &event)?;
                Reply::Unit
            }
            Request::CallRemote { method, args } => {
                let inner = Request::from_method(&method, &args).map_err(remote)?;
                let reply = self.dispatch(session, inner)?;
                Reply::Json(reply.to_json().map_err(remote)?)
            }

            Request::Ping => Reply::Text("pong".to_string()),
            Request::DatastoreSql(entry) => {
                service.apply_replicated_write(&entry)?;
                Reply::Unit
            }
            Request::CachePutEncryptionKeys(keys) => {
                service.put_encryption_keys(keys);
                Reply::Unit
            }
            Request::KmipUpdateMemoryKeys(keys) => {
                platform.kmip.update_memory_keys(keys);
                Reply::Unit
            }
            Request::FileReceive {
                path,
                chunk,
                mode,
                append,
            } => {
                service.file_receive(&path, &chunk, mode, append)?;
                Reply::Unit
            }
            Request::Service {
                verb,
                service: name,
                options,
            } => {
                service.service_control(verb, &name, options)?;
                Reply::Unit
            }
            Request::ServiceStarted { service: name } => {
                Reply::Bool(platform.services.started(&name))
            }
            Request::SystemBootId => Reply::Text(platform.system.boot_id()),
            Request::SystemReady => Reply::Bool(platform.system.ready()),
            Request::SystemReboot { delay_secs } => {
                platform.system.reboot(Duration::from_secs(delay_secs))?;
                Reply::Unit
            }
            Request::SystemVersion => Reply::Text(platform.system.version()),
            Request::ImportedPools => Reply::Pools(
                platform
                    .pools
                    .configured()
                    .into_iter()
                    .filter(|p| p.imported)
                    .collect(),
            ),
            Request::Licensed => Reply::Bool(service.licensed()),
            Request::Interfaces => Reply::Interfaces(platform.network.interfaces()),
            Request::InterfaceSync => {
                platform.network.sync()?;
                Reply::Unit
            }
            Request::DataDiskSerials => Reply::Names(platform.disks.data_disk_serials()?),

            Request::BootEnvironments => {
                Reply::BootEnvironments(platform.updates.boot_environments()?)
            }
            Request::ActivateBootEnvironment { id } => {
                platform.updates.activate(&id)?;
                Reply::Unit
            }
            Request::RecreateUploadArea => Reply::Text(
                platform
                    .updates
                    .recreate_upload_area()?
                    .to_string_lossy()
                    .into_owned(),
            ),
            Request::StartUpdate {
                image,
                boot_environment,
            } => Reply::Job(platform.updates.start_update(&image, &boot_environment)?),
            Request::JobStatus(job) => Reply::JobState(platform.updates.job_status(job)?),

            Request::ReloadTargets => {
                self.targets.reload()?;
                Reply::Unit
            }
            Request::RemoveTarget { name } => {
                self.targets.remove_target(&name)?;
                Reply::Unit
            }
            Request::AluaSettled => Reply::Bool(self.targets.alua_settled()),
            Request::LunVisible { naa } => Reply::Bool(self.targets.lun_present(&naa)),
        };
        Ok(reply)
    }
}

fn remote(error: RemoteError) -> HaError {
    HaError::Failed {
        errno: error.errno,
        message: error.message,
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, session: &Session, request: Request) -> Response {
        let method = request.method();
        trace!(method, principal = ?session.principal, "dispatching");
        self.dispatch(session, request)
            .map_err(HaError::into_remote)
    }
}

// ============================================================================
// Outbound adapters
// ============================================================================

fn link_error(error: PeerError) -> LinkError {
    if error.is_peer_down() {
        LinkError::PeerDown(error.to_string())
    } else {
        LinkError::Failed(error.to_string())
    }
}

/// The peer as a journal replica.
pub struct PeerLink(pub PeerClient);

impl ReplicaLink for PeerLink {
    fn remote_version(&self) -> Result<String, LinkError> {
        self.0.version().map_err(link_error)
    }

    fn apply(&self, entry: &JournalEntry) -> Result<(), LinkError> {
        self.0.datastore_sql(entry.clone()).map_err(link_error)
    }

    fn push_database(
        &self,
        database: &Path,
        generation: JournalGeneration,
    ) -> Result<(), LinkError> {
        match ship_database(&self.0, database, generation) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LinkError::Failed(format!(
                "database {} does not exist",
                database.display()
            ))),
            Err(e) => Err(link_error(e)),
        }
    }
}

/// The peer's target stack.
pub struct PeerTargets(pub PeerClient);

fn target_error(error: PeerError) -> TargetError {
    TargetError::Peer(error.to_string())
}

impl TargetPeer for PeerTargets {
    fn connected(&self) -> bool {
        matches!(self.0.ping(Duration::from_secs(2)), Ok(true))
    }

    fn reload(&self) -> TargetResult<()> {
        self.0.reload_targets().map_err(target_error)
    }

    fn remove_target(&self, name: &str) -> TargetResult<()> {
        self.0.remove_target(name).map_err(target_error)
    }

    fn alua_settled(&self) -> TargetResult<bool> {
        self.0.alua_settled().map_err(target_error)
    }

    fn lun_visible(&self, naa: &str) -> TargetResult<bool> {
        self.0.lun_visible(naa).map_err(target_error)
    }
}
