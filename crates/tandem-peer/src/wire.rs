//! Interlink wire protocol.
//!
//! # Frame Format
//!
//! ```text
//! [MAGIC:u32][version:u8][length:u32][crc32:u32][payload:bytes]
//! ```
//!
//! The payload is the postcard encoding of a [`RequestEnvelope`] (client to
//! server) or a [`Response`] (server to client). The CRC covers the payload.

use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tandem_journal::JournalEntry;
use tandem_journal::checksum::crc32;
use tandem_types::{
    BootEnvironment, ControlAction, DisabledReasons, EncryptionKeys, Errno, HaConfigUpdate,
    HaConfigView, HaStatus, InterfaceInfo, JobId, JobState, JournalGeneration, KeyRemoval,
    KeyUpdate, KmipKey, PoolInfo, ServiceOptions, ServiceVerb,
};

const MAGIC: u32 = 0x544E_4450; // "PDNT"
const VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 4 + 1 + 4 + 4;

/// Upper bound for a single payload. File transfers are chunked well below it.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("frame checksum mismatch")]
    Checksum,
    #[error("encode: {0}")]
    Encode(postcard::Error),
    #[error("decode: {0}")]
    Decode(postcard::Error),
}

/// A length-prefixed, checksummed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(crc32(&self.payload));
        buf.extend_from_slice(&self.payload);
    }

    /// Validates a header and returns the payload length it announces.
    pub fn parse_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<(usize, u32), WireError> {
        let mut cursor = &header[..];
        let magic = cursor.get_u32_le();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = cursor.get_u8();
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let length = cursor.get_u32_le() as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(WireError::TooLarge(length));
        }
        Ok((length, cursor.get_u32_le()))
    }

    /// Decodes one frame from the front of `buf`, or `None` if incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let (length, crc) = Self::parse_header(&header)?;
        if buf.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length).freeze();
        Self::verified(payload, crc).map(Some)
    }

    pub fn verified(payload: Bytes, crc: u32) -> Result<Frame, WireError> {
        if crc32(&payload) != crc {
            return Err(WireError::Checksum);
        }
        Ok(Frame { payload })
    }

    pub fn from_message<T: Serialize>(message: &T) -> Result<Frame, WireError> {
        postcard::to_allocvec(message)
            .map(Frame::new)
            .map_err(WireError::Encode)
    }

    pub fn to_message<T: for<'de> Deserialize<'de>>(&self) -> Result<T, WireError> {
        postcard::from_bytes(&self.payload).map_err(WireError::Decode)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Every call one controller can make on the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // --- failover namespace ---
    Status,
    DisabledReasons,
    Config,
    Update(HaConfigUpdate),
    ForceMaster,
    SyncToPeer { reboot: bool },
    SyncFromPeer,
    SendDatabase,
    /// Install `<db>.sync` as the live database, starting `generation`.
    ReceiveDatabase { generation: JournalGeneration },
    UpdateEncryptionKeys(KeyUpdate),
    RemoveEncryptionKeys(KeyRemoval),
    SyncKeysToRemoteNode,
    SyncKeysFromRemoteNode,
    Upgrade { train: Option<String> },
    UpgradeFinish,
    UpgradePending,
    Control { action: ControlAction, active: bool },
    InProgress,
    /// A keepalived notification for a failover interface.
    VrrpEvent { interface: String, event: String },
    /// Generic passthrough; `args` is JSON.
    CallRemote { method: String, args: String },

    // --- probes and replication ---
    Ping,
    DatastoreSql(JournalEntry),
    CachePutEncryptionKeys(EncryptionKeys),
    KmipUpdateMemoryKeys(Vec<KmipKey>),
    FileReceive {
        path: PathBuf,
        /// Base64 chunk.
        chunk: String,
        mode: u32,
        append: bool,
    },
    Service {
        verb: ServiceVerb,
        service: String,
        options: ServiceOptions,
    },
    ServiceStarted { service: String },
    SystemBootId,
    SystemReady,
    SystemReboot { delay_secs: u64 },
    SystemVersion,
    ImportedPools,
    Licensed,
    Interfaces,
    /// Reapplies the network configuration from the database.
    InterfaceSync,
    DataDiskSerials,

    // --- upgrades ---
    BootEnvironments,
    ActivateBootEnvironment { id: String },
    /// Replies with the upload directory path.
    RecreateUploadArea,
    /// Installs `image` into a new boot environment named `boot_environment`.
    StartUpdate {
        image: PathBuf,
        boot_environment: String,
    },
    JobStatus(JobId),

    // --- targets ---
    ReloadTargets,
    RemoveTarget { name: String },
    AluaSettled,
    LunVisible { naa: String },
}

impl Request {
    /// Dotted method name, used in logs and by `call_remote`.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Status => "failover.status",
            Request::DisabledReasons => "failover.disabled.reasons",
            Request::Config => "failover.config",
            Request::Update(_) => "failover.update",
            Request::ForceMaster => "failover.force_master",
            Request::SyncToPeer { .. } => "failover.sync_to_peer",
            Request::SyncFromPeer => "failover.sync_from_peer",
            Request::SendDatabase => "failover.send_database",
            Request::ReceiveDatabase { .. } => "failover.receive_database",
            Request::UpdateEncryptionKeys(_) => "failover.update_encryption_keys",
            Request::RemoveEncryptionKeys(_) => "failover.remove_encryption_keys",
            Request::SyncKeysToRemoteNode => "failover.sync_keys_to_remote_node",
            Request::SyncKeysFromRemoteNode => "failover.sync_keys_from_remote_node",
            Request::Upgrade { .. } => "failover.upgrade",
            Request::UpgradeFinish => "failover.upgrade_finish",
            Request::UpgradePending => "failover.upgrade_pending",
            Request::Control { .. } => "failover.control",
            Request::InProgress => "failover.in_progress",
            Request::VrrpEvent { .. } => "failover.vrrp_event",
            Request::CallRemote { .. } => "failover.call_remote",
            Request::Ping => "core.ping",
            Request::DatastoreSql(_) => "datastore.sql",
            Request::CachePutEncryptionKeys(_) => "cache.put",
            Request::KmipUpdateMemoryKeys(_) => "kmip.update_memory_keys",
            Request::FileReceive { .. } => "filesystem.file_receive",
            Request::Service { .. } => "service.control",
            Request::ServiceStarted { .. } => "service.started",
            Request::SystemBootId => "system.boot_id",
            Request::SystemReady => "system.ready",
            Request::SystemReboot { .. } => "system.reboot",
            Request::SystemVersion => "system.version",
            Request::ImportedPools => "pool.imported",
            Request::Licensed => "failover.licensed",
            Request::Interfaces => "interface.query",
            Request::InterfaceSync => "interface.sync",
            Request::DataDiskSerials => "disk.data_serials",
            Request::BootEnvironments => "bootenv.query",
            Request::ActivateBootEnvironment { .. } => "bootenv.activate",
            Request::RecreateUploadArea => "update.recreate_upload_area",
            Request::StartUpdate { .. } => "update.file",
            Request::JobStatus(_) => "core.job_status",
            Request::ReloadTargets => "iscsi.reload",
            Request::RemoveTarget { .. } => "iscsi.remove_target",
            Request::AluaSettled => "iscsi.alua.settled",
            Request::LunVisible { .. } => "iscsi.lun_visible",
        }
    }

    /// Builds a request from a dotted method name and JSON arguments.
    ///
    /// Only methods whose arguments are plain JSON are reachable this way.
    pub fn from_method(method: &str, args: &str) -> Result<Request, RemoteError> {
        let bad_args = |e: serde_json::Error| {
            RemoteError::new(Errno::Einval, format!("invalid arguments for {method}: {e}"))
        };
        let no_args = || -> Result<(), RemoteError> {
            let value: serde_json::Value =
                serde_json::from_str(if args.trim().is_empty() { "[]" } else { args })
                    .map_err(bad_args)?;
            match value {
                serde_json::Value::Array(items) if items.is_empty() => Ok(()),
                serde_json::Value::Null => Ok(()),
                _ => Err(RemoteError::new(
                    Errno::Einval,
                    format!("{method} takes no arguments"),
                )),
            }
        };
        let request = match method {
            "failover.status" => Request::Status,
            "failover.disabled.reasons" => Request::DisabledReasons,
            "failover.config" => Request::Config,
            "failover.in_progress" => Request::InProgress,
            "failover.upgrade_pending" => Request::UpgradePending,
            "core.ping" => Request::Ping,
            "system.ready" => Request::SystemReady,
            "system.boot_id" => Request::SystemBootId,
            "system.version" => Request::SystemVersion,
            "failover.update" => {
                return serde_json::from_str(args)
                    .map(Request::Update)
                    .map_err(bad_args);
            }
            "system.reboot" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(default)]
                    delay: u64,
                }
                let parsed: Args = serde_json::from_str(args).map_err(bad_args)?;
                return Ok(Request::SystemReboot {
                    delay_secs: parsed.delay,
                });
            }
            other => {
                return Err(RemoteError::new(
                    Errno::Enomethod,
                    format!("method {other} is not callable remotely"),
                ));
            }
        };
        no_args()?;
        Ok(request)
    }
}

/// A request plus the credentials for non-interlink callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub token: Option<String>,
    pub request: Request,
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Unit,
    Bool(bool),
    Text(String),
    Status(HaStatus),
    Reasons(DisabledReasons),
    Config(HaConfigView),
    Pools(Vec<PoolInfo>),
    Interfaces(Vec<InterfaceInfo>),
    Names(Vec<String>),
    BootEnvironments(Vec<BootEnvironment>),
    Job(JobId),
    JobState(JobState),
    /// JSON-encoded result of `call_remote`.
    Json(String),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Unit => "unit",
            Reply::Bool(_) => "bool",
            Reply::Text(_) => "text",
            Reply::Status(_) => "status",
            Reply::Reasons(_) => "reasons",
            Reply::Config(_) => "config",
            Reply::Pools(_) => "pools",
            Reply::Interfaces(_) => "interfaces",
            Reply::Names(_) => "names",
            Reply::BootEnvironments(_) => "boot environments",
            Reply::Job(_) => "job",
            Reply::JobState(_) => "job state",
            Reply::Json(_) => "json",
        }
    }

    /// JSON rendering used for `call_remote` results.
    pub fn to_json(&self) -> Result<String, RemoteError> {
        let rendered = match self {
            Reply::Unit => Ok("null".to_string()),
            Reply::Bool(v) => serde_json::to_string(v),
            Reply::Text(v) => serde_json::to_string(v),
            Reply::Status(v) => serde_json::to_string(v),
            Reply::Reasons(v) => serde_json::to_string(v),
            Reply::Config(v) => serde_json::to_string(v),
            Reply::Pools(v) => serde_json::to_string(v),
            Reply::Interfaces(v) => serde_json::to_string(v),
            Reply::Names(v) => serde_json::to_string(v),
            Reply::BootEnvironments(v) => serde_json::to_string(v),
            Reply::Job(v) => serde_json::to_string(v),
            Reply::JobState(v) => serde_json::to_string(v),
            Reply::Json(v) => Ok(v.clone()),
        };
        rendered.map_err(|e| RemoteError::new(Errno::Efault, e.to_string()))
    }
}

/// A failure reported by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub errno: Option<Errno>,
    pub message: String,
}

impl RemoteError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno: Some(errno),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            errno: None,
            message: message.into(),
        }
    }
}

pub type Response = Result<Reply, RemoteError>;
