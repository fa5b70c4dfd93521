//! Outbound calls to the other controller.
//!
//! [`PeerClient`] is the typed surface the failover engine uses; the bytes go
//! through a [`PeerTransport`]. [`TcpTransport`] talks over the interlink,
//! tests plug in an in-process transport.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use tandem_journal::JournalEntry;
use tandem_types::{
    BootEnvironment, DisabledReasons, EncryptionKeys, HaStatus, InterfaceInfo, JobId, JobState,
    JournalGeneration, KmipKey, PoolInfo, ServiceOptions, ServiceVerb,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::error::{PeerError, PeerResult};
use crate::wire::{FRAME_HEADER_SIZE, Frame, Reply, Request, RequestEnvelope, Response};

/// Files are shipped in chunks of this many raw bytes.
pub const FILE_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Source ports the server treats as privileged.
const RESERVED_PORTS: std::ops::RangeInclusive<u16> = 600..=1023;

/// Moves one request to the peer and brings back its response.
pub trait PeerTransport: Send + Sync {
    fn call(&self, request: Request, timeout: Duration) -> PeerResult<Reply>;
}

// ============================================================================
// TCP transport
// ============================================================================

/// Interlink transport over TCP with a small connection pool.
///
/// Blocking: must not be called from inside an async task.
pub struct TcpTransport {
    endpoint: String,
    token: Option<String>,
    connect_timeout: Duration,
    runtime: Option<tokio::runtime::Runtime>,
    idle: Mutex<Vec<TcpStream>>,
    reserved_ports_denied: AtomicBool,
}

impl TcpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        connect_timeout: Duration,
    ) -> PeerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("peer-client")
            .enable_all()
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.is_empty()),
            connect_timeout,
            runtime: Some(runtime),
            idle: Mutex::new(Vec::new()),
            reserved_ports_denied: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> PeerResult<TcpStream> {
        let addr = tokio::net::lookup_host(&self.endpoint)
            .await
            .map_err(PeerError::from_io)?
            .next()
            .ok_or_else(|| PeerError::Unreachable {
                errno: tandem_types::Errno::Ehostdown,
                reason: format!("{} did not resolve", self.endpoint),
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.bind_reserved(&socket, addr);

        match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(PeerError::from_io(e)),
            Err(_) => Err(PeerError::Unreachable {
                errno: tandem_types::Errno::Ehostdown,
                reason: format!("connect to {addr} timed out"),
            }),
        }
    }

    /// Binds a privileged source port so the peer recognises the node session.
    fn bind_reserved(&self, socket: &TcpSocket, target: SocketAddr) {
        if self.reserved_ports_denied.load(Ordering::Relaxed) {
            return;
        }
        let unspecified: IpAddr = if target.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        for port in RESERVED_PORTS.rev() {
            match socket.bind(SocketAddr::new(unspecified, port)) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    debug!("reserved source ports unavailable, relying on token auth");
                    self.reserved_ports_denied.store(true, Ordering::Relaxed);
                    return;
                }
                Err(_) => {}
            }
        }
    }

    async fn exchange(&self, stream: &mut TcpStream, frame: &Frame) -> PeerResult<Response> {
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        stream.write_all(&out).await.map_err(PeerError::from_io)?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        read_exact(stream, &mut header).await?;
        let (length, crc) = Frame::parse_header(&header)?;
        let mut payload = vec![0u8; length];
        read_exact(stream, &mut payload).await?;
        let reply = Frame::verified(payload.into(), crc)?;
        Ok(reply.to_message()?)
    }

    async fn call_async(&self, request: Request) -> PeerResult<Reply> {
        let envelope = RequestEnvelope {
            token: self.token.clone(),
            request,
        };
        let frame = Frame::from_message(&envelope)?;

        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let (stream, response) = match pooled {
            Some(mut stream) => match self.exchange(&mut stream, &frame).await {
                Ok(response) => (stream, response),
                Err(e) if e.is_peer_down() => {
                    trace!(error = %e, "pooled connection stale, reconnecting");
                    let mut fresh = self.connect().await?;
                    let response = self.exchange(&mut fresh, &frame).await?;
                    (fresh, response)
                }
                Err(e) => return Err(e),
            },
            None => {
                let mut fresh = self.connect().await?;
                let response = self.exchange(&mut fresh, &frame).await?;
                (fresh, response)
            }
        };

        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stream);
        response.map_err(PeerError::Remote)
    }
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> PeerResult<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(PeerError::ConnectionClosed),
        Err(e) => Err(PeerError::from_io(e)),
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl PeerTransport for TcpTransport {
    fn call(&self, request: Request, timeout: Duration) -> PeerResult<Reply> {
        let method = request.method();
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(PeerError::ConnectionClosed);
        };
        runtime.block_on(async {
            match tokio::time::timeout(timeout, self.call_async(request)).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout { method, timeout }),
            }
        })
    }
}

// ============================================================================
// Typed client
// ============================================================================

/// Typed wrappers over the interlink calls.
#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

macro_rules! expect_reply {
    ($reply:expr, $method:expr, $pattern:pat => $value:expr) => {
        match $reply {
            $pattern => Ok($value),
            other => Err(PeerError::UnexpectedReply {
                method: $method,
                got: other.kind(),
            }),
        }
    };
}

impl PeerClient {
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` with the default timeout.
    pub fn call(&self, request: Request) -> PeerResult<Reply> {
        self.transport.call(request, self.timeout)
    }

    pub fn call_with_timeout(&self, request: Request, timeout: Duration) -> PeerResult<Reply> {
        self.transport.call(request, timeout)
    }

    fn unit(&self, request: Request) -> PeerResult<()> {
        let method = request.method();
        expect_reply!(self.call(request)?, method, Reply::Unit => ())
    }

    fn boolean(&self, request: Request) -> PeerResult<bool> {
        let method = request.method();
        expect_reply!(self.call(request)?, method, Reply::Bool(v) => v)
    }

    fn text(&self, request: Request) -> PeerResult<String> {
        let method = request.method();
        expect_reply!(self.call(request)?, method, Reply::Text(v) => v)
    }

    /// `core.ping`; true when the peer answered `pong`.
    pub fn ping(&self, timeout: Duration) -> PeerResult<bool> {
        let reply = self.call_with_timeout(Request::Ping, timeout)?;
        expect_reply!(reply, "core.ping", Reply::Text(v) => v == "pong")
    }

    pub fn status(&self) -> PeerResult<HaStatus> {
        expect_reply!(self.call(Request::Status)?, "failover.status", Reply::Status(v) => v)
    }

    pub fn disabled_reasons(&self) -> PeerResult<DisabledReasons> {
        expect_reply!(
            self.call(Request::DisabledReasons)?,
            "failover.disabled.reasons",
            Reply::Reasons(v) => v
        )
    }

    pub fn in_progress(&self) -> PeerResult<bool> {
        self.boolean(Request::InProgress)
    }

    /// Asks the peer to become MASTER; false if it already was.
    pub fn force_master(&self) -> PeerResult<bool> {
        self.boolean(Request::ForceMaster)
    }

    /// Asks the peer to push its state here.
    pub fn sync_to_peer(&self, reboot: bool) -> PeerResult<()> {
        self.unit(Request::SyncToPeer { reboot })
    }

    pub fn receive_database(&self, generation: JournalGeneration) -> PeerResult<()> {
        self.unit(Request::ReceiveDatabase { generation })
    }

    pub fn datastore_sql(&self, entry: JournalEntry) -> PeerResult<()> {
        self.unit(Request::DatastoreSql(entry))
    }

    /// `cache.put("failover_encryption_keys", keys)`
    pub fn put_encryption_keys(&self, keys: EncryptionKeys) -> PeerResult<()> {
        self.unit(Request::CachePutEncryptionKeys(keys))
    }

    pub fn kmip_update_memory_keys(&self, keys: Vec<KmipKey>) -> PeerResult<()> {
        self.unit(Request::KmipUpdateMemoryKeys(keys))
    }

    /// Asks the MASTER to push its key cache here.
    pub fn request_keys(&self) -> PeerResult<()> {
        self.unit(Request::SyncKeysToRemoteNode)
    }

    pub fn service(
        &self,
        verb: ServiceVerb,
        service: &str,
        options: ServiceOptions,
    ) -> PeerResult<()> {
        self.unit(Request::Service {
            verb,
            service: service.to_string(),
            options,
        })
    }

    pub fn service_started(&self, service: &str) -> PeerResult<bool> {
        self.boolean(Request::ServiceStarted {
            service: service.to_string(),
        })
    }

    pub fn boot_id(&self) -> PeerResult<String> {
        self.text(Request::SystemBootId)
    }

    pub fn system_ready(&self) -> PeerResult<bool> {
        self.boolean(Request::SystemReady)
    }

    pub fn reboot(&self, delay_secs: u64) -> PeerResult<()> {
        self.unit(Request::SystemReboot { delay_secs })
    }

    pub fn version(&self) -> PeerResult<String> {
        self.text(Request::SystemVersion)
    }

    pub fn licensed(&self) -> PeerResult<bool> {
        self.boolean(Request::Licensed)
    }

    pub fn imported_pools(&self, timeout: Duration) -> PeerResult<Vec<PoolInfo>> {
        let reply = self.call_with_timeout(Request::ImportedPools, timeout)?;
        expect_reply!(reply, "pool.imported", Reply::Pools(v) => v)
    }

    pub fn interfaces(&self, timeout: Duration) -> PeerResult<Vec<InterfaceInfo>> {
        let reply = self.call_with_timeout(Request::Interfaces, timeout)?;
        expect_reply!(reply, "interface.query", Reply::Interfaces(v) => v)
    }

    pub fn interface_sync(&self) -> PeerResult<()> {
        self.unit(Request::InterfaceSync)
    }

    pub fn data_disk_serials(&self, timeout: Duration) -> PeerResult<Vec<String>> {
        let reply = self.call_with_timeout(Request::DataDiskSerials, timeout)?;
        expect_reply!(reply, "disk.data_serials", Reply::Names(v) => v)
    }

    pub fn boot_environments(&self) -> PeerResult<Vec<BootEnvironment>> {
        expect_reply!(
            self.call(Request::BootEnvironments)?,
            "bootenv.query",
            Reply::BootEnvironments(v) => v
        )
    }

    pub fn activate_boot_environment(&self, id: &str) -> PeerResult<()> {
        self.unit(Request::ActivateBootEnvironment { id: id.to_string() })
    }

    /// Empties the peer's upload area and returns its path.
    pub fn recreate_upload_area(&self) -> PeerResult<PathBuf> {
        self.text(Request::RecreateUploadArea).map(PathBuf::from)
    }

    pub fn start_update(&self, image: &Path, boot_environment: &str) -> PeerResult<JobId> {
        let reply = self.call(Request::StartUpdate {
            image: image.to_path_buf(),
            boot_environment: boot_environment.to_string(),
        })?;
        expect_reply!(reply, "update.file", Reply::Job(v) => v)
    }

    pub fn job_status(&self, job: JobId) -> PeerResult<JobState> {
        expect_reply!(self.call(Request::JobStatus(job))?, "core.job_status", Reply::JobState(v) => v)
    }

    pub fn reload_targets(&self) -> PeerResult<()> {
        self.unit(Request::ReloadTargets)
    }

    pub fn remove_target(&self, name: &str) -> PeerResult<()> {
        self.unit(Request::RemoveTarget {
            name: name.to_string(),
        })
    }

    pub fn alua_settled(&self) -> PeerResult<bool> {
        self.boolean(Request::AluaSettled)
    }

    pub fn lun_visible(&self, naa: &str) -> PeerResult<bool> {
        self.boolean(Request::LunVisible {
            naa: naa.to_string(),
        })
    }

    /// Generic passthrough returning the JSON-encoded result.
    pub fn call_remote(&self, method: &str, args: &str) -> PeerResult<String> {
        expect_reply!(
            self.call(Request::CallRemote {
                method: method.to_string(),
                args: args.to_string(),
            })?,
            "failover.call_remote",
            Reply::Json(v) => v
        )
    }

    /// `filesystem.file_receive` for one chunk.
    pub fn file_receive(&self, dest: &Path, chunk: &[u8], mode: u32, append: bool) -> PeerResult<()> {
        self.unit(Request::FileReceive {
            path: dest.to_path_buf(),
            chunk: STANDARD.encode(chunk),
            mode,
            append,
        })
    }

    /// Ships a local file to `dest` on the peer in base64 chunks.
    ///
    /// Missing source files are skipped. Returns whether anything was sent.
    pub fn send_file(&self, source: &Path, dest: &Path) -> PeerResult<bool> {
        let data = match fs::read(source) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PeerError::Io(e)),
        };
        let mode = fs::metadata(source)?.permissions().mode();

        if data.is_empty() {
            self.file_receive(dest, &[], mode, false)?;
        }
        for (index, chunk) in data.chunks(FILE_CHUNK_SIZE).enumerate() {
            self.file_receive(dest, chunk, mode, index > 0)?;
        }
        debug!(source = %source.display(), dest = %dest.display(), bytes = data.len(), "file sent to peer");
        Ok(true)
    }
}

/// Decodes a chunk produced by [`PeerClient::file_receive`].
pub fn decode_chunk(chunk: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<Request>>,
    }

    impl PeerTransport for Recorder {
        fn call(&self, request: Request, _timeout: Duration) -> PeerResult<Reply> {
            let reply = match &request {
                Request::Ping => Reply::Text("pong".into()),
                Request::SystemReady => Reply::Bool(true),
                _ => Reply::Unit,
            };
            self.calls.lock().unwrap().push(request);
            Ok(reply)
        }
    }

    fn client() -> (Arc<Recorder>, PeerClient) {
        let recorder = Arc::new(Recorder::default());
        let client = PeerClient::new(recorder.clone(), Duration::from_secs(5));
        (recorder, client)
    }

    #[test]
    fn test_ping_and_ready() {
        let (_, client) = client();
        assert!(client.ping(Duration::from_secs(1)).unwrap());
        assert!(client.system_ready().unwrap());
    }

    #[test]
    fn test_unexpected_reply() {
        let (_, client) = client();
        let err = client.boot_id().unwrap_err();
        assert!(matches!(err, PeerError::UnexpectedReply { got: "unit", .. }));
    }

    #[test]
    fn test_send_file_chunks_with_append() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("db");
        fs::write(&source, vec![7u8; FILE_CHUNK_SIZE + 10]).unwrap();

        let (recorder, client) = client();
        assert!(client.send_file(&source, Path::new("/data/db.sync")).unwrap());

        let calls = recorder.calls.lock().unwrap();
        let flags: Vec<(bool, usize)> = calls
            .iter()
            .map(|c| match c {
                Request::FileReceive { append, chunk, .. } => {
                    (*append, decode_chunk(chunk).unwrap().len())
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(flags, vec![(false, FILE_CHUNK_SIZE), (true, 10)]);
    }

    #[test]
    fn test_send_missing_file_is_skipped() {
        let (recorder, client) = client();
        assert!(!client.send_file(Path::new("/nonexistent/pwenc"), Path::new("/x")).unwrap());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }
}
