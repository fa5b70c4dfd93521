//! Inbound RPC server.
//!
//! Accepts interlink connections, authenticates each request, and runs the
//! handler on the blocking pool so long calls never stall the reactor.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tandem_types::Errno;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::error::{PeerError, PeerResult};
use crate::wire::{FRAME_HEADER_SIZE, Frame, RemoteError, RequestEnvelope, Response};

/// Highest source port treated as privileged.
const PRIVILEGED_PORT_MAX: u16 = 1024;

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// The other controller over the interlink.
    Peer,
    /// Any other authenticated caller.
    Client,
    /// An in-process caller on this node.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub principal: Principal,
    pub origin: Option<SocketAddr>,
}

impl Session {
    pub fn local() -> Self {
        Self {
            principal: Principal::Local,
            origin: None,
        }
    }

    pub fn peer(origin: SocketAddr) -> Self {
        Self {
            principal: Principal::Peer,
            origin: Some(origin),
        }
    }

    pub fn client(origin: SocketAddr) -> Self {
        Self {
            principal: Principal::Client,
            origin: Some(origin),
        }
    }

    pub fn is_peer(&self) -> bool {
        self.principal == Principal::Peer
    }

    /// Key used to throttle repeated calls from the same caller.
    pub fn key(&self) -> String {
        match self.origin {
            Some(origin) => format!("{:?}:{}", self.principal, origin.ip()),
            None => format!("{:?}", self.principal),
        }
    }
}

/// Interlink authentication rule.
#[derive(Debug, Clone)]
pub struct InterlinkAuth {
    interlink: Vec<IpAddr>,
    token: Option<String>,
}

impl InterlinkAuth {
    pub fn new(interlink: &[String], token: Option<String>) -> PeerResult<Self> {
        let interlink = interlink
            .iter()
            .map(|a| {
                a.parse::<IpAddr>().map_err(|e| {
                    PeerError::Remote(RemoteError::new(
                        Errno::Einval,
                        format!("invalid interlink address {a}: {e}"),
                    ))
                })
            })
            .collect::<PeerResult<Vec<_>>>()?;
        Ok(Self {
            interlink,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Connections from an interlink address on a privileged source port are
    /// the peer node; anything else must present the shared token.
    pub fn authenticate(&self, origin: SocketAddr, token: Option<&str>) -> Option<Session> {
        if origin.port() <= PRIVILEGED_PORT_MAX && self.interlink.contains(&origin.ip()) {
            return Some(Session::peer(origin));
        }
        match (&self.token, token) {
            (Some(expected), Some(given)) if expected == given => Some(Session::client(origin)),
            _ => None,
        }
    }
}

/// Executes decoded requests.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, session: &Session, request: crate::wire::Request) -> Response;
}

pub struct PeerServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    auth: Arc<InterlinkAuth>,
}

impl PeerServer {
    pub async fn bind(
        addr: &str,
        handler: Arc<dyn RequestHandler>,
        auth: InterlinkAuth,
    ) -> PeerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            auth: Arc::new(auth),
        })
    }

    pub fn local_addr(&self) -> PeerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> PeerResult<()> {
        info!(addr = ?self.listener.local_addr().ok(), "peer RPC server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("peer RPC server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, origin) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let handler = Arc::clone(&self.handler);
                    let auth = Arc::clone(&self.auth);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, origin, handler, auth).await {
                            debug!(%origin, error = %e, "peer connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    origin: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    auth: Arc<InterlinkAuth>,
) -> PeerResult<()> {
    stream.set_nodelay(true)?;
    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(PeerError::from_io(e)),
        }
        let (length, crc) = Frame::parse_header(&header)?;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;
        let envelope: RequestEnvelope = Frame::verified(payload.into(), crc)?.to_message()?;

        let method = envelope.request.method();
        let response = match auth.authenticate(origin, envelope.token.as_deref()) {
            Some(session) => {
                trace!(%origin, method, "peer request");
                let handler = Arc::clone(&handler);
                let request = envelope.request;
                tokio::task::spawn_blocking(move || handler.handle(&session, request))
                    .await
                    .unwrap_or_else(|e| {
                        Err(RemoteError::new(Errno::Efault, format!("handler failed: {e}")))
                    })
            }
            None => {
                warn!(%origin, method, "rejected unauthenticated request");
                Err(RemoteError::new(Errno::Eperm, "not authorized"))
            }
        };

        let mut out = BytesMut::new();
        Frame::from_message(&response)?.encode(&mut out);
        stream.write_all(&out).await?;
    }
}
