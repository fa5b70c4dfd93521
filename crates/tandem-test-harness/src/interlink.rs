//! The point-to-point link between the two controllers.
//!
//! Calls are served synchronously by the other controller's
//! [`Dispatcher`], authenticated as the peer node. Both controllers keep
//! their state under their own root directory; paths in file transfers are
//! moved from the sender's root to the receiver's, as if both controllers
//! had the same filesystem layout.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tandem_failover::Dispatcher;
use tandem_peer::{PeerError, PeerResult, PeerTransport, Reply, Request, RequestHandler, Session};
use tandem_types::{Errno, NodeSlot};
use tracing::trace;

/// Both ends of the interlink.
pub struct Fabric {
    link_up: AtomicBool,
    roots: BTreeMap<NodeSlot, PathBuf>,
    dispatchers: Mutex<BTreeMap<NodeSlot, Weak<Dispatcher>>>,
}

impl Fabric {
    pub fn new(roots: BTreeMap<NodeSlot, PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            link_up: AtomicBool::new(true),
            roots,
            dispatchers: Mutex::new(BTreeMap::new()),
        })
    }

    fn dispatchers(&self) -> MutexGuard<'_, BTreeMap<NodeSlot, Weak<Dispatcher>>> {
        self.dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_link(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Starts serving calls addressed to `slot`.
    pub fn plug(&self, slot: NodeSlot, dispatcher: &Arc<Dispatcher>) {
        self.dispatchers().insert(slot, Arc::downgrade(dispatcher));
    }

    pub fn unplug(&self, slot: NodeSlot) {
        self.dispatchers().remove(&slot);
    }

    /// Client end used by the controller in `slot`.
    pub fn transport(self: &Arc<Self>, slot: NodeSlot) -> Interlink {
        Interlink {
            from: slot,
            fabric: self.clone(),
        }
    }

    fn rebase(&self, from: NodeSlot, to: NodeSlot, request: Request) -> Request {
        let (Some(source), Some(dest)) = (self.roots.get(&from), self.roots.get(&to)) else {
            return request;
        };
        match request {
            Request::FileReceive {
                path,
                chunk,
                mode,
                append,
            } => {
                let path = match path.strip_prefix(source) {
                    Ok(relative) => dest.join(relative),
                    Err(_) => path,
                };
                Request::FileReceive {
                    path,
                    chunk,
                    mode,
                    append,
                }
            }
            other => other,
        }
    }
}

fn origin(slot: NodeSlot) -> SocketAddr {
    let host = match slot {
        NodeSlot::B => [169, 254, 10, 2],
        _ => [169, 254, 10, 1],
    };
    SocketAddr::from((host, 1021))
}

/// [`PeerTransport`] of one controller.
pub struct Interlink {
    from: NodeSlot,
    fabric: Arc<Fabric>,
}

impl PeerTransport for Interlink {
    fn call(&self, request: Request, _timeout: Duration) -> PeerResult<Reply> {
        let down = |reason: &str| PeerError::Unreachable {
            errno: Errno::Ehostdown,
            reason: reason.to_string(),
        };
        let Some(to) = self.from.peer() else {
            return Err(down("no peer slot"));
        };
        if !self.fabric.link_up() {
            return Err(down("interlink down"));
        }
        let dispatcher = self
            .fabric
            .dispatchers()
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| down("connection refused"))?;

        trace!(from = %self.from, method = request.method(), "interlink call");
        let request = self.fabric.rebase(self.from, to, request);
        dispatcher
            .handle(&Session::peer(origin(self.from)), request)
            .map_err(PeerError::Remote)
    }
}
