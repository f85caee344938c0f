use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc, watch, OnceCell},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::{PresenceError, PresenceResult};

use super::{
    protocol::{ClientEvent, EventKind, ServerEvent},
    socket::{spawn_transport, ConnectOptions},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const EVENT_BUS_CAPACITY: usize = 256;

static CONNECTION: OnceCell<ConnectionHandle> = OnceCell::const_new();

/// Auth material handed over by the login flow. `None` means the user is not
/// signed in and no channel can be opened.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

struct HandleInner {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: broadcast::Sender<ServerEvent>,
    status: watch::Sender<LinkStatus>,
    joined: Mutex<BTreeSet<String>>,
    shutdown: CancellationToken,
}

/// The process-wide duplex channel.
///
/// Obtain it through [`open`]; every later call returns the same handle
/// without reconnecting. Any number of screens can [`subscribe`] or register
/// [`on`] listeners; none of them owns the channel.
///
/// [`subscribe`]: ConnectionHandle::subscribe
/// [`on`]: ConnectionHandle::on
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

/// Returns the singleton handle, connecting on first use.
///
/// Fails with `ConnectionUnavailable` only when no handle exists yet and no
/// token is available. Connect failures after that are reported as `error`
/// events on the bus while the transport keeps retrying.
pub async fn open(
    server_url: &str,
    credentials: &Credentials,
    max_backoff: Duration,
) -> PresenceResult<ConnectionHandle> {
    if let Some(existing) = CONNECTION.get() {
        log_debug!("Reusing existing connection handle");
        return Ok(existing.clone());
    }

    let token = credentials.token.clone().ok_or_else(|| {
        PresenceError::ConnectionUnavailable("no authentication token available".into())
    })?;

    let options = ConnectOptions {
        url: server_url.to_string(),
        token,
        max_backoff,
    };

    let handle = CONNECTION
        .get_or_init(|| async move { ConnectionHandle::connect(options) })
        .await;
    Ok(handle.clone())
}

impl ConnectionHandle {
    fn detached() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (status, _) = watch::channel(LinkStatus::Disconnected);

        let handle = Self {
            inner: Arc::new(HandleInner {
                outbound,
                events,
                status,
                joined: Mutex::new(BTreeSet::new()),
                shutdown: CancellationToken::new(),
            }),
        };
        (handle, outbound_rx)
    }

    /// Builds a handle backed by the WebSocket transport. Prefer [`open`],
    /// which guarantees a single instance per process.
    pub fn connect(options: ConnectOptions) -> Self {
        let (handle, outbound_rx) = Self::detached();
        log_info!("Opening duplex channel to {}", options.url);
        spawn_transport(handle.clone(), outbound_rx, options);
        handle
    }

    /// A handle with no network behind it. The returned peer sees every
    /// emitted event and can inject server events.
    pub fn loopback() -> (Self, LoopbackPeer) {
        let (handle, outbound_rx) = Self::detached();
        handle.set_status(LinkStatus::Connected);
        let peer = LoopbackPeer {
            handle: handle.clone(),
            outbound_rx,
        };
        (handle, peer)
    }

    pub fn same_channel(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Fire-and-forget send. No acknowledgement is tracked at this layer.
    pub fn emit(&self, event: ClientEvent) -> PresenceResult<()> {
        if !self.is_connected() {
            return Err(PresenceError::ConnectionUnavailable(format!(
                "cannot send {} while disconnected",
                event.name()
            )));
        }

        let name = event.name();
        self.inner.outbound.send(event).map_err(|_| {
            PresenceError::ConnectionUnavailable("transport task has stopped".into())
        })?;
        log_debug!("Queued {name}");
        Ok(())
    }

    /// Joins classroom rooms and remembers them so the transport can rejoin
    /// after a reconnect. Membership is recorded even if the send fails.
    pub fn join_classrooms(&self, classroom_ids: &[String]) -> PresenceResult<()> {
        if let Ok(mut joined) = self.inner.joined.lock() {
            joined.extend(classroom_ids.iter().cloned());
        }
        self.emit(ClientEvent::JoinClassroom {
            classroom_ids: classroom_ids.to_vec(),
        })
    }

    pub fn joined_classrooms(&self) -> Vec<String> {
        self.inner
            .joined
            .lock()
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.events.subscribe(),
        }
    }

    /// Runs `handler` for every event of `kind` until the returned listener
    /// is dropped or switched off.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Listener
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if event.kind() == kind {
                    handler(event);
                }
            }
        });
        Listener { task: Some(task) }
    }

    /// Stops the transport. Emits fail with `ConnectionUnavailable` afterwards.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.set_status(LinkStatus::Disconnected);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        self.inner.status.send_replace(status);
    }

    pub(crate) fn publish(&self, event: ServerEvent) {
        // No subscribers is not an error; the event is simply unobserved.
        let _ = self.inner.events.send(event);
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<ServerEvent>,
}

impl Subscription {
    /// Next event, or `None` once the handle is gone. A slow subscriber that
    /// falls behind skips the missed events rather than stalling the bus.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_warn!("Subscriber lagged; skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

pub struct Listener {
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn off(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Far end of a [`ConnectionHandle::loopback`] handle.
pub struct LoopbackPeer {
    handle: ConnectionHandle,
    outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl LoopbackPeer {
    pub fn push(&self, event: ServerEvent) {
        self.handle.publish(event);
    }

    /// Drains everything emitted since the last call.
    pub fn sent(&mut self) -> Vec<ClientEvent> {
        let mut sent = Vec::new();
        while let Ok(event) = self.outbound_rx.try_recv() {
            sent.push(event);
        }
        sent
    }

    pub fn set_connected(&self, connected: bool) {
        self.handle.set_status(if connected {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        });
    }
}
