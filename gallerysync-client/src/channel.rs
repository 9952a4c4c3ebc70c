//! Persistent, event-named connection to the processing service.
//!
//! A [`Channel`] is built once by the composition root and handed to whatever
//! needs it. Outbound events go through a single ordered queue drained by a
//! writer task; inbound frames are decoded by a reader task and routed by event
//! name to every live [`Subscription`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use gallerysync_core::{CoreError, EventEnvelope, decode_event_frame, encode_event_frame};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
}

#[derive(Debug)]
struct Route {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Debug, Default)]
struct EventRouter {
    routes: Mutex<HashMap<String, Vec<Route>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    // Nothing panics while the lock is held, so a poisoned map is still consistent.
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Vec<Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, event: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes()
            .entry(event.to_owned())
            .or_default()
            .push(Route { id, tx });
        (id, rx)
    }

    fn remove(&self, event: &str, id: SubscriptionId) -> bool {
        let mut routes = self.routes();
        let Some(list) = routes.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|route| route.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            routes.remove(event);
        }
        removed
    }

    /// Hands the payload to every route for the event, pruning dead ones.
    fn dispatch(&self, envelope: EventEnvelope) -> usize {
        let mut routes = self.routes();
        let Some(list) = routes.get_mut(&envelope.event) else {
            debug!(event = %envelope.event, "no subscribers for inbound event");
            return 0;
        };

        let mut delivered = 0;
        list.retain(|route| {
            if route.tx.send(envelope.data.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        if list.is_empty() {
            routes.remove(&envelope.event);
        }
        debug!(event = %envelope.event, delivered, "inbound event dispatched");
        delivered
    }

    fn route_frame(&self, frame: &str) -> Result<usize, CoreError> {
        let envelope = decode_event_frame(frame)?;
        Ok(self.dispatch(envelope))
    }

    fn count(&self, event: &str) -> usize {
        self.routes().get(event).map_or(0, Vec::len)
    }

    fn clear(&self) {
        self.routes().clear();
    }
}

/// Receiving end of a subscription to one inbound event name.
///
/// Releasing is idempotent and also happens on drop. Once released, `recv`
/// returns `None` and events that were queued but not yet consumed are discarded.
#[derive(Debug)]
pub struct Subscription {
    event: String,
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Value>,
    router: Weak<EventRouter>,
    active: bool,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Next payload for this event, in arrival order. `None` once released or
    /// once the channel is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        if !self.active {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(router) = self.router.upgrade() {
            router.remove(&self.event, self.id);
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!(event = %self.event, id = self.id, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Debug)]
struct ChannelInner {
    outbound_tx: mpsc::UnboundedSender<String>,
    router: Arc<EventRouter>,
    connected: Arc<AtomicBool>,
    open: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Cheap to clone; every clone talks over the same connection.
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Makes a single connection attempt bounded by `connect_timeout`.
    pub async fn open(config: &ChannelConfig) -> Result<Self, TransportError> {
        let url = Url::parse(&config.server_url).map_err(|err| TransportError::InvalidUrl {
            url: config.server_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::UnsupportedScheme(url.scheme().to_owned()));
        }

        info!(server_url = %url, "connecting");
        let (ws_stream, _) =
            match timeout(config.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(err)) => return Err(TransportError::Connect(err.to_string())),
                Err(_) => return Err(TransportError::ConnectTimeout(config.connect_timeout)),
            };
        info!(server_url = %url, "connected");

        let (write_half, read_half) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let router = Arc::new(EventRouter::default());
        let connected = Arc::new(AtomicBool::new(true));

        let send_task = tokio::spawn(network_send_task(
            write_half,
            outbound_rx,
            Arc::clone(&connected),
        ));
        let receive_task = tokio::spawn(network_receive_task(
            read_half,
            Arc::clone(&router),
            Arc::clone(&connected),
        ));

        Ok(Self::from_parts(
            outbound_tx,
            router,
            connected,
            vec![send_task, receive_task],
        ))
    }

    /// An in-process channel whose remote side is the returned [`LoopbackPeer`].
    pub fn loopback() -> (Self, LoopbackPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let router = Arc::new(EventRouter::default());
        let connected = Arc::new(AtomicBool::new(true));
        let channel = Self::from_parts(outbound_tx, Arc::clone(&router), connected, Vec::new());
        let peer = LoopbackPeer {
            emitted: outbound_rx,
            router,
        };
        (channel, peer)
    }

    fn from_parts(
        outbound_tx: mpsc::UnboundedSender<String>,
        router: Arc<EventRouter>,
        connected: Arc<AtomicBool>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                outbound_tx,
                router,
                connected,
                open: AtomicBool::new(true),
                tasks: Mutex::new(tasks),
            }),
        }
    }

    /// Queues an event for sending. Fire-and-forget: if the connection is
    /// down the event is dropped and only logged. Errors only when the
    /// payload cannot be framed.
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), TransportError> {
        let envelope = EventEnvelope::from_payload(event, payload)?;
        let frame = encode_event_frame(&envelope)?;
        let size = frame.len();

        if !self.inner.open.load(Ordering::Acquire) || self.inner.outbound_tx.send(frame).is_err() {
            warn!(event, "channel is down, dropping outbound event");
        } else {
            debug!(event, size, "outbound event queued");
        }
        Ok(())
    }

    pub fn subscribe(&self, event: &str) -> Subscription {
        if !self.inner.open.load(Ordering::Acquire) {
            warn!(event, "subscribing on a closed channel");
            let (_, rx) = mpsc::unbounded_channel();
            return Subscription {
                event: event.to_owned(),
                id: SubscriptionId::MAX,
                rx,
                router: Weak::new(),
                active: false,
            };
        }

        let (id, rx) = self.inner.router.add(event);
        debug!(event, id, "subscribed");
        Subscription {
            event: event.to_owned(),
            id,
            rx,
            router: Arc::downgrade(&self.inner.router),
            active: true,
        }
    }

    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.unsubscribe();
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner.router.count(event)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
            && self.inner.connected.load(Ordering::Acquire)
            && !self.inner.outbound_tx.is_closed()
    }

    /// Stops the reader and writer and releases every route, which ends all
    /// pending `recv` calls. Idempotent.
    pub async fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.connected.store(false, Ordering::Release);
        self.inner.router.clear();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("channel closed");
    }
}

/// The remote end of [`Channel::loopback`].
#[derive(Debug)]
pub struct LoopbackPeer {
    emitted: mpsc::UnboundedReceiver<String>,
    router: Arc<EventRouter>,
}

impl LoopbackPeer {
    /// Injects an inbound event. Returns how many subscriptions received it.
    pub fn deliver(&self, event: &str, data: Value) -> usize {
        self.router.dispatch(EventEnvelope::new(event, data))
    }

    /// Injects a raw text frame through the same decoder the socket reader uses.
    pub fn deliver_frame(&self, frame: &str) -> Result<usize, CoreError> {
        self.router.route_frame(frame)
    }

    pub async fn next_emitted(&mut self) -> Option<EventEnvelope> {
        let frame = self.emitted.recv().await?;
        decode_event_frame(&frame).ok()
    }

    pub fn try_next_emitted(&mut self) -> Option<EventEnvelope> {
        let frame = self.emitted.try_recv().ok()?;
        decode_event_frame(&frame).ok()
    }
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = outgoing_rx.recv().await {
        if let Err(err) = ws_write.send(Message::Text(frame.into())).await {
            warn!("send failed, later events will be dropped: {}", err);
            break;
        }
    }
    connected.store(false, Ordering::Release);
}

async fn network_receive_task(
    mut ws_read: futures::stream::SplitStream<WsStream>,
    router: Arc<EventRouter>,
    connected: Arc<AtomicBool>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("read failed: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if let Err(err) = router.route_frame(text.as_str()) {
                    warn!("dropping undecodable frame: {}", err);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    connected.store(false, Ordering::Release);
    info!("connection closed");
}
