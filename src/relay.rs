//! Connections to a set of redundant relays with best-effort publish and
//! filtered subscriptions.
//!
//! Each connected endpoint runs its own task owning the WebSocket. Outbound
//! frames reach it through an unbounded channel so publishing never waits on
//! the network. Inbound `EVENT` frames are handed to the matching
//! subscription callback as they arrive; the same event delivered by several
//! relays reaches the callback several times. Callbacks run without any pool
//! lock held, so they may call back into the pool, including `teardown`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{future::join_all, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    codec::{Category, TOPIC_APP},
    error::{Error, Result},
    event::{unix_now, Event, KIND_TEXT_NOTE},
};

/// Connection state of the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

/// Endpoints and transport options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub endpoints: Vec<String>,
    pub tor_socks: Option<String>,
    pub connect_timeout: Duration,
}

impl RelayOptions {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            tor_socks: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Subscription filter sent in `REQ` frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub kinds: Vec<u32>,
    pub authors: Option<Vec<String>>,
    /// Tag filters keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    pub limit: Option<u32>,
}

impl Filter {
    /// Kind-1 events tagged `nostravel` and `category` from the last `window`.
    pub fn app_stream(category: Category, window: Duration) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(
            "t".to_string(),
            vec![TOPIC_APP.to_string(), category.topic().to_string()],
        );
        Self {
            kinds: vec![KIND_TEXT_NOTE],
            authors: None,
            tags,
            since: Some(unix_now().saturating_sub(window.as_secs())),
            limit: None,
        }
    }

    /// Render as the JSON object carried in a `REQ` frame.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() {
                map.insert(
                    "authors".into(),
                    Value::Array(authors.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(
                format!("#{tag}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }
}

/// Callback invoked once per inbound event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// How long a closed endpoint may take to flush queued frames before its
/// task is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Subscription {
    filter: Map<String, Value>,
    callback: EventCallback,
    /// Cleared on unsubscribe and teardown; checked before every delivery.
    active: AtomicBool,
}

impl Subscription {
    fn new(filter: Map<String, Value>, callback: EventCallback) -> Self {
        Self {
            filter,
            callback,
            active: AtomicBool::new(true),
        }
    }

    fn deliver(&self, ev: Event) {
        if self.active.load(Ordering::Acquire) {
            (self.callback)(ev);
        }
    }

    fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }
}

type Subscriptions = Arc<RwLock<HashMap<String, Arc<Subscription>>>>;

struct Endpoint {
    url: String,
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

struct Inner {
    opts: RelayOptions,
    state: Mutex<RelayState>,
    /// Held for the whole of a connection attempt.
    connecting: tokio::sync::Mutex<()>,
    endpoints: Mutex<Vec<Endpoint>>,
    subs: Subscriptions,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for ep in self.endpoints.get_mut().drain(..) {
            ep.task.abort();
        }
    }
}

/// Handle to the relay session; clones share the same connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<Inner>,
}

impl RelayPool {
    pub fn new(opts: RelayOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                opts,
                state: Mutex::new(RelayState::Disconnected),
                connecting: tokio::sync::Mutex::new(()),
                endpoints: Mutex::new(vec![]),
                subs: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    /// URLs of endpoints whose connection task is still running.
    pub fn connected_endpoints(&self) -> Vec<String> {
        self.inner
            .endpoints
            .lock()
            .iter()
            .filter(|ep| !ep.task.is_finished())
            .map(|ep| ep.url.clone())
            .collect()
    }

    /// Connect to every configured endpoint concurrently.
    ///
    /// Returns `true` and enters `Connected` when at least one endpoint
    /// accepted; unreachable endpoints are logged and skipped. Subscriptions
    /// registered earlier are replayed on each new connection. A caller
    /// arriving while another attempt is in flight waits for its outcome.
    pub async fn connect(&self) -> bool {
        let _attempt = self.inner.connecting.lock().await;
        {
            let mut state = self.inner.state.lock();
            if *state == RelayState::Connected {
                return true;
            }
            *state = RelayState::Connecting;
        }
        let opts = &self.inner.opts;
        let attempts = opts.endpoints.iter().map(|url| async move {
            let res = match tokio::time::timeout(
                opts.connect_timeout,
                connect_ws(url, opts.tor_socks.as_deref()),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(Error::EndpointUnreachable {
                    url: url.clone(),
                    reason: "connect timed out".into(),
                }),
            };
            (url.clone(), res)
        });
        let results = join_all(attempts).await;

        let mut connected = vec![];
        for (url, res) in results {
            match res {
                Ok(ws) => {
                    info!(relay = %url, "connected");
                    connected.push(self.spawn_endpoint(url, ws));
                }
                Err(e) => warn!(relay = %url, error = %e, "relay unreachable"),
            }
        }

        let ok = !connected.is_empty();
        self.inner.endpoints.lock().extend(connected);
        *self.inner.state.lock() = if ok {
            RelayState::Connected
        } else {
            RelayState::Disconnected
        };
        if !ok {
            warn!("no relay reachable, staying offline");
        }
        ok
    }

    fn spawn_endpoint(&self, url: String, ws: WsStream) -> Endpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        for (id, sub) in self.inner.subs.read().iter() {
            let _ = tx.send(req_frame(id, &sub.filter));
        }
        let subs = self.inner.subs.clone();
        let task_url = url.clone();
        let task = tokio::spawn(async move { run_endpoint(task_url, ws, rx, subs).await });
        Endpoint { url, tx, task }
    }

    /// Send `event` to every endpoint without waiting for acknowledgement.
    ///
    /// Returns `false` immediately when not connected; nothing is queued
    /// for later delivery.
    pub fn publish(&self, event: &Event) -> bool {
        if !self.is_connected() {
            debug!(event_id = %event.id, "offline, event not published");
            return false;
        }
        let frame = json!(["EVENT", event]).to_string();
        let endpoints = self.inner.endpoints.lock();
        let mut sent = 0;
        for ep in endpoints.iter() {
            match ep.tx.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => debug!(relay = %ep.url, "endpoint closed, skipping"),
            }
        }
        debug!(event_id = %event.id, relays = sent, "event published");
        sent > 0
    }

    /// Register a standing subscription on every endpoint and return its id.
    ///
    /// `on_event` runs on the endpoint tasks.
    pub fn subscribe<F>(&self, filter: &Filter, on_event: F) -> String
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = format!("nostravel-{:016x}", rand::random::<u64>());
        let filter = filter.to_json();
        let frame = req_frame(&id, &filter);
        self.inner
            .subs
            .write()
            .insert(id.clone(), Arc::new(Subscription::new(filter, Arc::new(on_event))));
        for ep in self.inner.endpoints.lock().iter() {
            let _ = ep.tx.send(frame.clone());
        }
        debug!(sub = %id, "subscription opened");
        id
    }

    /// Stop delivery for one subscription and send `CLOSE` upstream.
    pub fn unsubscribe(&self, id: &str) {
        let Some(sub) = self.inner.subs.write().remove(id) else {
            return;
        };
        sub.cancel();
        let frame = json!(["CLOSE", id]).to_string();
        for ep in self.inner.endpoints.lock().iter() {
            let _ = ep.tx.send(frame.clone());
        }
    }

    /// Drop all subscriptions and connections.
    ///
    /// Once this returns no subscription callback starts again, even for
    /// frames already in flight. Frames queued before the call are still
    /// flushed, then each connection is closed. Calling it twice is harmless,
    /// and so is calling it from inside a subscription callback.
    pub fn teardown(&self) {
        for (_, sub) in self.inner.subs.write().drain() {
            sub.cancel();
        }
        let endpoints: Vec<Endpoint> = self.inner.endpoints.lock().drain(..).collect();
        let count = endpoints.len();
        for Endpoint { url, tx, task } in endpoints {
            debug!(relay = %url, "closing endpoint");
            drop(tx);
            close_gracefully(task);
        }
        let mut state = self.inner.state.lock();
        if *state != RelayState::Disconnected {
            info!(relays = count, "relay session closed");
        }
        *state = RelayState::Disconnected;
    }
}

/// Let a task whose sender was dropped finish flushing, aborting it if it
/// takes longer than [`CLOSE_GRACE`] or if no runtime is available.
fn close_gracefully(mut task: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            });
        }
        Err(_) => task.abort(),
    }
}

fn req_frame(id: &str, filter: &Map<String, Value>) -> String {
    json!(["REQ", id, Value::Object(filter.clone())]).to_string()
}

/// Pump one endpoint: write queued frames, dispatch inbound events.
async fn run_endpoint(
    url: String,
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<String>,
    subs: Subscriptions,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(relay = %url, error = %e, "send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(txt))) => handle_frame(&url, &txt, &subs),
                Some(Ok(Message::Close(_))) | None => {
                    info!(relay = %url, "relay closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(relay = %url, error = %e, "relay connection error");
                    break;
                }
            },
        }
    }
}

/// Handle a single relay-to-client frame.
fn handle_frame(url: &str, txt: &str, subs: &Subscriptions) {
    let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) else {
        debug!(relay = %url, "ignoring non-array frame");
        return;
    };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") if arr.len() >= 3 => {
            let Some(sub_id) = arr[1].as_str() else {
                return;
            };
            match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(ev) => {
                    let sub = subs.read().get(sub_id).cloned();
                    if let Some(sub) = sub {
                        sub.deliver(ev);
                    }
                }
                Err(e) => debug!(relay = %url, error = %e, "unparseable event"),
            }
        }
        Some("EOSE") => {
            debug!(relay = %url, sub = ?arr.get(1), "end of stored events");
        }
        Some("OK") => {
            let accepted = arr.get(2).and_then(Value::as_bool).unwrap_or(false);
            if !accepted {
                warn!(relay = %url, event_id = ?arr.get(1), reason = ?arr.get(3), "event rejected");
            }
        }
        Some("NOTICE") => {
            info!(relay = %url, notice = ?arr.get(1), "relay notice");
        }
        _ => {}
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let unreachable = |reason: String| Error::EndpointUnreachable {
        url: relay.to_string(),
        reason,
    };
    let url = Url::parse(relay).map_err(|e| unreachable(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| unreachable("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| unreachable("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| unreachable(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| unreachable(e.to_string()))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| unreachable(e.to_string()))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream)
        .await
        .map_err(|e| unreachable(e.to_string()))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
