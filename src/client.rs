//! The application context tying identity, relays and the store together.
//!
//! A [`Client`] is built once by the host and driven through its lifecycle:
//! restore or create an identity, [`connect`](Client::connect), subscribe,
//! originate, and finally [`teardown`](Client::teardown) or
//! [`logout`](Client::logout). Whether inbound data comes from relays or from
//! the demo fixture is decided once, when connecting.

use std::{
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Category, LocationSample, PhotoShare},
    config::Settings,
    demo,
    error::{Error, Result},
    event::{unix_now_millis, Event},
    identity::{Identity, IdentityManager, KeyBackup, Profile},
    relay::{Filter, RelayOptions, RelayPool, RelayState},
    sync::{LocationRecord, Pending, PhotoRecord, SyncStore},
    tracker::{LocationTracker, PositionSource},
};

/// Where inbound data comes from for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    LiveRelay,
    DemoFixture,
}

enum ActiveSource {
    Live { subs: Vec<String> },
    Demo { tasks: Vec<JoinHandle<()>> },
}

impl ActiveSource {
    fn kind(&self) -> DataSource {
        match self {
            ActiveSource::Live { .. } => DataSource::LiveRelay,
            ActiveSource::Demo { .. } => DataSource::DemoFixture,
        }
    }
}

/// Construction parameters for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub relay: RelayOptions,
    pub identity_path: PathBuf,
    pub location_interval: Duration,
    pub since_window: Duration,
    pub demo_delay: Duration,
}

impl ClientOptions {
    pub fn new(endpoints: Vec<String>, identity_path: impl Into<PathBuf>) -> Self {
        Self {
            relay: RelayOptions::new(endpoints),
            identity_path: identity_path.into(),
            location_interval: Duration::from_secs(30),
            since_window: Duration::from_secs(86_400),
            demo_delay: Duration::from_millis(2_000),
        }
    }
}

impl From<&Settings> for ClientOptions {
    fn from(s: &Settings) -> Self {
        Self {
            relay: RelayOptions {
                endpoints: s.relays.clone(),
                tor_socks: s.tor_socks.clone(),
                connect_timeout: s.connect_timeout,
            },
            identity_path: s.identity_path.clone(),
            location_interval: s.location_interval,
            since_window: s.since_window,
            demo_delay: s.demo_delay,
        }
    }
}

struct Inner {
    opts: ClientOptions,
    identity: RwLock<IdentityManager>,
    pool: RelayPool,
    store: Arc<SyncStore>,
    /// Serialises [`Client::connect`] so the source is chosen once.
    connecting: tokio::sync::Mutex<()>,
    source: Mutex<Option<ActiveSource>>,
    tracker: Mutex<Option<LocationTracker>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(ActiveSource::Demo { tasks }) = self.source.get_mut().take() {
            for t in tasks {
                t.abort();
            }
        }
    }
}

/// Shared handle to the sync core; clones refer to the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        let identity = IdentityManager::new(opts.identity_path.clone());
        let pool = RelayPool::new(opts.relay.clone());
        Self {
            inner: Arc::new(Inner {
                opts,
                identity: RwLock::new(identity),
                pool,
                store: Arc::new(SyncStore::new()),
                connecting: tokio::sync::Mutex::new(()),
                source: Mutex::new(None),
                tracker: Mutex::new(None),
            }),
        }
    }

    // ---- identity ----

    /// Load the persisted identity, if any. A corrupt record is discarded.
    pub fn restore_identity(&self) -> Option<Identity> {
        self.inner.identity.write().restore().cloned()
    }

    /// Generate fresh keys, bind them to `name` and persist.
    pub fn create_identity(&self, name: &str) -> Result<Identity> {
        let profile = Profile::new(name)?;
        let mut mgr = self.inner.identity.write();
        let keys = mgr.generate();
        mgr.persist(keys, profile)?;
        mgr.identity().cloned().ok_or(Error::NotAuthenticated)
    }

    /// Import an `nsec`, bind it to `name` and persist.
    pub fn import_identity(&self, secret: &str, name: &str) -> Result<Identity> {
        let profile = Profile::new(name)?;
        let mut mgr = self.inner.identity.write();
        let keys = mgr.import(secret)?;
        mgr.persist(keys, profile)?;
        mgr.identity().cloned().ok_or(Error::NotAuthenticated)
    }

    pub fn set_display_name(&self, name: &str) -> Result<()> {
        self.inner.identity.write().set_profile(name)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.read().identity().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.identity.read().is_authenticated()
    }

    pub fn export_backup(&self) -> Result<KeyBackup> {
        self.inner
            .identity
            .read()
            .export_backup()
            .ok_or(Error::NotAuthenticated)
    }

    // ---- session ----

    /// Connect to the configured relays and fix the data source.
    ///
    /// Falls back to [`DataSource::DemoFixture`] when no relay is reachable.
    /// Calling again while a source is active returns that source, and
    /// concurrent callers all get the outcome of a single attempt.
    pub async fn connect(&self) -> DataSource {
        let _attempt = self.inner.connecting.lock().await;
        if let Some(active) = self.inner.source.lock().as_ref() {
            return active.kind();
        }
        let live = self.inner.pool.connect().await;
        let mut guard = self.inner.source.lock();
        let active = guard.get_or_insert_with(|| {
            if live {
                ActiveSource::Live { subs: vec![] }
            } else {
                ActiveSource::Demo { tasks: vec![] }
            }
        });
        info!(source = ?active.kind(), "data source selected");
        active.kind()
    }

    pub fn data_source(&self) -> Option<DataSource> {
        self.inner.source.lock().as_ref().map(ActiveSource::kind)
    }

    pub fn relay_state(&self) -> RelayState {
        self.inner.pool.state()
    }

    /// Register `on_update` for location snapshots and start the feed.
    ///
    /// Before [`connect`](Self::connect) the session counts as disconnected
    /// and the demo fixture is used. Must run inside a tokio runtime.
    /// `on_update` may call back into the client, including
    /// [`teardown`](Self::teardown).
    pub fn subscribe_locations<F>(&self, on_update: F)
    where
        F: Fn(Vec<LocationRecord>) + Send + Sync + 'static,
    {
        self.inner.store.on_locations(on_update);
        self.open_feed(Category::Location);
    }

    /// Register `on_update` for photo snapshots and start the feed.
    pub fn subscribe_photos<F>(&self, on_update: F)
    where
        F: Fn(Vec<PhotoRecord>) + Send + Sync + 'static,
    {
        self.inner.store.on_photos(on_update);
        self.open_feed(Category::Photo);
    }

    fn open_feed(&self, category: Category) {
        let mut guard = self.inner.source.lock();
        let active = guard.get_or_insert_with(|| {
            info!("subscribed before connecting, using demo data");
            ActiveSource::Demo { tasks: vec![] }
        });
        match active {
            ActiveSource::Live { subs } => {
                let store = self.inner.store.clone();
                let filter = Filter::app_stream(category, self.inner.opts.since_window);
                let id = self.inner.pool.subscribe(&filter, move |ev: Event| {
                    match codec::decode(&ev) {
                        Ok(parsed) => store.apply_inbound(parsed),
                        Err(e) => debug!(event_id = %ev.id, error = %e, "dropping inbound event"),
                    }
                });
                subs.push(id);
            }
            ActiveSource::Demo { tasks } => {
                let store = self.inner.store.clone();
                let delay = match category {
                    Category::Location => self.inner.opts.demo_delay,
                    Category::Photo => self.inner.opts.demo_delay * 3 / 2,
                };
                tasks.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let now = unix_now_millis();
                    match category {
                        Category::Location => {
                            for rec in demo::locations(now) {
                                store.apply_inbound_location(rec);
                            }
                        }
                        Category::Photo => {
                            for rec in demo::photos(now) {
                                store.apply_inbound_photo(rec);
                            }
                        }
                    }
                    debug!(category = category.topic(), "demo data delivered");
                }));
            }
        }
    }

    // ---- origination ----

    /// Publish the local position.
    ///
    /// Returns `Ok(false)` when no relay took the event; the store is only
    /// updated after a successful publish.
    pub fn originate_location(&self, sample: LocationSample) -> Result<bool> {
        let identity = self.identity().ok_or(Error::NotAuthenticated)?;
        let (content, tags) = codec::encode_location(&sample, &identity)?;
        let event = codec::seal(content, tags, &identity)?;
        if !self.inner.pool.publish(&event) {
            debug!(event_id = %event.id, "location not published");
            return Ok(false);
        }
        let record = LocationRecord {
            owner_id: identity.keys.public_hex(),
            display_name: identity.profile.name.clone(),
            lat: sample.lat,
            lng: sample.lng,
            captured_at: sample.timestamp,
            origin_event_id: event.id,
        };
        self.record_if_current(&identity, |store| Some(store.stage_location(record)));
        Ok(true)
    }

    /// Publish a photo; on success it heads the local feed.
    pub fn originate_photo(&self, photo: PhotoShare) -> Result<bool> {
        let identity = self.identity().ok_or(Error::NotAuthenticated)?;
        let (content, tags) = codec::encode_photo(&photo, &identity)?;
        let event = codec::seal(content, tags, &identity)?;
        if !self.inner.pool.publish(&event) {
            debug!(event_id = %event.id, "photo not published");
            return Ok(false);
        }
        let record = PhotoRecord {
            event_id: event.id,
            image_ref: photo.url,
            caption: photo.caption,
            location: photo.location,
            captured_at: photo.timestamp,
            author_name: identity.profile.name.clone(),
            owner_id: identity.keys.public_hex(),
        };
        self.record_if_current(&identity, |store| store.stage_prepend(record));
        Ok(true)
    }

    /// Apply a local write only while `identity` is still the bound one.
    ///
    /// The identity read lock is held while staging so a concurrent
    /// [`logout`](Self::logout) either runs first, and the write is skipped,
    /// or clears the store after it.
    fn record_if_current<F>(&self, identity: &Identity, stage: F) -> bool
    where
        F: FnOnce(&SyncStore) -> Option<Pending>,
    {
        let pending = {
            let mgr = self.inner.identity.read();
            let current = mgr
                .identity()
                .is_some_and(|cur| cur.keys.public_hex() == identity.keys.public_hex());
            if !current {
                debug!("identity changed during publish, skipping local record");
                return false;
            }
            stage(&self.inner.store)
        };
        match pending {
            Some(pending) => {
                self.inner.store.deliver(pending);
                true
            }
            None => false,
        }
    }

    /// Re-share the position from `source` every location interval,
    /// replacing any running tracker.
    pub fn start_location_sharing(&self, source: Arc<dyn PositionSource>) -> Result<()> {
        if !self.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let tracker = LocationTracker::start(self.inner.opts.location_interval, source, move |sample| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match (Client { inner }).originate_location(sample) {
                Ok(true) => debug!("location shared"),
                Ok(false) => debug!("location share skipped, offline"),
                Err(e) => warn!(error = %e, "location share failed"),
            }
        });
        if let Some(mut old) = self.inner.tracker.lock().replace(tracker) {
            old.stop();
        }
        info!("location sharing started");
        Ok(())
    }

    pub fn stop_location_sharing(&self) {
        if let Some(mut t) = self.inner.tracker.lock().take() {
            t.stop();
            info!("location sharing stopped");
        }
    }

    pub fn is_sharing_location(&self) -> bool {
        self.inner
            .tracker
            .lock()
            .as_ref()
            .is_some_and(LocationTracker::is_running)
    }

    // ---- views ----

    pub fn store(&self) -> &SyncStore {
        &self.inner.store
    }

    pub fn locations(&self) -> Vec<LocationRecord> {
        self.inner.store.locations()
    }

    pub fn photos(&self) -> Vec<PhotoRecord> {
        self.inner.store.photos()
    }

    // ---- lifecycle ----

    /// Close relays, cancel demo delivery and the tracker, and drop all
    /// listeners. Stored data stays readable. Idempotent.
    pub fn teardown(&self) {
        self.stop_location_sharing();
        let active = self.inner.source.lock().take();
        match active {
            Some(ActiveSource::Live { subs }) => {
                for id in subs {
                    self.inner.pool.unsubscribe(&id);
                }
            }
            Some(ActiveSource::Demo { tasks }) => {
                for t in tasks {
                    t.abort();
                }
            }
            None => {}
        }
        self.inner.pool.teardown();
        self.inner.store.remove_listeners();
    }

    /// Stop sharing, forget the identity and wipe local data.
    pub fn logout(&self) -> Result<()> {
        self.stop_location_sharing();
        let pending = {
            let mut mgr = self.inner.identity.write();
            mgr.clear()?;
            self.inner.store.stage_clear()
        };
        self.inner.store.deliver(pending);
        info!("logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::GeoPoint,
        event::{Tag, UnsignedEvent, KIND_TEXT_NOTE},
        identity::Keys,
        tracker::FixedPosition,
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, sync::mpsc};
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    fn client(dir: &TempDir, urls: Vec<String>) -> Client {
        let mut opts = ClientOptions::new(urls, dir.path().join("identity.json"));
        opts.relay.connect_timeout = Duration::from_secs(2);
        opts.demo_delay = Duration::from_millis(20);
        opts.location_interval = Duration::from_millis(50);
        Client::new(opts)
    }

    fn fugen(ts: u64) -> LocationSample {
        LocationSample {
            lat: 47.3447,
            lng: 11.8486,
            timestamp: ts,
        }
    }

    /// Local relay: forwards every client frame to `frames` and pushes each
    /// event from `inject` to the first subscription it saw.
    async fn spawn_relay() -> (String, mpsc::UnboundedReceiver<Value>, mpsc::UnboundedSender<Event>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut sub: Option<String> = None;
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(txt))) => {
                            let v: Value = serde_json::from_str(&txt).unwrap();
                            if v[0] == "REQ" && sub.is_none() {
                                sub = v[1].as_str().map(str::to_string);
                            }
                            let _ = frame_tx.send(v);
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    Some(ev) = inject_rx.recv() => {
                        let id = sub.clone().unwrap_or_default();
                        let _ = ws.send(Message::Text(json!(["EVENT", id, ev]).to_string())).await;
                    }
                }
            }
        });
        (format!("ws://{addr}"), frame_rx, inject_tx)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn originate_requires_identity() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![]);
        assert!(matches!(
            c.originate_location(fugen(1)),
            Err(Error::NotAuthenticated)
        ));
        let photo = PhotoShare {
            url: "data:,".into(),
            caption: "x".into(),
            location: None,
            timestamp: 1,
        };
        assert!(matches!(c.originate_photo(photo), Err(Error::NotAuthenticated)));
        assert!(c.locations().is_empty());
        assert!(c.photos().is_empty());
        assert!(matches!(
            c.start_location_sharing(Arc::new(FixedPosition::new(1.0, 2.0))),
            Err(Error::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn offline_originate_leaves_no_local_record() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![dead_url().await]);
        let alice = c.create_identity("Someone").unwrap();
        c.set_display_name("Alice").unwrap();
        assert_eq!(c.identity().unwrap().profile.name, "Alice");
        assert_eq!(c.connect().await, DataSource::DemoFixture);
        assert_eq!(c.originate_location(fugen(1_700_000_000_000)).unwrap(), false);
        assert!(c.store().location_of(&alice.keys.public_hex()).is_none());
        assert!(c.locations().is_empty());
    }

    #[tokio::test]
    async fn demo_fixture_fills_store_after_delay() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![dead_url().await]);
        assert_eq!(c.connect().await, DataSource::DemoFixture);
        assert_eq!(c.data_source(), Some(DataSource::DemoFixture));
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.subscribe_locations(move |snap| {
            let _ = tx.send(snap);
        });
        c.subscribe_photos(|_| {});
        assert!(c.locations().is_empty());
        let snap = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!snap.is_empty());
        assert!(wait_for(|| c.locations().len() == 2 && c.photos().len() == 1).await);
        assert_eq!(c.photos()[0].caption, "Amazing powder day!");
        c.teardown();
    }

    #[tokio::test]
    async fn subscribing_before_connect_uses_demo() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![dead_url().await]);
        c.subscribe_photos(|_| {});
        assert_eq!(c.data_source(), Some(DataSource::DemoFixture));
        assert_eq!(c.connect().await, DataSource::DemoFixture);
        assert!(wait_for(|| c.photos().len() == 1).await);
    }

    #[tokio::test]
    async fn teardown_cancels_pending_demo_delivery() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![dead_url().await]);
        c.connect().await;
        c.subscribe_locations(|_| {});
        c.teardown();
        c.teardown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.locations().is_empty());
        assert_eq!(c.data_source(), None);
    }

    #[tokio::test]
    async fn live_session_publishes_and_merges_inbound() {
        let dir = TempDir::new().unwrap();
        let (url, mut frames, inject) = spawn_relay().await;
        let c = client(&dir, vec![url]);
        let me = c.create_identity("Alice").unwrap();
        assert_eq!(c.connect().await, DataSource::LiveRelay);
        c.subscribe_locations(|_| {});

        let req = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req[0], "REQ");
        assert_eq!(req[2]["#t"], json!(["nostravel", "location"]));

        assert!(c.originate_location(fugen(5)).unwrap());
        let sent = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent[0], "EVENT");
        assert_eq!(sent[1]["pubkey"], me.keys.public_hex());
        let mine = c.store().location_of(&me.keys.public_hex()).unwrap();
        assert_eq!(mine.display_name, "Alice");
        assert_eq!(mine.origin_event_id, sent[1]["id"].as_str().unwrap());

        // A family member's event and an unrelated note on the same relay.
        let mom = Identity {
            keys: Keys::generate(),
            profile: Profile::new("Mom").unwrap(),
        };
        let (content, tags) = codec::encode_location(&fugen(7), &mom).unwrap();
        inject.send(codec::seal(content, tags, &mom).unwrap()).unwrap();
        let foreign = UnsignedEvent::new(
            KIND_TEXT_NOTE,
            vec![Tag::topic("nostravel")],
            json!({"type":"location","lat":1.0,"lng":1.0,"timestamp":1,"name":"Eve","app":"elsewhere"})
                .to_string(),
        )
        .sign(Keys::generate().keypair())
        .unwrap();
        inject.send(foreign).unwrap();

        assert!(wait_for(|| c.store().location_of(&mom.keys.public_hex()).is_some()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let names: Vec<String> = c.locations().into_iter().map(|l| l.display_name).collect();
        assert_eq!(names, vec!["Alice", "Mom"]);
        c.teardown();
        assert_eq!(c.relay_state(), RelayState::Disconnected);

        let close = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(v) = frames.recv().await {
                if v[0] == "CLOSE" {
                    return v;
                }
            }
            Value::Null
        })
        .await
        .unwrap();
        assert_eq!(close[1], req[1]);
    }

    #[tokio::test]
    async fn published_photo_heads_feed() {
        let dir = TempDir::new().unwrap();
        let (url, _frames, _inject) = spawn_relay().await;
        let c = client(&dir, vec![url]);
        c.create_identity("Alice").unwrap();
        c.connect().await;
        let now = unix_now_millis();
        c.store().apply_inbound_photo(PhotoRecord {
            event_id: "older".into(),
            image_ref: "data:,".into(),
            caption: "yesterday".into(),
            location: None,
            captured_at: now - 86_000_000,
            author_name: "Dad".into(),
            owner_id: "dad".into(),
        });
        let shared = c
            .originate_photo(PhotoShare {
                url: "data:image/png;base64,AAAA".into(),
                caption: "Summit".into(),
                location: Some(GeoPoint { lat: 47.3, lng: 11.9 }),
                timestamp: now,
            })
            .unwrap();
        assert!(shared);
        let photos = c.photos();
        assert_eq!(photos[0].caption, "Summit");
        assert_eq!(photos[0].author_name, "Alice");
        assert_eq!(photos[1].event_id, "older");
        c.teardown();
    }

    #[tokio::test]
    async fn tracker_shares_until_logout() {
        let dir = TempDir::new().unwrap();
        let (url, _frames, _inject) = spawn_relay().await;
        let c = client(&dir, vec![url]);
        let me = c.create_identity("Alice").unwrap();
        c.connect().await;
        c.start_location_sharing(Arc::new(FixedPosition::new(47.35, 11.85)))
            .unwrap();
        assert!(c.is_sharing_location());
        assert!(wait_for(|| c.store().location_of(&me.keys.public_hex()).is_some()).await);

        c.logout().unwrap();
        assert!(!c.is_sharing_location());
        assert!(!c.is_authenticated());
        assert!(c.locations().is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c.locations().is_empty());
        assert!(!dir.path().join("identity.json").exists());
        c.teardown();
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let dir = TempDir::new().unwrap();
        let nsec = {
            let c = client(&dir, vec![]);
            let id = c.create_identity("Alice").unwrap();
            assert_eq!(c.export_backup().unwrap().npub, id.keys.npub());
            id.keys.nsec()
        };
        let c = client(&dir, vec![]);
        assert!(!c.is_authenticated());
        let restored = c.restore_identity().unwrap();
        assert_eq!(restored.keys.nsec(), nsec);
        assert_eq!(restored.profile.name, "Alice");
        let backup = c.export_backup().unwrap();
        assert_eq!(backup.nsec, nsec);

        let other_dir = TempDir::new().unwrap();
        let other = client(&other_dir, vec![]);
        assert!(matches!(other.export_backup(), Err(Error::NotAuthenticated)));
        let imported = other.import_identity(&nsec, "Alice 2").unwrap();
        assert_eq!(imported.keys.public_hex(), restored.keys.public_hex());
        assert!(matches!(
            other.import_identity("npub1garbage", "x"),
            Err(Error::InvalidKeyFormat(_))
        ));
        assert!(matches!(other.create_identity("  "), Err(Error::InvalidProfile(_))));
    }

    fn mom_location() -> Event {
        let mom = Identity {
            keys: Keys::generate(),
            profile: Profile::new("Mom").unwrap(),
        };
        let (content, tags) = codec::encode_location(&fugen(7), &mom).unwrap();
        codec::seal(content, tags, &mom).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_may_tear_down_the_client() {
        let dir = TempDir::new().unwrap();
        let (url, mut frames, inject) = spawn_relay().await;
        let c = client(&dir, vec![url]);
        assert_eq!(c.connect().await, DataSource::LiveRelay);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = c.clone();
        c.subscribe_locations(move |_| {
            inner.teardown();
            let _ = tx.send(());
        });
        let req = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req[0], "REQ");
        inject.send(mom_location()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.relay_state(), RelayState::Disconnected);
        assert_eq!(c.data_source(), None);
        assert_eq!(c.locations().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_agree_on_live_relay() {
        let dir = TempDir::new().unwrap();
        let (url, _frames, _inject) = spawn_relay().await;
        let c = client(&dir, vec![url]);
        let (a, b) = tokio::join!(c.connect(), c.connect());
        assert_eq!(a, DataSource::LiveRelay);
        assert_eq!(b, DataSource::LiveRelay);
        assert_eq!(c.data_source(), Some(DataSource::LiveRelay));
        assert_eq!(c.relay_state(), RelayState::Connected);
        c.teardown();
    }

    #[tokio::test]
    async fn publish_finishing_after_logout_leaves_store_empty() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir, vec![]);
        let before = c.create_identity("Alice").unwrap();
        c.logout().unwrap();
        let record = LocationRecord {
            owner_id: before.keys.public_hex(),
            display_name: "Alice".into(),
            lat: 47.3447,
            lng: 11.8486,
            captured_at: 1,
            origin_event_id: "late".into(),
        };
        assert!(!c.record_if_current(&before, |store| Some(store.stage_location(record.clone()))));
        assert!(c.locations().is_empty());

        // A different identity bound in the meantime does not adopt it either.
        c.create_identity("Bob").unwrap();
        assert!(!c.record_if_current(&before, |store| Some(store.stage_location(record))));
        assert!(c.locations().is_empty());

        let bob = c.identity().unwrap();
        let mine = LocationRecord {
            owner_id: bob.keys.public_hex(),
            display_name: "Bob".into(),
            lat: 47.3447,
            lng: 11.8486,
            captured_at: 2,
            origin_event_id: "bob".into(),
        };
        assert!(c.record_if_current(&bob, |store| Some(store.stage_location(mine))));
        assert_eq!(c.locations().len(), 1);
    }
}
