//! Merged local view of who is where and what was shared.
//!
//! Locations are keyed by author: the most recently applied event for an
//! author replaces the previous record regardless of its capture time.
//! Photos are a set keyed by event id, kept newest-first by capture time;
//! a repeated id is ignored, so the first content applied for an id wins.
//!
//! All mutation happens under one mutex so inbound callbacks from several
//! relay tasks can interleave freely. Listeners are called after the lock is
//! released, with a full snapshot. Each mutation stamps its snapshot with a
//! generation and a snapshot older than one already delivered is dropped, so
//! the last snapshot a listener sees always matches the store.

use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{GeoPoint, ParsedEvent, Payload};

/// Latest known position of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Author public key (hex).
    pub owner_id: String,
    pub display_name: String,
    pub lat: f64,
    pub lng: f64,
    /// Producer-side capture time, Unix milliseconds.
    pub captured_at: u64,
    pub origin_event_id: String,
}

/// One shared photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub event_id: String,
    pub image_ref: String,
    pub caption: String,
    pub location: Option<GeoPoint>,
    /// Producer-side capture time, Unix milliseconds.
    pub captured_at: u64,
    pub author_name: String,
    pub owner_id: String,
}

pub type LocationListener = Arc<dyn Fn(Vec<LocationRecord>) + Send + Sync>;
pub type PhotoListener = Arc<dyn Fn(Vec<PhotoRecord>) + Send + Sync>;

type Listeners<T> = RwLock<Vec<Arc<dyn Fn(Vec<T>) + Send + Sync>>>;

/// Generation of the newest snapshot handed to listeners. Reentrant so a
/// listener may itself mutate the store.
type Gate = ReentrantMutex<Cell<u64>>;

#[derive(Default)]
struct State {
    locations: HashMap<String, LocationRecord>,
    /// Owner ids in first-insertion order.
    location_order: Vec<String>,
    photos: Vec<PhotoRecord>,
    photo_ids: HashSet<String>,
    location_gen: u64,
    photo_gen: u64,
}

impl State {
    fn location_snapshot(&self) -> Vec<LocationRecord> {
        self.location_order
            .iter()
            .filter_map(|id| self.locations.get(id))
            .filter(|rec| !rec.display_name.is_empty())
            .cloned()
            .collect()
    }

    fn sort_photos(&mut self) {
        self.photos
            .sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
    }

    fn staged_locations(&mut self) -> Staged<LocationRecord> {
        self.location_gen += 1;
        Staged {
            generation: self.location_gen,
            snapshot: self.location_snapshot(),
        }
    }

    fn staged_photos(&mut self) -> Staged<PhotoRecord> {
        self.photo_gen += 1;
        Staged {
            generation: self.photo_gen,
            snapshot: self.photos.clone(),
        }
    }
}

struct Staged<T> {
    generation: u64,
    snapshot: Vec<T>,
}

/// Snapshots produced by a mutation that listeners have not seen yet.
///
/// Lets a caller mutate the store while holding one of its own locks and
/// notify listeners after releasing it.
#[must_use]
pub(crate) struct Pending {
    locations: Option<Staged<LocationRecord>>,
    photos: Option<Staged<PhotoRecord>>,
}

/// Thread-safe location map and photo feed with snapshot listeners.
pub struct SyncStore {
    state: Mutex<State>,
    location_listeners: Listeners<LocationRecord>,
    photo_listeners: Listeners<PhotoRecord>,
    location_gate: Gate,
    photo_gate: Gate,
}

impl Default for SyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            location_listeners: RwLock::new(vec![]),
            photo_listeners: RwLock::new(vec![]),
            location_gate: ReentrantMutex::new(Cell::new(0)),
            photo_gate: ReentrantMutex::new(Cell::new(0)),
        }
    }

    /// Register a listener for location snapshots.
    pub fn on_locations<F>(&self, f: F)
    where
        F: Fn(Vec<LocationRecord>) + Send + Sync + 'static,
    {
        self.location_listeners.write().push(Arc::new(f));
    }

    /// Register a listener for photo snapshots.
    pub fn on_photos<F>(&self, f: F)
    where
        F: Fn(Vec<PhotoRecord>) + Send + Sync + 'static,
    {
        self.photo_listeners.write().push(Arc::new(f));
    }

    /// Merge a decoded inbound event.
    pub fn apply_inbound(&self, parsed: ParsedEvent) {
        match parsed.payload {
            Payload::Location(c) => self.apply_inbound_location(LocationRecord {
                owner_id: parsed.author,
                display_name: c.name,
                lat: c.lat,
                lng: c.lng,
                captured_at: c.timestamp,
                origin_event_id: parsed.event_id,
            }),
            Payload::Photo(c) => {
                self.apply_inbound_photo(PhotoRecord {
                    event_id: parsed.event_id,
                    image_ref: c.url,
                    caption: c.caption,
                    location: c.location,
                    captured_at: c.timestamp,
                    author_name: c.author,
                    owner_id: parsed.author,
                });
            }
        }
    }

    /// Upsert by `owner_id`; the new record always replaces the old one.
    pub fn apply_inbound_location(&self, record: LocationRecord) {
        let pending = self.stage_location(record);
        self.deliver(pending);
    }

    /// Insert unless the event id is already known. Returns whether the
    /// record was added; listeners only fire on insertion.
    pub fn apply_inbound_photo(&self, record: PhotoRecord) -> bool {
        let staged = {
            let mut state = self.state.lock();
            if !state.photo_ids.insert(record.event_id.clone()) {
                return false;
            }
            debug!(event_id = %record.event_id, "photo merged");
            state.photos.push(record);
            state.sort_photos();
            state.staged_photos()
        };
        self.deliver(Pending {
            locations: None,
            photos: Some(staged),
        });
        true
    }

    /// Put a locally originated photo at the head of the feed.
    pub fn prepend_photo(&self, record: PhotoRecord) -> bool {
        match self.stage_prepend(record) {
            Some(pending) => {
                self.deliver(pending);
                true
            }
            None => false,
        }
    }

    /// Named locations in insertion order.
    pub fn locations(&self) -> Vec<LocationRecord> {
        self.state.lock().location_snapshot()
    }

    pub fn location_of(&self, owner_id: &str) -> Option<LocationRecord> {
        self.state.lock().locations.get(owner_id).cloned()
    }

    /// Photos, newest capture first.
    pub fn photos(&self) -> Vec<PhotoRecord> {
        self.state.lock().photos.clone()
    }

    /// Drop both collections and tell listeners.
    pub fn clear(&self) {
        let pending = self.stage_clear();
        self.deliver(pending);
    }

    /// Forget every registered listener; data is kept.
    pub fn remove_listeners(&self) {
        self.location_listeners.write().clear();
        self.photo_listeners.write().clear();
    }

    pub(crate) fn stage_location(&self, record: LocationRecord) -> Pending {
        let mut state = self.state.lock();
        if !state.locations.contains_key(&record.owner_id) {
            state.location_order.push(record.owner_id.clone());
        }
        debug!(owner = %record.owner_id, event_id = %record.origin_event_id, "location merged");
        state.locations.insert(record.owner_id.clone(), record);
        Pending {
            locations: Some(state.staged_locations()),
            photos: None,
        }
    }

    /// `None` when the event id is already known.
    pub(crate) fn stage_prepend(&self, record: PhotoRecord) -> Option<Pending> {
        let mut state = self.state.lock();
        if !state.photo_ids.insert(record.event_id.clone()) {
            return None;
        }
        state.photos.insert(0, record);
        state.sort_photos();
        Some(Pending {
            locations: None,
            photos: Some(state.staged_photos()),
        })
    }

    pub(crate) fn stage_clear(&self) -> Pending {
        let mut state = self.state.lock();
        let (location_gen, photo_gen) = (state.location_gen, state.photo_gen);
        *state = State {
            location_gen,
            photo_gen,
            ..State::default()
        };
        Pending {
            locations: Some(state.staged_locations()),
            photos: Some(state.staged_photos()),
        }
    }

    /// Hand staged snapshots to listeners. Must not be called with the
    /// state lock held.
    pub(crate) fn deliver(&self, pending: Pending) {
        if let Some(staged) = pending.locations {
            deliver(&self.location_gate, &self.location_listeners, staged);
        }
        if let Some(staged) = pending.photos {
            deliver(&self.photo_gate, &self.photo_listeners, staged);
        }
    }
}

fn deliver<T: Clone>(gate: &Gate, listeners: &Listeners<T>, staged: Staged<T>) {
    let last = gate.lock();
    if staged.generation <= last.get() {
        return;
    }
    last.set(staged.generation);
    let listeners = listeners.read().clone();
    for l in listeners {
        // A listener that mutated the store has already delivered a newer
        // snapshot to everyone.
        if last.get() != staged.generation {
            break;
        }
        l(staged.snapshot.clone());
    }
}
