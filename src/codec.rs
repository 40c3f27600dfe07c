//! Application payloads carried in event content, and the namespace filter
//! applied to everything read off the shared network.

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    event::{Event, Tag, UnsignedEvent, KIND_TEXT_NOTE},
    geohash,
    identity::Identity,
};

/// Value of the `app` field that marks this application's events.
pub const APP_NAMESPACE: &str = "nostravel-fugen";
/// First `t` tag on every event.
pub const TOPIC_APP: &str = "nostravel";
/// Resort marker, last `t` tag on every event.
pub const TOPIC_RESORT: &str = "fugen";

/// Event category; doubles as the second `t` tag and the content `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Location,
    Photo,
}

impl Category {
    pub fn topic(self) -> &'static str {
        match self {
            Category::Location => "location",
            Category::Photo => "photo",
        }
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Position sample supplied by the host; `timestamp` is Unix milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: u64,
}

impl LocationSample {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// A photo about to be shared. `url` is an opaque image reference such as a
/// data URL produced by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoShare {
    pub url: String,
    pub caption: String,
    pub location: Option<GeoPoint>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationContent {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: u64,
    pub name: String,
    /// Author's share form; absent on events from older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npub: Option<String>,
    pub app: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoContent {
    pub url: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    pub timestamp: u64,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npub: Option<String>,
    pub app: String,
}

/// Content document, discriminated by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Location(LocationContent),
    Photo(PhotoContent),
}

impl Payload {
    fn app(&self) -> &str {
        match self {
            Payload::Location(c) => &c.app,
            Payload::Photo(c) => &c.app,
        }
    }
}

/// An inbound event that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event_id: String,
    /// Author public key (hex).
    pub author: String,
    pub created_at: u64,
    pub payload: Payload,
}

fn base_tags(category: Category) -> Vec<Tag> {
    vec![
        Tag::topic(TOPIC_APP),
        Tag::topic(category.topic()),
        Tag::topic(TOPIC_RESORT),
    ]
}

fn geohash_tag(point: GeoPoint) -> Tag {
    Tag::new(
        "geohash",
        geohash::encode(point.lat, point.lng, geohash::TAG_PRECISION),
    )
}

/// Content and tags for a location note.
pub fn encode_location(sample: &LocationSample, identity: &Identity) -> Result<(String, Vec<Tag>)> {
    let content = Payload::Location(LocationContent {
        lat: sample.lat,
        lng: sample.lng,
        timestamp: sample.timestamp,
        name: identity.profile.name.clone(),
        npub: Some(identity.keys.npub()),
        app: APP_NAMESPACE.to_string(),
    });
    let mut tags = base_tags(Category::Location);
    tags.push(geohash_tag(sample.point()));
    Ok((serde_json::to_string(&content)?, tags))
}

/// Content and tags for a photo note; the geohash tag is only added when the
/// photo carries a location.
pub fn encode_photo(photo: &PhotoShare, identity: &Identity) -> Result<(String, Vec<Tag>)> {
    let content = Payload::Photo(PhotoContent {
        url: photo.url.clone(),
        caption: photo.caption.clone(),
        location: photo.location,
        timestamp: photo.timestamp,
        author: identity.profile.name.clone(),
        npub: Some(identity.keys.npub()),
        app: APP_NAMESPACE.to_string(),
    });
    let mut tags = base_tags(Category::Photo);
    if let Some(point) = photo.location {
        tags.push(geohash_tag(point));
    }
    Ok((serde_json::to_string(&content)?, tags))
}

/// Wrap encoded content into a signed kind-1 event.
pub fn seal(content: String, tags: Vec<Tag>, identity: &Identity) -> Result<Event> {
    UnsignedEvent::new(KIND_TEXT_NOTE, tags, content).sign(identity.keys.keypair())
}

/// Validate an inbound event and parse its content.
///
/// Relay-side filters are only hints, so every event is checked here: the
/// signature must verify, the content must be a known payload type, and its
/// `app` field must equal [`APP_NAMESPACE`].
pub fn decode(ev: &Event) -> Result<ParsedEvent> {
    if ev.kind != KIND_TEXT_NOTE {
        return Err(Error::MalformedInboundEvent(format!("unexpected kind {}", ev.kind)));
    }
    ev.verify()
        .map_err(|e| Error::MalformedInboundEvent(e.to_string()))?;
    let payload: Payload = serde_json::from_str(&ev.content)
        .map_err(|e| Error::MalformedInboundEvent(e.to_string()))?;
    if payload.app() != APP_NAMESPACE {
        return Err(Error::MalformedInboundEvent(format!(
            "foreign namespace {:?}",
            payload.app()
        )));
    }
    let coords_ok = match &payload {
        Payload::Location(c) => GeoPoint { lat: c.lat, lng: c.lng }.is_valid(),
        Payload::Photo(c) => c.location.map_or(true, |p| p.is_valid()),
    };
    if !coords_ok {
        return Err(Error::MalformedInboundEvent("coordinates out of range".into()));
    }
    Ok(ParsedEvent {
        event_id: ev.id.clone(),
        author: ev.pubkey.clone(),
        created_at: ev.created_at,
        payload,
    })
}
