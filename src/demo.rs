//! Fixed data shown when no relay could be reached.

use crate::{
    codec::{GeoPoint, LocationSample},
    event::unix_now_millis,
    sync::{LocationRecord, PhotoRecord},
};

/// Centre of Fügen, used when the host has no position fix.
pub const FUGEN: GeoPoint = GeoPoint {
    lat: 47.3447,
    lng: 11.8486,
};

const MINUTE_MS: u64 = 60_000;

const DEMO_PHOTO_URL: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iMzAwIiBoZWlnaHQ9IjIwMCIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iMzAwIiBoZWlnaHQ9IjIwMCIgZmlsbD0iIzY2N2VlYSIvPjx0ZXh0IHg9IjUwJSIgeT0iNTAlIiBmb250LWZhbWlseT0iQXJpYWwiIGZvbnQtc2l6ZT0iMjQiIGZpbGw9IndoaXRlIiB0ZXh0LWFuY2hvcj0ibWlkZGxlIiBkeT0iLjNlbSI+RGVtbyBQaG90bzwvdGV4dD48L3N2Zz4=";

/// Sample at [`FUGEN`] stamped now.
pub fn fallback_sample() -> LocationSample {
    LocationSample {
        lat: FUGEN.lat,
        lng: FUGEN.lng,
        timestamp: unix_now_millis(),
    }
}

/// Two family members near the valley station, relative to `now` (ms).
pub fn locations(now: u64) -> Vec<LocationRecord> {
    [("mom", "Mom", 47.3450, 11.8490, 5), ("dad", "Dad", 47.3440, 11.8480, 10)]
        .into_iter()
        .map(|(key, name, lat, lng, mins_ago)| LocationRecord {
            owner_id: format!("demo-{key}"),
            display_name: name.to_string(),
            lat,
            lng,
            captured_at: now.saturating_sub(mins_ago * MINUTE_MS),
            origin_event_id: format!("demo-location-{key}"),
        })
        .collect()
}

/// A single placeholder photo, relative to `now` (ms).
pub fn photos(now: u64) -> Vec<PhotoRecord> {
    vec![PhotoRecord {
        event_id: "demo-photo-1".into(),
        image_ref: DEMO_PHOTO_URL.into(),
        caption: "Amazing powder day!".into(),
        location: Some(FUGEN),
        captured_at: now.saturating_sub(30 * MINUTE_MS),
        author_name: "Demo User".into(),
        owner_id: "demo-user".into(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_is_relative_to_now() {
        let now = 10_000_000;
        let locs = locations(now);
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].display_name, "Mom");
        assert_eq!(locs[0].captured_at, now - 5 * MINUTE_MS);
        assert_eq!(locs[1].display_name, "Dad");
        assert_eq!((locs[1].lat, locs[1].lng), (47.3440, 11.8480));

        let photos = photos(now);
        assert_eq!(photos[0].caption, "Amazing powder day!");
        assert_eq!(photos[0].captured_at, now - 30 * MINUTE_MS);
        assert!(photos[0].image_ref.starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn small_clock_does_not_underflow() {
        assert_eq!(locations(0)[1].captured_at, 0);
        assert_eq!(photos(1)[0].captured_at, 0);
    }

    #[test]
    fn fallback_is_fugen() {
        let s = fallback_sample();
        assert_eq!(s.point(), FUGEN);
        assert!(s.timestamp > 0);
    }
}
