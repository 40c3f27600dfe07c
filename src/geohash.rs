//! Geohash encoding for the coarse `geohash` tag on outbound events.

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Precision used for the `geohash` tag on location and photo events.
pub const TAG_PRECISION: usize = 8;

/// Encode a coordinate into a geohash of exactly `precision` characters.
///
/// Bits alternate between longitude and latitude, starting with longitude;
/// every five bits select one symbol of the geohash alphabet. Values on a
/// range midpoint fall into the upper half.
pub fn encode(lat: f64, lng: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lng_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0;
    let mut idx = 0usize;
    let mut even = true;

    while hash.len() < precision {
        let (range, value) = if even {
            (&mut lng_range, lng)
        } else {
            (&mut lat_range, lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        if value >= mid {
            idx = (idx << 1) | 1;
            range.0 = mid;
        } else {
            idx <<= 1;
            range.1 = mid;
        }
        even = !even;
        bits += 1;

        if bits == 5 {
            hash.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    hash
}
