//! Great-circle distance between site coordinates.

use datagrid_core::site::GeoCoord;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Haversine distance between two coordinates, in kilometers.
pub fn distance_km(a: GeoCoord, b: GeoCoord) -> f64 {
    let lat_a = a.lat_deg.to_radians();
    let lat_b = b.lat_deg.to_radians();
    let d_lat = (b.lat_deg - a.lat_deg).to_radians();
    let d_lon = (b.lon_deg - a.lon_deg).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Proximity score in [0, 1]: 1.0 for co-located sites, decaying toward
/// zero at antipodal distance.
pub fn proximity_score(a: GeoCoord, b: GeoCoord) -> f64 {
    let half_circumference = std::f64::consts::PI * EARTH_RADIUS_KM;
    1.0 - (distance_km(a, b) / half_circumference).clamp(0.0, 1.0)
}
