//! Great-circle distances on a spherical earth.

use uom::si::{f64::Length, length::meter};

use crate::state::{GeoPoint, MissionPlan};

/// Mean earth radius in meters
pub const EARTH_MEAN_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points.
pub fn distance(a: GeoPoint, b: GeoPoint) -> Length {
    Length::new::<meter>(haversine_m(a, b))
}

fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude().to_radians();
    let lat_b = b.latitude().to_radians();
    let d_lat = lat_b - lat_a;
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    // rounding can push h a hair outside of [0, 1] near antipodal points
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_MEAN_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Length of the one-way route starting at `origin` and visiting every
/// waypoint of `plan` in order.
pub fn route_length(origin: GeoPoint, plan: &MissionPlan) -> Length {
    let mut total = Length::new::<meter>(0.0);
    let mut from = origin;

    for wp in plan.waypoints() {
        total += distance(from, wp.position);
        from = wp.position;
    }

    total
}
