//! Operational rules a delivery must satisfy before any flight is attempted.
//!
//! Range and altitude are hard limits. The delivery time target is advisory:
//! missing it is reported but does not stop the mission.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uom::si::{
    f64::{Length, Time, Velocity},
    length::{kilometer, meter},
    time::minute,
    velocity::kilometer_per_hour,
};

use crate::{
    geodesic,
    state::{GeoPoint, MissionPlan},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConstraint {
    /// Longest one-way route the vehicle may fly, in kilometers
    pub max_range_km: f64,

    /// Delivery time target, in minutes
    pub target_minutes: f64,

    /// Cruise speed used for time estimates, in kilometers per hour
    pub cruise_speed_kmh: f64,

    /// Legal altitude ceiling above the launch point, in meters
    pub altitude_ceiling_m: f64,
}

impl Default for DeliveryConstraint {
    fn default() -> Self {
        DeliveryConstraint {
            max_range_km: 5.0,
            target_minutes: 8.0,
            cruise_speed_kmh: 37.5,
            altitude_ceiling_m: 120.0,
        }
    }
}

impl DeliveryConstraint {
    pub fn max_range(&self) -> Length {
        Length::new::<kilometer>(self.max_range_km)
    }

    pub fn target(&self) -> Time {
        Time::new::<minute>(self.target_minutes)
    }

    pub fn cruise_speed(&self) -> Velocity {
        Velocity::new::<kilometer_per_hour>(self.cruise_speed_kmh)
    }

    pub fn altitude_ceiling(&self) -> Length {
        Length::new::<meter>(self.altitude_ceiling_m)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyRejection {
    #[error("route of {route_km:.2} km exceeds the {max_range_km:.2} km delivery range")]
    OutOfRange { route_km: f64, max_range_km: f64 },
    #[error("waypoint {index} at {altitude_m:.1} m is above the {ceiling_m:.1} m altitude ceiling")]
    AltitudeCeiling {
        index: usize,
        altitude_m: f64,
        ceiling_m: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaStatus {
    WithinTarget,
    EtaExceeded,
}

/// An accepted delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyVerdict {
    pub route: Length,
    pub eta: Time,
    pub status: EtaStatus,
}

impl PolicyVerdict {
    pub fn route_km(&self) -> f64 {
        self.route.get::<kilometer>()
    }

    pub fn eta_minutes(&self) -> f64 {
        self.eta.get::<minute>()
    }
}

/// Time needed to fly `route` at `cruise_speed`.
pub fn estimate_eta(route: Length, cruise_speed: Velocity) -> Time {
    route / cruise_speed
}

/// Checks a route length against the range limit and grades its estimated
/// flight time against the delivery target.
pub fn validate(
    route: Length,
    constraint: &DeliveryConstraint,
) -> Result<PolicyVerdict, PolicyRejection> {
    if route > constraint.max_range() {
        return Err(PolicyRejection::OutOfRange {
            route_km: route.get::<kilometer>(),
            max_range_km: constraint.max_range_km,
        });
    }

    let eta = estimate_eta(route, constraint.cruise_speed());

    let status = if eta > constraint.target() {
        EtaStatus::EtaExceeded
    } else {
        EtaStatus::WithinTarget
    };

    Ok(PolicyVerdict { route, eta, status })
}

/// Validates a whole plan flown from `origin`: every waypoint must sit under
/// the altitude ceiling and the one-way route must be within range.
pub fn validate_plan(
    origin: GeoPoint,
    plan: &MissionPlan,
    constraint: &DeliveryConstraint,
) -> Result<PolicyVerdict, PolicyRejection> {
    let ceiling = constraint.altitude_ceiling();

    for (index, wp) in plan.waypoints().iter().enumerate() {
        if Length::new::<meter>(wp.altitude_rel_m) > ceiling {
            return Err(PolicyRejection::AltitudeCeiling {
                index,
                altitude_m: wp.altitude_rel_m,
                ceiling_m: constraint.altitude_ceiling_m,
            });
        }
    }

    validate(geodesic::route_length(origin, plan), constraint)
}
