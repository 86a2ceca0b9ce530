//! Mission supervisor for a waypoint delivery drone.
//!
//! The supervisor validates a delivery against operational limits, drives a
//! real or simulated vehicle through the mission, watches its telemetry while
//! it flies and brings it back to the launch point.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod event;
pub mod geocode;
pub mod geodesic;
pub mod monitor;
pub mod policy;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod util;
pub mod vehicle;

pub use event::{EventSink, MissionEvent};
pub use state::{GeoPoint, MissionPlan, Waypoint};
pub use supervisor::{MissionOutcome, MissionPhase, MissionSupervisor};
pub use vehicle::{Vehicle, VehicleState};
