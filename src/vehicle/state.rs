use serde::Serialize;
use uom::si::length::meter;

use crate::{geodesic, state::GeoPoint};

/// Which waypoint of the uploaded plan the vehicle is flying to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionIndex {
    #[default]
    NotStarted,
    Active(usize),
    Finished,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct VehicleState {
    pub connected: bool,
    pub global_position_ok: bool,
    pub home_position_ok: bool,
    pub armed: bool,

    pub position: Option<GeoPoint>,
    pub home: Option<GeoPoint>,

    pub mission_index: MissionIndex,

    /// Number of waypoints in the uploaded plan
    pub mission_len: usize,

    /// Set once the vehicle is back at its launch point after a return
    pub returned: bool,

    /// Meters flown since connecting
    pub odometer_m: f64,
}

impl VehicleState {
    pub fn is_ready(&self) -> bool {
        self.global_position_ok && self.home_position_ok
    }

    pub fn is_finished(&self) -> bool {
        self.mission_index == MissionIndex::Finished
    }

    pub fn active_waypoint(&self) -> Option<usize> {
        match self.mission_index {
            MissionIndex::Active(index) => Some(index),
            _ => None,
        }
    }

    /// Moves the vehicle to `position`, adding the leg to the odometer.
    pub fn record_position(&mut self, position: GeoPoint) {
        if let Some(previous) = self.position {
            self.odometer_m += geodesic::distance(previous, position).get::<meter>();
        }

        self.position = Some(position);
    }

    /// Moves to the next mission index unless the mission already finished.
    pub fn advance_to(&mut self, index: MissionIndex) {
        if !self.is_finished() {
            self.mission_index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odometer_accumulates_legs() {
        let mut state = VehicleState::default();
        let a = GeoPoint::new(51.5074, -0.1278).unwrap();
        let b = GeoPoint::new(51.5174, -0.1278).unwrap();

        state.record_position(a);
        assert_eq!(state.odometer_m, 0.0);

        state.record_position(b);
        state.record_position(a);

        let leg = geodesic::distance(a, b).get::<meter>();
        assert!((state.odometer_m - 2.0 * leg).abs() < 1e-6);
        assert_eq!(state.position, Some(a));
    }

    #[test]
    fn finished_is_sticky() {
        let mut state = VehicleState::default();
        state.advance_to(MissionIndex::Active(0));
        assert_eq!(state.active_waypoint(), Some(0));

        state.advance_to(MissionIndex::Finished);
        state.advance_to(MissionIndex::Active(1));
        assert!(state.is_finished());
        assert_eq!(state.active_waypoint(), None);
    }
}
