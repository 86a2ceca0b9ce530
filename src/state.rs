use std::{fmt, num::ParseFloatError, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("latitude {0} is outside of [-90, 90]")]
    InvalidLatitude(f64),
    #[error("longitude {0} is outside of [-180, 180]")]
    InvalidLongitude(f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParsePointError {
    #[error("invalid coordinates given")]
    InvalidCoord(#[from] ParseFloatError),
    #[error("missing comma")]
    MissingComma,
    #[error(transparent)]
    OutOfRange(#[from] GeoError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("a mission needs at least one waypoint")]
    Empty,
    #[error("waypoint {index} has non-positive altitude {altitude_m} m")]
    InvalidAltitude { index: usize, altitude_m: f64 },
    #[error("waypoint {index} has non-positive speed {speed_m_s} m/s")]
    InvalidSpeed { index: usize, speed_m_s: f64 },
    #[error("waypoint {index} has negative loiter time {loiter_s} s")]
    InvalidLoiter { index: usize, loiter_s: f64 },
}

/// A WGS-84 position in degrees. Always within the valid latitude and
/// longitude ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoPointRepr")]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct GeoPointRepr {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<GeoPointRepr> for GeoPoint {
    type Error = GeoError;

    fn try_from(repr: GeoPointRepr) -> Result<Self, Self::Error> {
        GeoPoint::new(repr.latitude, repr.longitude)
    }
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }

        if !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }

        Ok(GeoPoint {
            latitude,
            longitude,
        })
    }

    /// Latitude in degrees
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Parses `lat,lon` in degrees.
impl FromStr for GeoPoint {
    type Err = ParsePointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s.split_once(',').ok_or(ParsePointError::MissingComma)?;
        let lat = lat.trim().parse::<f64>()?;
        let lon = lon.trim().parse::<f64>()?;
        Ok(GeoPoint::new(lat, lon)?)
    }
}

impl From<GeoPoint> for geo::Point<f64> {
    fn from(p: GeoPoint) -> Self {
        geo::Point::new(p.longitude, p.latitude)
    }
}

impl TryFrom<geo::Point<f64>> for GeoPoint {
    type Error = GeoError;

    fn try_from(p: geo::Point<f64>) -> Result<Self, Self::Error> {
        GeoPoint::new(p.y(), p.x())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraAction {
    #[default]
    None,
    TakePhoto,
    StartVideo,
    StopVideo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub position: GeoPoint,

    /// Altitude in meters above the launch point
    pub altitude_rel_m: f64,

    /// Target ground speed in meters per second
    pub speed_m_s: f64,

    /// Whether the vehicle flies through the waypoint instead of stopping and
    /// holding there
    pub fly_through: bool,

    pub camera_action: CameraAction,

    /// Seconds to hold at the waypoint, ignored when flying through
    pub loiter_s: f64,
}

impl Waypoint {
    /// Seconds the autopilot should hold at this waypoint.
    pub fn hold_s(&self) -> f64 {
        if self.fly_through {
            0.0
        } else {
            self.loiter_s
        }
    }
}

/// An ordered list of waypoints, flown in sequence. A plan is never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionPlan {
    waypoints: Vec<Waypoint>,
}

impl MissionPlan {
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self, PlanError> {
        if waypoints.is_empty() {
            return Err(PlanError::Empty);
        }

        for (index, wp) in waypoints.iter().enumerate() {
            if !(wp.altitude_rel_m > 0.0) {
                return Err(PlanError::InvalidAltitude {
                    index,
                    altitude_m: wp.altitude_rel_m,
                });
            }

            if !(wp.speed_m_s > 0.0) {
                return Err(PlanError::InvalidSpeed {
                    index,
                    speed_m_s: wp.speed_m_s,
                });
            }

            if !(wp.loiter_s >= 0.0) {
                return Err(PlanError::InvalidLoiter {
                    index,
                    loiter_s: wp.loiter_s,
                });
            }
        }

        Ok(MissionPlan { waypoints })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn waypoint(latitude: f64, longitude: f64) -> Waypoint {
        Waypoint {
            position: GeoPoint::new(latitude, longitude).unwrap(),
            altitude_rel_m: 20.0,
            speed_m_s: 5.0,
            fly_through: true,
            camera_action: CameraAction::None,
            loiter_s: 0.0,
        }
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert_eq!(
            GeoPoint::new(90.5, 0.0),
            Err(GeoError::InvalidLatitude(90.5))
        );
        assert_eq!(
            GeoPoint::new(0.0, -180.1),
            Err(GeoError::InvalidLongitude(-180.1))
        );
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn parses_lat_lon_pairs() {
        let p: GeoPoint = "51.5074, -0.1278".parse().unwrap();
        assert_eq!(p.latitude(), 51.5074);
        assert_eq!(p.longitude(), -0.1278);

        assert_eq!(
            "51.5074".parse::<GeoPoint>(),
            Err(ParsePointError::MissingComma)
        );
        assert!(matches!(
            "north,west".parse::<GeoPoint>(),
            Err(ParsePointError::InvalidCoord(_))
        ));
        assert!(matches!(
            "95,0".parse::<GeoPoint>(),
            Err(ParsePointError::OutOfRange(_))
        ));
    }

    #[test]
    fn deserializing_checks_ranges() {
        let ok: GeoPoint =
            serde_json::from_str(r#"{"latitude": 47.39, "longitude": 8.54}"#).unwrap();
        assert_eq!(ok, GeoPoint::new(47.39, 8.54).unwrap());

        let bad = serde_json::from_str::<GeoPoint>(r#"{"latitude": 147.0, "longitude": 8.54}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn geo_point_uses_lon_as_x() {
        let p = GeoPoint::new(47.0, 8.0).unwrap();
        let g: geo::Point<f64> = p.into();
        assert_eq!(g.x(), 8.0);
        assert_eq!(g.y(), 47.0);
        assert_eq!(GeoPoint::try_from(g), Ok(p));
    }

    #[test]
    fn plan_validation() {
        assert_eq!(MissionPlan::new(vec![]), Err(PlanError::Empty));

        let mut low = waypoint(47.0, 8.0);
        low.altitude_rel_m = 0.0;
        assert!(matches!(
            MissionPlan::new(vec![waypoint(47.0, 8.0), low]),
            Err(PlanError::InvalidAltitude { index: 1, .. })
        ));

        let mut stopped = waypoint(47.0, 8.0);
        stopped.speed_m_s = -1.0;
        assert!(matches!(
            MissionPlan::new(vec![stopped]),
            Err(PlanError::InvalidSpeed { index: 0, .. })
        ));

        let plan = MissionPlan::new(vec![waypoint(47.0, 8.0), waypoint(47.1, 8.1)]).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.get(1).unwrap().position.latitude(), 47.1);
        assert!(plan.get(2).is_none());
    }

    #[test]
    fn hold_time_ignores_loiter_when_flying_through() {
        let mut wp = waypoint(47.0, 8.0);
        wp.loiter_s = 5.0;
        assert_eq!(wp.hold_s(), 0.0);
        wp.fly_through = false;
        assert_eq!(wp.hold_s(), 5.0);
    }
}
