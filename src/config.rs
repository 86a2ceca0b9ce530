use std::path::Path;

use anyhow::{bail, Context};
use config::{Config, ConfigError};
use serde::Deserialize;

use crate::{
    geocode::GeocoderConfig,
    monitor::MonitorConfig,
    policy::DeliveryConstraint,
    state::{CameraAction, GeoPoint, MissionPlan, Waypoint},
    supervisor::SupervisorConfig,
    vehicle::VehicleConfig,
};

/// Flight parameters for waypoints built from bare coordinates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaypointDefaults {
    pub altitude_m: f64,
    pub speed_m_s: f64,
    pub fly_through: bool,
    pub loiter_s: f64,
    pub camera_action: CameraAction,
}

impl Default for WaypointDefaults {
    fn default() -> Self {
        WaypointDefaults {
            altitude_m: 20.0,
            speed_m_s: 10.4,
            fly_through: true,
            loiter_s: 0.0,
            camera_action: CameraAction::None,
        }
    }
}

impl WaypointDefaults {
    pub fn waypoint_at(&self, position: GeoPoint) -> Waypoint {
        Waypoint {
            position,
            altitude_rel_m: self.altitude_m,
            speed_m_s: self.speed_m_s,
            fly_through: self.fly_through,
            camera_action: self.camera_action,
            loiter_s: self.loiter_s,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliverySystemConfig {
    pub constraint: DeliveryConstraint,
    pub supervisor: SupervisorConfig,
    pub monitor: MonitorConfig,
    pub waypoint: WaypointDefaults,
    pub vehicle: VehicleConfig,
    pub geocoder: GeocoderConfig,
}

impl DeliverySystemConfig {
    /// Reads the config file at `path` if there is one, then applies
    /// `DELIVERY_*` environment overrides (`__` separates nested keys).
    pub fn read(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        if let Some(path) = path {
            c.merge(config::File::from(path))?;
        }

        c.merge(config::Environment::with_prefix("DELIVERY").separator("__"))?;

        c.try_into()
    }

    /// Rejects values that would make a mission meaningless.
    pub fn check(&self) -> anyhow::Result<()> {
        let constraint = &self.constraint;

        if constraint.max_range_km <= 0.0 {
            bail!("constraint.max_range_km must be positive");
        }
        if constraint.cruise_speed_kmh <= 0.0 {
            bail!("constraint.cruise_speed_kmh must be positive");
        }
        if constraint.target_minutes <= 0.0 {
            bail!("constraint.target_minutes must be positive");
        }

        let sim = &self.vehicle.simulated;
        if !(sim.step_fraction > 0.0 && sim.step_fraction <= 1.0) {
            bail!("vehicle.simulated.step_fraction must be in (0, 1]");
        }
        if sim.tick_ms == 0 {
            bail!("vehicle.simulated.tick_ms must be positive");
        }
        if sim.arrival_threshold_m <= 0.0 || sim.return_arrival_threshold_m <= 0.0 {
            bail!("vehicle.simulated arrival thresholds must be positive");
        }

        if self.supervisor.finish_poll_interval_ms == 0 || self.monitor.proximity_interval_ms == 0
        {
            bail!("poll intervals must be positive");
        }

        // a plan built from the defaults has to be valid on its own
        let origin = GeoPoint::new(0.0, 0.0).context("invalid origin")?;
        MissionPlan::new(vec![self.waypoint.waypoint_at(origin)])
            .context("invalid waypoint defaults")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::vehicle::VehicleKind;

    #[test]
    fn missing_file_means_defaults() {
        let config = DeliverySystemConfig::read(None).unwrap();
        assert_eq!(config.constraint, DeliveryConstraint::default());
        assert_eq!(config.vehicle.kind, VehicleKind::Simulated);
        assert_eq!(config.monitor.proximity_interval_ms, 500);
        config.check().unwrap();
    }

    #[test]
    fn reads_nested_sections() {
        let path = std::env::temp_dir().join(format!("delivery-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[constraint]
max_range_km = 8.0

[supervisor]
lock_timeout_s = 10

[vehicle]
kind = "pixhawk"

[vehicle.simulated]
arrival_threshold_m = 50.0

[vehicle.pixhawk]
address = "127.0.0.1:14550"
mavlink = "V1"
"#
        )
        .unwrap();
        drop(file);

        let config = DeliverySystemConfig::read(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.constraint.max_range_km, 8.0);
        assert_eq!(config.constraint.cruise_speed_kmh, 37.5);
        assert_eq!(config.supervisor.lock_timeout_s, 10);
        assert_eq!(config.vehicle.kind, VehicleKind::Pixhawk);
        assert_eq!(config.vehicle.simulated.arrival_threshold_m, 50.0);
        assert_eq!(config.vehicle.simulated.return_arrival_threshold_m, 100.0);
        assert_eq!(config.vehicle.pixhawk.address.port(), 14550);
        assert_eq!(config.vehicle.pixhawk.mavlink, "V1");
    }

    #[test]
    fn check_rejects_nonsense() {
        let mut config = DeliverySystemConfig::default();
        config.vehicle.simulated.step_fraction = 0.0;
        assert!(config.check().is_err());

        let mut config = DeliverySystemConfig::default();
        config.waypoint.speed_m_s = -1.0;
        assert!(config.check().is_err());
    }

    #[test]
    fn defaults_build_waypoints() {
        let defaults = WaypointDefaults::default();
        let position = GeoPoint::new(51.5, -0.12).unwrap();
        let wp = defaults.waypoint_at(position);
        assert_eq!(wp.position, position);
        assert_eq!(wp.altitude_rel_m, 20.0);
        assert!(wp.fly_through);
    }
}
