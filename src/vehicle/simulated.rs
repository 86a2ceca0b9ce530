//! A vehicle without an autopilot. Each tick it covers a fixed fraction of the
//! remaining distance to its target, so it closes in geometrically and counts
//! as arrived once it is inside the arrival threshold.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{select, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uom::si::{f64::Length, length::meter};

use super::{wait_for_state, MissionIndex, Vehicle, VehicleState};
use crate::{
    geodesic,
    state::{GeoPoint, MissionPlan},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Time between motion updates, in milliseconds
    pub tick_ms: u64,

    /// Fraction of the remaining distance covered per tick
    pub step_fraction: f64,

    /// Distance from a waypoint at which it counts as reached, in meters
    pub arrival_threshold_m: f64,

    /// Distance from the launch point at which the return counts as done, in
    /// meters
    pub return_arrival_threshold_m: f64,

    /// Where the vehicle takes off when the caller does not say
    pub launch: Option<GeoPoint>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        SimulatedConfig {
            tick_ms: 500,
            step_fraction: 0.1,
            arrival_threshold_m: 100.0,
            return_arrival_threshold_m: 100.0,
            launch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Mission,
    Return,
}

pub struct SimulatedVehicle {
    config: SimulatedConfig,
    launch: GeoPoint,
    state_tx: Arc<watch::Sender<VehicleState>>,
    state_rx: watch::Receiver<VehicleState>,
    targets: Option<Vec<GeoPoint>>,
    motion: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SimulatedVehicle {
    pub fn new(config: SimulatedConfig, launch: GeoPoint) -> Self {
        let (state_tx, state_rx) = watch::channel(VehicleState::default());

        SimulatedVehicle {
            config,
            launch,
            state_tx: Arc::new(state_tx),
            state_rx,
            targets: None,
            motion: None,
        }
    }

    fn fly(&mut self, leg: Leg, targets: Vec<GeoPoint>, threshold_m: f64) {
        self.stop_motion();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fly_legs(
            self.state_tx.clone(),
            leg,
            targets,
            Length::new::<meter>(threshold_m),
            Duration::from_millis(self.config.tick_ms),
            self.config.step_fraction,
            cancel.clone(),
        ));

        self.motion = Some((cancel, handle));
    }

    fn stop_motion(&mut self) {
        if let Some((cancel, _)) = self.motion.take() {
            cancel.cancel();
        }
    }

    fn require_connected(&self) -> anyhow::Result<()> {
        if !self.state_rx.borrow().connected {
            bail!("simulated vehicle is not connected");
        }
        Ok(())
    }
}

impl Drop for SimulatedVehicle {
    fn drop(&mut self) {
        self.stop_motion();
    }
}

/// Brings a longitude difference or sum back into [-180, 180).
fn wrap_longitude(degrees: f64) -> f64 {
    (degrees + 180.0).rem_euclid(360.0) - 180.0
}

/// Moves `fraction` of the way from `from` to `to`, interpolating the
/// coordinates linearly. Longitude goes the short way, across the
/// antimeridian if that is closer.
pub fn step_toward(from: GeoPoint, to: GeoPoint, fraction: f64) -> GeoPoint {
    let from_pt: geo::Point<f64> = from.into();
    let to_pt: geo::Point<f64> = to.into();

    let delta = to_pt - from_pt;
    let delta = geo::Point::new(wrap_longitude(delta.x()), delta.y());
    let next = from_pt + delta * fraction;
    let next = geo::Point::new(wrap_longitude(next.x()), next.y());

    // interpolating between two valid points stays in range up to rounding
    GeoPoint::try_from(next).unwrap_or(to)
}

async fn fly_legs(
    state_tx: Arc<watch::Sender<VehicleState>>,
    leg: Leg,
    targets: Vec<GeoPoint>,
    threshold: Length,
    tick: Duration,
    fraction: f64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for (index, target) in targets.iter().copied().enumerate() {
        if leg == Leg::Mission {
            state_tx.send_modify(|s| s.advance_to(MissionIndex::Active(index)));
        }

        trace!("simulated vehicle heading to {target}");

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let position = match state_tx.borrow().position {
                Some(position) => position,
                None => {
                    warn!("simulated vehicle has no position, stopping motion");
                    return;
                }
            };

            if geodesic::distance(position, target) < threshold {
                debug!("simulated vehicle arrived at {target}");
                break;
            }

            let next = step_toward(position, target, fraction);
            state_tx.send_modify(|s| s.record_position(next));
        }
    }

    state_tx.send_modify(|s| match leg {
        Leg::Mission => s.advance_to(MissionIndex::Finished),
        Leg::Return => {
            s.returned = true;
            s.armed = false;
        }
    });
}

#[async_trait]
impl Vehicle for SimulatedVehicle {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn state(&self) -> watch::Receiver<VehicleState> {
        self.state_rx.clone()
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        let launch = self.launch;
        self.state_tx.send_modify(|s| {
            s.connected = true;
            s.position = Some(launch);
            s.home = Some(launch);
        });

        info!("simulated vehicle connected at {launch}");
        Ok(())
    }

    async fn await_ready(&mut self) -> anyhow::Result<()> {
        self.require_connected()?;
        self.state_tx.send_modify(|s| {
            s.global_position_ok = true;
            s.home_position_ok = true;
        });
        Ok(())
    }

    async fn upload_plan(&mut self, plan: &MissionPlan) -> anyhow::Result<()> {
        self.require_connected()?;

        let targets: Vec<GeoPoint> = plan.waypoints().iter().map(|wp| wp.position).collect();
        let len = targets.len();
        self.targets = Some(targets);
        self.state_tx.send_modify(|s| s.mission_len = len);

        debug!("simulated vehicle accepted a plan with {len} waypoints");
        Ok(())
    }

    async fn arm(&mut self) -> anyhow::Result<()> {
        self.require_connected()?;
        self.state_tx.send_modify(|s| s.armed = true);
        Ok(())
    }

    async fn start_mission(&mut self) -> anyhow::Result<()> {
        if !self.state_rx.borrow().armed {
            bail!("simulated vehicle is not armed");
        }

        let targets = self
            .targets
            .clone()
            .context("no mission has been uploaded")?;

        let threshold_m = self.config.arrival_threshold_m;
        self.fly(Leg::Mission, targets, threshold_m);
        Ok(())
    }

    async fn is_finished(&mut self) -> anyhow::Result<bool> {
        Ok(self.state_rx.borrow().is_finished())
    }

    async fn return_to_launch(&mut self) -> anyhow::Result<()> {
        self.require_connected()?;

        let home = self.state_rx.borrow().home.unwrap_or(self.launch);
        let threshold_m = self.config.return_arrival_threshold_m;
        self.fly(Leg::Return, vec![home], threshold_m);

        info!("simulated vehicle returning to {home}");
        Ok(())
    }

    async fn await_returned(&mut self) -> anyhow::Result<()> {
        let mut rx = self.state_rx.clone();
        wait_for_state(&mut rx, |s| s.returned).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.stop_motion();
        self.state_tx.send_modify(|s| s.connected = false);
        Ok(())
    }
}
