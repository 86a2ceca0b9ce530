//! The narrow command surface the supervisor uses to fly a vehicle.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::state::{GeoPoint, MissionPlan};

mod interface;
pub mod pixhawk;
pub mod simulated;
mod state;

pub use pixhawk::{PixhawkConfig, PixhawkVehicle};
pub use simulated::{SimulatedConfig, SimulatedVehicle};
pub use state::*;

/// A real or simulated vehicle. The implementation is the only writer of its
/// [`VehicleState`]; everyone else reads it through [`Vehicle::state`].
#[async_trait]
pub trait Vehicle: Send {
    fn name(&self) -> &'static str;

    /// Live view of the vehicle state. Every position and progress update is
    /// published here.
    fn state(&self) -> watch::Receiver<VehicleState>;

    fn position(&self) -> Option<GeoPoint> {
        self.state().borrow().position
    }

    fn progress(&self) -> MissionIndex {
        self.state().borrow().mission_index
    }

    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Resolves once the global position and home position estimates are both
    /// healthy.
    async fn await_ready(&mut self) -> anyhow::Result<()>;

    async fn upload_plan(&mut self, plan: &MissionPlan) -> anyhow::Result<()>;

    async fn arm(&mut self) -> anyhow::Result<()>;

    async fn start_mission(&mut self) -> anyhow::Result<()>;

    /// True once the last waypoint has been reached. Never goes back to false.
    async fn is_finished(&mut self) -> anyhow::Result<bool>;

    async fn return_to_launch(&mut self) -> anyhow::Result<()>;

    /// Resolves once the vehicle is back at its launch point.
    async fn await_returned(&mut self) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleKind {
    #[default]
    Simulated,
    Pixhawk,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub kind: VehicleKind,
    pub simulated: SimulatedConfig,
    pub pixhawk: PixhawkConfig,
}

/// Builds the vehicle selected by `config`. The simulated vehicle takes off
/// from `launch`, falling back to the configured launch point.
pub fn create_vehicle(
    config: &VehicleConfig,
    launch: Option<GeoPoint>,
) -> anyhow::Result<Box<dyn Vehicle>> {
    match config.kind {
        VehicleKind::Simulated => {
            let launch = launch
                .or(config.simulated.launch)
                .context("the simulated vehicle needs a launch point")?;
            Ok(Box::new(SimulatedVehicle::new(config.simulated.clone(), launch)))
        }
        VehicleKind::Pixhawk => Ok(Box::new(PixhawkVehicle::new(config.pixhawk.clone())?)),
    }
}

/// Waits until the state satisfies `predicate`, returning that state.
pub(crate) async fn wait_for_state<F: Fn(&VehicleState) -> bool>(
    rx: &mut watch::Receiver<VehicleState>,
    predicate: F,
) -> anyhow::Result<VehicleState> {
    loop {
        {
            let state = rx.borrow_and_update();
            if predicate(&state) {
                return Ok(state.clone());
            }
        }

        rx.changed()
            .await
            .context("vehicle state publisher went away")?;
    }
}
