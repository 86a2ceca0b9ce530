//! Read-only observers that report mission progress while the vehicle flies.
//!
//! Monitors never touch mission or vehicle state and never fail the mission:
//! a bad reading is reported and the monitor carries on with the next one.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use uom::si::length::meter;

use crate::{
    event::{DynSink, MissionEvent},
    geodesic,
    state::MissionPlan,
    task::{spawn_task, Task},
    vehicle::{MissionIndex, VehicleState},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between proximity readings, in milliseconds
    pub proximity_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            proximity_interval_ms: 500,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("vehicle has no position fix")]
    NoPosition,
    #[error("active waypoint {0} is not part of the plan")]
    UnknownWaypoint(usize),
}

/// Reports every change of the active waypoint.
pub struct ProgressMonitor {
    state_rx: watch::Receiver<VehicleState>,
    total: usize,
    sink: DynSink,
}

impl ProgressMonitor {
    pub fn new(state_rx: watch::Receiver<VehicleState>, total: usize, sink: DynSink) -> Self {
        ProgressMonitor {
            state_rx,
            total,
            sink,
        }
    }
}

#[async_trait]
impl Task for ProgressMonitor {
    fn name(&self) -> &'static str {
        "monitor/progress"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            state_rx,
            total,
            sink,
        } = *self;

        let mut states = WatchStream::new(state_rx);
        let mut last = MissionIndex::NotStarted;

        loop {
            let state = select! {
                biased;
                _ = cancel.cancelled() => break,
                state = states.next() => state,
            };

            let index = match state {
                Some(state) => state.mission_index,
                None => {
                    warn!("vehicle state stream closed, progress monitor stopping");
                    break;
                }
            };

            if index == last {
                continue;
            }
            last = index;

            match index {
                MissionIndex::NotStarted => {}
                MissionIndex::Active(current) => {
                    sink.emit(&MissionEvent::Progress { current, total })
                }
                MissionIndex::Finished => sink.emit(&MissionEvent::Progress {
                    current: total,
                    total,
                }),
            }
        }

        Ok(())
    }
}

/// Periodically reports the distance from the vehicle to the active waypoint.
pub struct ProximityMonitor {
    state_rx: watch::Receiver<VehicleState>,
    plan: Arc<MissionPlan>,
    period: Duration,
    sink: DynSink,
}

impl ProximityMonitor {
    pub fn new(
        state_rx: watch::Receiver<VehicleState>,
        plan: Arc<MissionPlan>,
        period: Duration,
        sink: DynSink,
    ) -> Self {
        ProximityMonitor {
            state_rx,
            plan,
            period,
            sink,
        }
    }

    /// One reading. `None` when no waypoint is active.
    fn sample(&self) -> Result<Option<(usize, f64)>, MonitorError> {
        let state = self.state_rx.borrow();

        let index = match state.mission_index {
            MissionIndex::Active(index) => index,
            _ => return Ok(None),
        };

        let waypoint = self
            .plan
            .get(index)
            .ok_or(MonitorError::UnknownWaypoint(index))?;
        let position = state.position.ok_or(MonitorError::NoPosition)?;

        let distance = geodesic::distance(position, waypoint.position);
        Ok(Some((index, distance.get::<meter>())))
    }
}

#[async_trait]
impl Task for ProximityMonitor {
    fn name(&self) -> &'static str {
        "monitor/proximity"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sample() {
                Ok(Some((waypoint, distance_m))) => self.sink.emit(&MissionEvent::Proximity {
                    waypoint,
                    distance_m,
                }),
                Ok(None) => {}
                Err(err) => {
                    debug!("proximity reading failed: {err}");
                    self.sink.emit(&MissionEvent::MonitorReadFailure {
                        monitor: "proximity",
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Both monitors, running for the duration of one mission.
pub struct Monitors {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Monitors {
    pub fn start(
        config: &MonitorConfig,
        state_rx: watch::Receiver<VehicleState>,
        plan: Arc<MissionPlan>,
        sink: DynSink,
        cancel: CancellationToken,
    ) -> Self {
        let progress = ProgressMonitor::new(state_rx.clone(), plan.len(), sink.clone());
        let proximity = ProximityMonitor::new(
            state_rx,
            plan,
            Duration::from_millis(config.proximity_interval_ms),
            sink,
        );

        let handles = vec![
            spawn_task(Box::new(progress), cancel.clone()),
            spawn_task(Box::new(proximity), cancel.clone()),
        ];

        Monitors { cancel, handles }
    }

    /// Stops both monitors without waiting for them. A reading already in
    /// progress finishes, but no new one starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the monitors and waits for them to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!("monitor task panicked: {err}");
            }
        }
    }
}

impl Drop for Monitors {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
