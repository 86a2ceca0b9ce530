//! The mission state machine. One supervisor flies one plan: it connects,
//! waits for a position lock, validates the delivery, uploads and starts the
//! mission, watches it with the telemetry monitors and brings the vehicle
//! home.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    select,
    sync::watch,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{DynSink, MissionEvent},
    monitor::{MonitorConfig, Monitors},
    policy::{self, DeliveryConstraint, PolicyRejection},
    state::{GeoPoint, MissionPlan},
    vehicle::Vehicle,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionPhase {
    Idle,
    Connecting,
    AwaitingLock,
    Validating,
    Uploading,
    Armed,
    Executing,
    ReturningToLaunch,
    Completed,
    RejectedByPolicy,
    Aborted,
}

impl MissionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionPhase::Completed | MissionPhase::RejectedByPolicy | MissionPhase::Aborted
        )
    }

    pub fn can_transition_to(self, next: MissionPhase) -> bool {
        use MissionPhase::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, AwaitingLock)
                | (AwaitingLock, Validating)
                | (Validating, Uploading)
                | (Validating, RejectedByPolicy)
                | (Uploading, Armed)
                | (Armed, Executing)
                | (Executing, ReturningToLaunch)
                | (ReturningToLaunch, Completed)
                | (
                    Connecting
                        | AwaitingLock
                        | Validating
                        | Uploading
                        | Armed
                        | Executing
                        | ReturningToLaunch,
                    Aborted
                )
        )
    }

    /// How bad an abort in this phase is: once the mission has started the
    /// vehicle is somewhere in the air.
    pub fn abort_severity(self) -> AbortSeverity {
        match self {
            MissionPhase::Executing | MissionPhase::ReturningToLaunch => AbortSeverity::InFlight,
            _ => AbortSeverity::BeforeCommitment,
        }
    }
}

impl fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissionPhase::Idle => "idle",
            MissionPhase::Connecting => "connecting",
            MissionPhase::AwaitingLock => "awaiting lock",
            MissionPhase::Validating => "validating",
            MissionPhase::Uploading => "uploading",
            MissionPhase::Armed => "armed",
            MissionPhase::Executing => "executing",
            MissionPhase::ReturningToLaunch => "returning to launch",
            MissionPhase::Completed => "completed",
            MissionPhase::RejectedByPolicy => "rejected by policy",
            MissionPhase::Aborted => "aborted",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub connect_timeout_s: u64,
    pub lock_timeout_s: u64,
    /// How often to ask the vehicle whether the mission is finished
    pub finish_poll_interval_ms: u64,
    /// Upper bound on the outbound flight, unlimited if unset
    pub mission_timeout_s: Option<u64>,
    pub return_timeout_s: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            connect_timeout_s: 30,
            lock_timeout_s: 120,
            finish_poll_interval_ms: 1000,
            mission_timeout_s: Some(1800),
            return_timeout_s: 900,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    #[error("timed out connecting to the vehicle")]
    ConnectionTimeout,
    #[error("timed out waiting for a position and home lock")]
    LockTimeout,
    #[error("{operation} failed while {phase}: {message}")]
    FacadeFailure {
        phase: MissionPhase,
        operation: &'static str,
        message: String,
    },
    #[error("mission did not finish in time")]
    MissionTimeout,
    #[error("vehicle did not return in time")]
    ReturnTimeout,
    #[error("cancelled by operator")]
    Cancelled,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortSeverity {
    /// The mission never started; the vehicle can be power-cycled safely.
    BeforeCommitment,
    /// The vehicle may be airborne.
    InFlight,
}

impl fmt::Display for AbortSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortSeverity::BeforeCommitment => f.write_str("before commitment"),
            AbortSeverity::InFlight => f.write_str("in flight"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct MissionMetrics {
    pub elapsed_s: f64,
    pub distance_travelled_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MissionOutcome {
    Completed {
        metrics: MissionMetrics,
    },
    RejectedByPolicy {
        reason: PolicyRejection,
        metrics: MissionMetrics,
    },
    /// The vehicle needs manual recovery.
    Aborted {
        reason: AbortReason,
        severity: AbortSeverity,
        last_known_position: Option<GeoPoint>,
        metrics: MissionMetrics,
    },
}

impl MissionOutcome {
    pub fn phase(&self) -> MissionPhase {
        match self {
            MissionOutcome::Completed { .. } => MissionPhase::Completed,
            MissionOutcome::RejectedByPolicy { .. } => MissionPhase::RejectedByPolicy,
            MissionOutcome::Aborted { .. } => MissionPhase::Aborted,
        }
    }

    pub fn metrics(&self) -> &MissionMetrics {
        match self {
            MissionOutcome::Completed { metrics }
            | MissionOutcome::RejectedByPolicy { metrics, .. }
            | MissionOutcome::Aborted { metrics, .. } => metrics,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, MissionOutcome::Completed { .. })
    }
}

/// Why a phase ended early.
enum Stop {
    Rejected(PolicyRejection),
    Abort(AbortReason),
}

impl From<AbortReason> for Stop {
    fn from(reason: AbortReason) -> Self {
        Stop::Abort(reason)
    }
}

/// Runs `fut` until it completes, the time limit runs out or `cancel` fires.
async fn guard<T, F>(
    cancel: &CancellationToken,
    limit: Option<(Duration, AbortReason)>,
    phase: MissionPhase,
    operation: &'static str,
    fut: F,
) -> Result<T, AbortReason>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let work = async move {
        let res = match limit {
            Some((limit, on_timeout)) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => return Err(on_timeout),
            },
            None => fut.await,
        };

        res.map_err(|err| AbortReason::FacadeFailure {
            phase,
            operation,
            message: format!("{:#}", err),
        })
    };

    select! {
        biased;
        _ = cancel.cancelled() => Err(AbortReason::Cancelled),
        res = work => res,
    }
}

async fn poll_until_finished(vehicle: &mut dyn Vehicle, period: Duration) -> anyhow::Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if vehicle.is_finished().await? {
            return Ok(());
        }
    }
}

pub struct MissionSupervisor {
    vehicle: Box<dyn Vehicle>,
    constraint: DeliveryConstraint,
    config: SupervisorConfig,
    monitor_config: MonitorConfig,
    sink: DynSink,
    cancel: CancellationToken,
    phase: MissionPhase,
    phase_tx: watch::Sender<MissionPhase>,
}

impl MissionSupervisor {
    pub fn new(
        vehicle: Box<dyn Vehicle>,
        constraint: DeliveryConstraint,
        config: SupervisorConfig,
        monitor_config: MonitorConfig,
        sink: DynSink,
    ) -> Self {
        let (phase_tx, _) = watch::channel(MissionPhase::Idle);

        MissionSupervisor {
            vehicle,
            constraint,
            config,
            monitor_config,
            sink,
            cancel: CancellationToken::new(),
            phase: MissionPhase::Idle,
            phase_tx,
        }
    }

    /// Cancelling this token aborts the mission at the next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> MissionPhase {
        self.phase
    }

    /// Follows the phase while [`run`](Self::run) is in progress.
    pub fn watch_phase(&self) -> watch::Receiver<MissionPhase> {
        self.phase_tx.subscribe()
    }

    fn transition(&mut self, to: MissionPhase) {
        let from = self.phase;
        debug_assert!(
            from.can_transition_to(to),
            "illegal phase transition {from} -> {to}"
        );

        self.phase = to;
        self.phase_tx.send_replace(to);
        self.sink.emit(&MissionEvent::PhaseChanged { from, to });
    }

    /// Flies `plan` and reports how it ended. Mission failures are part of the
    /// outcome, never an error.
    pub async fn run(mut self, plan: MissionPlan) -> MissionOutcome {
        let started = Instant::now();
        let plan = Arc::new(plan);

        let res = self.fly(plan).await;

        let metrics = MissionMetrics {
            elapsed_s: started.elapsed().as_secs_f64(),
            distance_travelled_m: self.vehicle.state().borrow().odometer_m,
        };

        let outcome = match res {
            Ok(()) => MissionOutcome::Completed { metrics },
            Err(Stop::Rejected(reason)) => MissionOutcome::RejectedByPolicy { reason, metrics },
            Err(Stop::Abort(reason)) => {
                let severity = self.phase.abort_severity();
                let last_known_position = self.vehicle.position();
                self.transition(MissionPhase::Aborted);

                MissionOutcome::Aborted {
                    reason,
                    severity,
                    last_known_position,
                    metrics,
                }
            }
        };

        if let Err(err) = self.vehicle.disconnect().await {
            warn!("failed to disconnect from {} vehicle: {:#}", self.vehicle.name(), err);
        }

        self.sink.emit(&MissionEvent::Finished {
            outcome: outcome.clone(),
        });

        outcome
    }

    async fn fly(&mut self, plan: Arc<MissionPlan>) -> Result<(), Stop> {
        let config = self.config.clone();
        let secs = Duration::from_secs;

        self.transition(MissionPhase::Connecting);
        guard(
            &self.cancel,
            Some((secs(config.connect_timeout_s), AbortReason::ConnectionTimeout)),
            MissionPhase::Connecting,
            "connect",
            self.vehicle.connect(),
        )
        .await?;

        self.transition(MissionPhase::AwaitingLock);
        guard(
            &self.cancel,
            Some((secs(config.lock_timeout_s), AbortReason::LockTimeout)),
            MissionPhase::AwaitingLock,
            "await position lock",
            self.vehicle.await_ready(),
        )
        .await?;

        self.transition(MissionPhase::Validating);
        self.validate(&plan)?;

        self.transition(MissionPhase::Uploading);
        guard(
            &self.cancel,
            None,
            MissionPhase::Uploading,
            "upload mission",
            self.vehicle.upload_plan(&plan),
        )
        .await?;

        self.transition(MissionPhase::Armed);
        guard(
            &self.cancel,
            None,
            MissionPhase::Armed,
            "arm",
            self.vehicle.arm(),
        )
        .await?;

        self.transition(MissionPhase::Executing);
        guard(
            &self.cancel,
            None,
            MissionPhase::Executing,
            "start mission",
            self.vehicle.start_mission(),
        )
        .await?;

        let monitors = Monitors::start(
            &self.monitor_config,
            self.vehicle.state(),
            plan.clone(),
            self.sink.clone(),
            self.cancel.child_token(),
        );

        let finished = guard(
            &self.cancel,
            config
                .mission_timeout_s
                .map(|limit| (secs(limit), AbortReason::MissionTimeout)),
            MissionPhase::Executing,
            "poll mission progress",
            poll_until_finished(
                &mut *self.vehicle,
                Duration::from_millis(config.finish_poll_interval_ms),
            ),
        )
        .await;

        monitors.cancel();
        monitors.join().await;
        finished?;

        self.transition(MissionPhase::ReturningToLaunch);
        guard(
            &self.cancel,
            None,
            MissionPhase::ReturningToLaunch,
            "return to launch",
            self.vehicle.return_to_launch(),
        )
        .await?;

        guard(
            &self.cancel,
            Some((secs(config.return_timeout_s), AbortReason::ReturnTimeout)),
            MissionPhase::ReturningToLaunch,
            "await return",
            self.vehicle.await_returned(),
        )
        .await?;

        self.transition(MissionPhase::Completed);
        Ok(())
    }

    fn validate(&mut self, plan: &MissionPlan) -> Result<(), Stop> {
        let origin = {
            let state = self.vehicle.state();
            let state = state.borrow();
            state.home.or(state.position)
        };

        let origin = origin.ok_or_else(|| AbortReason::FacadeFailure {
            phase: MissionPhase::Validating,
            operation: "read home position",
            message: "vehicle reported a lock but no home position".to_owned(),
        })?;

        match policy::validate_plan(origin, plan, &self.constraint) {
            Ok(verdict) => {
                self.sink.emit(&MissionEvent::PolicyAccepted {
                    route_km: verdict.route_km(),
                    eta_minutes: verdict.eta_minutes(),
                    status: verdict.status,
                });
                Ok(())
            }
            Err(reason) => {
                self.sink.emit(&MissionEvent::PolicyRejected {
                    reason: reason.clone(),
                });
                self.transition(MissionPhase::RejectedByPolicy);
                Err(Stop::Rejected(reason))
            }
        }
    }
}
