//! Structured events emitted by the supervisor and the telemetry monitors,
//! and the sinks that consume them.

use std::{fs::File, io::Write, path::Path, sync::Arc};

use anyhow::Context;
use serde::Serialize;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

use crate::{
    policy::{EtaStatus, PolicyRejection},
    supervisor::{MissionOutcome, MissionPhase},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MissionEvent {
    PhaseChanged {
        from: MissionPhase,
        to: MissionPhase,
    },
    PolicyAccepted {
        route_km: f64,
        eta_minutes: f64,
        status: EtaStatus,
    },
    PolicyRejected {
        reason: PolicyRejection,
    },
    /// The active waypoint changed. `current == total` once the last waypoint
    /// has been reached.
    Progress {
        current: usize,
        total: usize,
    },
    Proximity {
        waypoint: usize,
        distance_m: f64,
    },
    MonitorReadFailure {
        monitor: &'static str,
        reason: String,
    },
    Finished {
        outcome: MissionOutcome,
    },
}

/// Receives mission events. Emitting must never block for long, since the
/// monitors and the supervisor call it inline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MissionEvent);
}

pub type DynSink = Arc<dyn EventSink>;

/// Renders events as human-readable log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &MissionEvent) {
        match event {
            MissionEvent::PhaseChanged { from, to } => info!("mission phase: {from} -> {to}"),
            MissionEvent::PolicyAccepted {
                route_km,
                eta_minutes,
                status,
            } => match status {
                EtaStatus::WithinTarget => info!(
                    "delivery accepted: {route_km:.2} km, eta {eta_minutes:.1} min meets the target"
                ),
                EtaStatus::EtaExceeded => warn!(
                    "delivery accepted: {route_km:.2} km, eta {eta_minutes:.1} min exceeds the target"
                ),
            },
            MissionEvent::PolicyRejected { reason } => warn!("delivery not allowed: {reason}"),
            MissionEvent::Progress { current, total } => {
                info!("mission progress: {current}/{total}")
            }
            MissionEvent::Proximity {
                waypoint,
                distance_m,
            } => info!("distance to waypoint {waypoint}: {distance_m:.1} m"),
            MissionEvent::MonitorReadFailure { monitor, reason } => {
                warn!("{monitor} monitor could not read telemetry: {reason}")
            }
            MissionEvent::Finished { outcome } => match outcome {
                MissionOutcome::Completed { metrics } => info!(
                    "mission complete, vehicle returned after {:.0} s and {:.0} m",
                    metrics.elapsed_s, metrics.distance_travelled_m
                ),
                MissionOutcome::RejectedByPolicy { reason, .. } => {
                    warn!("mission rejected: {reason}")
                }
                MissionOutcome::Aborted {
                    reason,
                    severity,
                    last_known_position,
                    ..
                } => match last_known_position {
                    Some(position) => error!(
                        "mission aborted ({severity}): {reason}; vehicle last seen at {position}, needs manual recovery"
                    ),
                    None => error!(
                        "mission aborted ({severity}): {reason}; vehicle position unknown, needs manual recovery"
                    ),
                },
            },
        }
    }
}

/// Forwards events into a channel, for callers that consume them as data.
#[derive(Clone)]
pub struct ChannelSink {
    tx: flume::Sender<MissionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, flume::Receiver<MissionEvent>) {
        let (tx, rx) = flume::unbounded();
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &MissionEvent) {
        // nobody listening is fine
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Serialize)]
struct EventRecord<'a> {
    #[serde(serialize_with = "crate::util::serialize_time")]
    timestamp: chrono::DateTime<chrono::Local>,
    #[serde(flatten)]
    event: &'a MissionEvent,
}

/// Appends one JSON object per event to a file. Lines are handed to a
/// background writer thread, so emitting never touches the disk.
pub struct JsonLinesSink {
    writer: NonBlocking,
    // flushes the remaining lines when the sink is dropped
    _guard: WorkerGuard,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create event log {}", path.display()))?;

        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(file);

        Ok(JsonLinesSink {
            writer,
            _guard: guard,
        })
    }

    fn write(&self, event: &MissionEvent) -> anyhow::Result<()> {
        let record = EventRecord {
            timestamp: chrono::Local::now(),
            event,
        };

        // one write per line keeps concurrent emitters from interleaving
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.clone().write_all(&line)?;

        Ok(())
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: &MissionEvent) {
        if let Err(err) = self.write(event) {
            warn!("could not write event to event log: {:#}", err);
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<DynSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<DynSink>) -> Self {
        FanoutSink { sinks }
    }

    pub fn push(&mut self, sink: DynSink) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &MissionEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
