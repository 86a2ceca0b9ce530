use std::sync::Arc;

use drone_delivery::{
    config::WaypointDefaults,
    event::ChannelSink,
    monitor::MonitorConfig,
    policy::{DeliveryConstraint, EtaStatus, PolicyRejection},
    supervisor::SupervisorConfig,
    vehicle::{SimulatedConfig, SimulatedVehicle},
    GeoPoint, MissionEvent, MissionOutcome, MissionPhase, MissionPlan, MissionSupervisor,
};

fn point(lat: f64, lon: f64) -> GeoPoint {
    GeoPoint::new(lat, lon).unwrap()
}

fn pharmacy() -> GeoPoint {
    point(51.5074, -0.1278)
}

fn plan(points: &[GeoPoint]) -> MissionPlan {
    let defaults = WaypointDefaults::default();
    MissionPlan::new(points.iter().map(|&p| defaults.waypoint_at(p)).collect()).unwrap()
}

async fn fly(
    constraint: DeliveryConstraint,
    plan: MissionPlan,
) -> (MissionOutcome, Vec<MissionEvent>) {
    let vehicle = SimulatedVehicle::new(SimulatedConfig::default(), pharmacy());
    let (sink, events) = ChannelSink::new();

    let supervisor = MissionSupervisor::new(
        Box::new(vehicle),
        constraint,
        SupervisorConfig::default(),
        MonitorConfig::default(),
        Arc::new(sink),
    );

    let outcome = supervisor.run(plan).await;
    (outcome, events.try_iter().collect())
}

fn phases(events: &[MissionEvent]) -> Vec<MissionPhase> {
    events
        .iter()
        .filter_map(|event| match event {
            MissionEvent::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn is_monitor_event(event: &MissionEvent) -> bool {
    matches!(
        event,
        MissionEvent::Progress { .. }
            | MissionEvent::Proximity { .. }
            | MissionEvent::MonitorReadFailure { .. }
    )
}

#[tokio::test(start_paused = true)]
async fn delivery_in_range_completes() {
    // about 2.2 km north, then 1.1 km east
    let plan = plan(&[point(51.5274, -0.1278), point(51.5274, -0.1118)]);
    let (outcome, events) = fly(DeliveryConstraint::default(), plan).await;

    assert!(outcome.is_completed(), "{:?}", outcome);

    use MissionPhase::*;
    assert_eq!(
        phases(&events),
        vec![
            Connecting,
            AwaitingLock,
            Validating,
            Uploading,
            Armed,
            Executing,
            ReturningToLaunch,
            Completed
        ]
    );

    let progress: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            MissionEvent::Progress { current, total } => Some((*current, *total)),
            _ => None,
        })
        .collect();
    // the final report races with the supervisor noticing the finish
    assert_eq!(progress[..2], [(0, 2), (1, 2)]);
    assert!(progress[2..].iter().all(|&p| p == (2, 2)));

    assert!(events.iter().any(|e| matches!(e, MissionEvent::Proximity { .. })));
    assert!(matches!(
        events.last(),
        Some(MissionEvent::Finished {
            outcome: MissionOutcome::Completed { .. }
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn monitors_are_silent_once_returning() {
    let plan = plan(&[point(51.5174, -0.1278)]);
    let (outcome, events) = fly(DeliveryConstraint::default(), plan).await;
    assert!(outcome.is_completed());

    let returning = events
        .iter()
        .position(|event| {
            matches!(
                event,
                MissionEvent::PhaseChanged {
                    to: MissionPhase::ReturningToLaunch,
                    ..
                }
            )
        })
        .unwrap();

    assert!(events[..returning].iter().any(is_monitor_event));
    assert!(!events[returning..].iter().any(is_monitor_event));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_delivery_never_arms() {
    // about 6.7 km north
    let plan = plan(&[point(51.5674, -0.1278)]);
    let (outcome, events) = fly(DeliveryConstraint::default(), plan).await;

    match &outcome {
        MissionOutcome::RejectedByPolicy { reason, .. } => {
            assert!(matches!(reason, PolicyRejection::OutOfRange { .. }))
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(
        phases(&events),
        vec![
            MissionPhase::Connecting,
            MissionPhase::AwaitingLock,
            MissionPhase::Validating,
            MissionPhase::RejectedByPolicy
        ]
    );
    assert!(!events.iter().any(is_monitor_event));
}

#[tokio::test(start_paused = true)]
async fn slow_delivery_is_flown_anyway() {
    let constraint = DeliveryConstraint {
        target_minutes: 1.0,
        ..Default::default()
    };
    let plan = plan(&[point(51.5274, -0.1278)]);
    let (outcome, events) = fly(constraint, plan).await;

    assert!(events.iter().any(|e| matches!(
        e,
        MissionEvent::PolicyAccepted {
            status: EtaStatus::EtaExceeded,
            ..
        }
    )));
    assert!(outcome.is_completed());
}
