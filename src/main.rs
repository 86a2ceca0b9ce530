use std::{process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use drone_delivery::{
    config::DeliverySystemConfig,
    event::{FanoutSink, JsonLinesSink, TracingSink},
    geocode::{resolve_location, Location, NominatimGeocoder},
    geodesic,
    policy::{self, EtaStatus},
    vehicle::create_vehicle,
    GeoPoint, MissionOutcome, MissionPlan, MissionSupervisor,
};

use crate::cli::args::{Command, MainArgs};

#[macro_use]
extern crate tracing;

mod cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    // setup colorful backtraces
    color_backtrace::install();

    let mut targets = Targets::new().with_default(LevelFilter::INFO);

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    }

    let (writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::hourly("logs", "drone-delivery"));

    let reg = tracing_subscriber::registry();

    #[cfg(tokio_unstable)]
    let reg = reg.with(console_subscriber::spawn());

    reg
        // writer that outputs to console
        .with(tracing_subscriber::fmt::layer().with_filter(targets))
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(
                    Targets::new().with_targets(vec![("drone_delivery", LevelFilter::DEBUG)]),
                ),
        )
        .init();

    let main_args = MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = DeliverySystemConfig::read(main_args.config.as_deref())
        .context("failed to read config file")?;
    config.check().context("invalid config")?;

    let mut sink = FanoutSink::new(vec![Arc::new(TracingSink)]);
    if let Some(path) = &main_args.events {
        sink.push(Arc::new(JsonLinesSink::create(path)?));
    }

    let (plan, launch) = match main_args.command {
        Command::Deliver { pharmacy, customer } => {
            let geocoder = NominatimGeocoder::new(&config.geocoder)?;
            let pharmacy = resolve(&pharmacy, &geocoder, "pharmacy").await?;
            let customer = resolve(&customer, &geocoder, "customer").await?;

            let distance = geodesic::distance(pharmacy, customer);

            // reject before anything is powered up; the supervisor checks
            // again against the vehicle's own home position
            match policy::validate(distance, &config.constraint) {
                Ok(verdict) => {
                    info!(
                        "delivery distance {:.2} km, one-way eta {:.1} min",
                        verdict.route_km(),
                        verdict.eta_minutes()
                    );

                    match verdict.status {
                        EtaStatus::WithinTarget => info!(
                            "delivery can be completed within {} minutes",
                            config.constraint.target_minutes
                        ),
                        EtaStatus::EtaExceeded => warn!(
                            "delivery may exceed the {} minute target",
                            config.constraint.target_minutes
                        ),
                    }
                }
                Err(rejection) => {
                    warn!("delivery not allowed: {}", rejection);
                    return Ok(ExitCode::from(2));
                }
            }

            let plan = MissionPlan::new(vec![config.waypoint.waypoint_at(customer)])?;
            (plan, Some(pharmacy))
        }
        Command::Mission { waypoints, launch } => {
            let plan = MissionPlan::new(
                waypoints
                    .into_iter()
                    .map(|position| config.waypoint.waypoint_at(position))
                    .collect(),
            )?;

            if let Some(launch) = launch {
                if let Err(rejection) = policy::validate_plan(launch, &plan, &config.constraint) {
                    warn!("mission not allowed: {}", rejection);
                    return Ok(ExitCode::from(2));
                }
            }

            (plan, launch)
        }
    };

    let vehicle = create_vehicle(&config.vehicle, launch).context("failed to create vehicle")?;

    let supervisor = MissionSupervisor::new(
        vehicle,
        config.constraint,
        config.supervisor.clone(),
        config.monitor.clone(),
        Arc::new(sink),
    );

    ctrlc::set_handler({
        let cancellation_token = supervisor.cancellation_token();
        move || {
            info!("received interrupt, aborting mission");
            cancellation_token.cancel();
        }
    })
    .context("could not set ctrl+c handler")?;

    let outcome = supervisor.run(plan).await;

    Ok(match outcome {
        MissionOutcome::Completed { .. } => ExitCode::SUCCESS,
        MissionOutcome::RejectedByPolicy { .. } => ExitCode::from(2),
        MissionOutcome::Aborted { .. } => ExitCode::FAILURE,
    })
}

async fn resolve(
    location: &Location,
    geocoder: &NominatimGeocoder,
    role: &str,
) -> anyhow::Result<GeoPoint> {
    let point = resolve_location(location, geocoder)
        .await
        .with_context(|| format!("could not resolve the {role} location"))?;

    info!("{role} at {point}");
    Ok(point)
}
