use std::path::PathBuf;

use clap::{Parser, Subcommand};
use drone_delivery::{geocode::Location, GeoPoint};

#[derive(Debug, Parser)]
#[clap(about = "Flies a delivery drone through a waypoint mission and back home")]
pub struct MainArgs {
    /// The path to the config file for the delivery system
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// Also write every mission event as a JSON line to this file
    #[clap(long)]
    pub events: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deliver from a pharmacy to a customer. Either location may be an
    /// address or `lat,lon`.
    Deliver {
        #[clap(long, allow_hyphen_values = true)]
        pharmacy: Location,

        #[clap(long, allow_hyphen_values = true)]
        customer: Location,
    },

    /// Fly an explicit list of waypoints in order.
    Mission {
        /// A waypoint as `lat,lon`; repeat for each waypoint
        #[clap(long = "waypoint", short, required = true, allow_hyphen_values = true)]
        waypoints: Vec<GeoPoint>,

        /// Where the simulated vehicle takes off, as `lat,lon`
        #[clap(long, allow_hyphen_values = true)]
        launch: Option<GeoPoint>,
    },
}
