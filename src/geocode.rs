//! Turning free-text addresses into coordinates. Only the binary uses this;
//! the supervisor itself is always handed coordinates.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::state::{GeoError, GeoPoint, ParsePointError};

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("address not found")]
    NotFound,
    #[error("geocoding request failed")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<GeoPoint, GeocodeError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    /// Nominatim refuses requests without an identifying user agent
    pub user_agent: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        GeocoderConfig {
            base_url: "https://nominatim.openstreetmap.org".to_owned(),
            user_agent: "drone_delivery_system".to_owned(),
        }
    }
}

/// Client for the OpenStreetMap Nominatim search API.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    search_url: reqwest::Url,
}

#[derive(Deserialize)]
struct SearchResult {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig) -> anyhow::Result<Self> {
        let base_url =
            reqwest::Url::from_str(&config.base_url).context("invalid geocoder url")?;
        let search_url = base_url
            .join("search")
            .context("invalid geocoder url")?;

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build geocoder http client")?;

        Ok(NominatimGeocoder { http, search_url })
    }
}

/// Picks the best match out of a search response body.
fn first_match(results: &[SearchResult]) -> Result<GeoPoint, GeocodeError> {
    let best = results.first().ok_or(GeocodeError::NotFound)?;

    let parse = |value: &str| {
        value
            .parse::<f64>()
            .map_err(|_| GeocodeError::InvalidCoordinates(format!("{},{}", best.lat, best.lon)))
    };

    GeoPoint::new(parse(&best.lat)?, parse(&best.lon)?)
        .map_err(|err| GeocodeError::InvalidCoordinates(err.to_string()))
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, address: &str) -> Result<GeoPoint, GeocodeError> {
        debug!("geocoding {:?}", address);

        let results: Vec<SearchResult> = self
            .http
            .get(self.search_url.clone())
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let point = first_match(&results)?;
        debug!("geocoded to {}", point);
        Ok(point)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseLocationError {
    #[error("location is empty")]
    Empty,
    #[error("coordinates out of range")]
    OutOfRange(#[from] GeoError),
}

/// A location given by the operator, either as `lat,lon` or as an address.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Coordinates(GeoPoint),
    Address(String),
}

impl FromStr for Location {
    type Err = ParseLocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseLocationError::Empty);
        }

        match GeoPoint::from_str(s) {
            Ok(point) => Ok(Location::Coordinates(point)),
            Err(ParsePointError::OutOfRange(err)) => Err(err.into()),
            Err(_) => Ok(Location::Address(s.to_owned())),
        }
    }
}

/// Coordinates are used as-is; addresses go through `geocoder`.
pub async fn resolve_location(
    location: &Location,
    geocoder: &dyn Geocoder,
) -> Result<GeoPoint, GeocodeError> {
    match location {
        Location::Coordinates(point) => Ok(*point),
        Location::Address(address) => geocoder.resolve(address).await,
    }
}
