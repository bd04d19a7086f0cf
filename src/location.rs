//! Geographic locations and great-circle distance.
//!
//! The engine only uses geography to order the server catalog by proximity;
//! distance is the deterministic haversine over the WGS-84 equatorial
//! radius.

use crate::errors::{Error, Result};
use std::fmt;

/// Equatorial radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6378.137;

/// A named point on the globe.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub name: String,
    /// ISO country code, when known.
    pub cc: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    /// Creates a location, rejecting out-of-range coordinates.
    pub fn new(name: impl Into<String>, lat: f64, lon: f64) -> Result<Self> {
        validate(lat, lon)?;

        Ok(Location { name: name.into(), cc: None, lat, lon })
    }

    /// Parses a `"lat,lon"` coordinate pair into a location.
    pub fn parse(name: impl Into<String>, coordinates: &str) -> Result<Self> {
        let mut parts = coordinates.split(',');

        let (Some(lat_str), Some(lon_str), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidCoordinate(coordinates.to_string()));
        };

        let lat: f64 = lat_str
            .trim()
            .parse()
            .map_err(|_| Error::InvalidCoordinate(coordinates.to_string()))?;
        let lon: f64 = lon_str
            .trim()
            .parse()
            .map_err(|_| Error::InvalidCoordinate(coordinates.to_string()))?;

        Self::new(name, lat, lon)
    }

    /// Renders the coordinates as a parseable `"lat,lon"` pair with six
    /// decimal places.
    pub fn coordinate_string(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lon)
    }
}

fn validate(lat: f64, lon: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !lat.is_finite() {
        return Err(Error::InvalidCoordinate(format!("latitude {lat}")));
    }

    if !(-180.0..=180.0).contains(&lon) || !lon.is_finite() {
        return Err(Error::InvalidCoordinate(format!("longitude {lon}")));
    }

    Ok(())
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.coordinate_string())
    }
}

/// Great-circle distance in kilometres between two coordinate pairs.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();

    let delta_phi_half = ((lat1 - lat2) * std::f64::consts::PI / 360.0).sin();
    let delta_lambda_half =
        ((lon1 - lon2) * std::f64::consts::PI / 360.0).sin();

    // haversine of the central angle
    let h = delta_phi_half * delta_phi_half
        + phi1.cos() * phi2.cos() * delta_lambda_half * delta_lambda_half;

    let central = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_KM * central
}
