/////////
/// Coordinates and the one-shot geolocation lookup.
////////
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::config::GeolocationConfig;

// Approximate position of the machine, in decimal degrees
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} {:.4}", self.latitude, self.longitude)
    }
}

impl FromStr for Coordinates {
    type Err = LookupError;

    // Body is "<lat> <lon>": exactly two decimals, nothing else
    fn from_str(body: &str) -> Result<Self, Self::Err> {
        let mut tokens = body.split_whitespace();
        let (Some(lat), Some(lon), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(LookupError::Parse(body.trim().to_string()));
        };
        let latitude: f64 = lat
            .parse()
            .map_err(|_| LookupError::Parse(body.trim().to_string()))?;
        let longitude: f64 = lon
            .parse()
            .map_err(|_| LookupError::Parse(body.trim().to_string()))?;
        Coordinates::new(latitude, longitude)
            .ok_or_else(|| LookupError::Parse(body.trim().to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("geolocation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geolocation endpoint answered with status {0}")]
    Status(u16),
    #[error("geolocation response body unreadable: {0}")]
    Body(String),
    #[error("geolocation response is not \"<lat> <lon>\": {0:?}")]
    Parse(String),
}

/// A single attempt at locating the machine. Runs on the resolver thread.
pub trait GeoLookup: Send {
    fn lookup(&mut self) -> Result<Coordinates, LookupError>;
}

/// `GET <url>` returning a plaintext `"<lat> <lon>"` body.
#[derive(Clone, Debug)]
pub struct HttpGeoLookup {
    url: String,
    timeout: Duration,
}

impl HttpGeoLookup {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &GeolocationConfig) -> Self {
        Self::new(config.url.clone(), config.request_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl GeoLookup for HttpGeoLookup {
    fn lookup(&mut self) -> Result<Coordinates, LookupError> {
        // Built here so the blocking client lives and dies on the caller's thread
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response = client.get(&self.url).send()?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(LookupError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .map_err(|err| LookupError::Body(err.to_string()))?;
        body.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_latitude_then_longitude() {
        let coords: Coordinates = "40.7128 -74.0060".parse().unwrap();
        assert_eq!(coords.latitude, 40.7128);
        assert_eq!(coords.longitude, -74.0060);
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let coords: Coordinates = "  51.5\t-0.12\n".parse().unwrap();
        assert_eq!(coords, Coordinates::new(51.5, -0.12).unwrap());
    }

    #[test]
    fn rejects_malformed_bodies() {
        for body in ["garbage", "", "40.7", "40.7 -74.0 12", "north west", "NaN 3"] {
            assert!(
                body.parse::<Coordinates>().is_err(),
                "{body:?} should not parse"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!("91 0".parse::<Coordinates>().is_err());
        assert!("0 180.5".parse::<Coordinates>().is_err());
        assert!("-90 -180".parse::<Coordinates>().is_ok());
    }

    #[test]
    fn display_rounds_to_four_decimals() {
        let coords = Coordinates::new(-33.8688, 151.2093).unwrap();
        assert_eq!(coords.to_string(), "-33.8688 151.2093");
    }
}
