//! Geolocation for public feeders.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use maxminddb::geoip2;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoLocation {
    /// "City, STATE", or the country code when no finer detail exists.
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub trait GeoLocator: Send + Sync {
    fn lookup(&self, addr: IpAddr) -> Option<GeoLocation>;
}

/// Used when geolocation is disabled or the database is missing.
#[derive(Debug, Default)]
pub struct NoGeoLocator;

impl GeoLocator for NoGeoLocator {
    fn lookup(&self, _addr: IpAddr) -> Option<GeoLocation> {
        None
    }
}

/// GeoLite2-City reader, loaded into memory once.
pub struct MaxMindLocator {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLocator {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .with_context(|| format!("failed to open GeoIP database {}", path.display()))?;
        Ok(Self { reader })
    }
}

impl GeoLocator for MaxMindLocator {
    fn lookup(&self, addr: IpAddr) -> Option<GeoLocation> {
        let city: geoip2::City = match self.reader.lookup(addr) {
            Ok(city) => city,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "GeoIP lookup found nothing");
                return None;
            }
        };

        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en").copied());
        let state = city
            .subdivisions
            .as_ref()
            .and_then(|subs| subs.first())
            .and_then(|s| s.iso_code);
        let country = city.country.as_ref().and_then(|c| c.iso_code);
        let (latitude, longitude) = city
            .location
            .as_ref()
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((None, None));

        Some(GeoLocation {
            location: format_location(city_name, state, country),
            latitude,
            longitude,
        })
    }
}

fn format_location(city: Option<&str>, state: Option<&str>, country: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [city, state]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        country.filter(|c| !c.is_empty()).map(str::to_string)
    } else {
        Some(parts.join(", "))
    }
}

/// Build the locator the configuration asks for, degrading to
/// [`NoGeoLocator`] when the database cannot be used.
pub fn locator_from_config(enabled: bool, db_path: &Path) -> Box<dyn GeoLocator> {
    if !enabled {
        return Box::new(NoGeoLocator);
    }
    match MaxMindLocator::open(db_path) {
        Ok(locator) => {
            tracing::info!(path = %db_path.display(), "GeoIP database loaded");
            Box::new(locator)
        }
        Err(e) => {
            tracing::warn!(error = %e, "GeoIP disabled");
            Box::new(NoGeoLocator)
        }
    }
}
