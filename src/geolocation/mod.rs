//! IP Geolocation module using MaxMind GeoLite2 database
//!
//! Events arrive from the 2FA provider with an access-device location most
//! of the time. When it is missing, ingestion can fall back to a
//! [`Geolocator`]. Users must download the GeoLite2-City database separately
//! from MaxMind (free with registration).

use maxminddb::{geoip2, Reader};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::models::GeoLocation;

/// Errors that can occur during geolocation lookups
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Failed to open database: {0}")]
    DatabaseOpen(#[from] maxminddb::MaxMindDBError),

    #[error("IP address not found in database")]
    NotFound,

    #[error("Location data missing for IP address")]
    NoLocation,

    #[error("Database file not found: {0}")]
    FileNotFound(String),
}

/// Resolves a source address to a location
pub trait Geolocator: Send + Sync {
    /// `None` when the address cannot be placed
    fn locate(&self, ip: &IpAddr) -> Option<GeoLocation>;
}

/// GeoIP lookup service using MaxMind GeoLite2-City database
///
/// # Example
///
/// ```ignore
/// use duplex::geolocation::{GeoIpService, Geolocator};
/// use std::net::IpAddr;
/// use std::str::FromStr;
///
/// let service = GeoIpService::new("GeoLite2-City.mmdb")?;
/// let ip = IpAddr::from_str("8.8.8.8").unwrap();
/// if let Some(location) = service.locate(&ip) {
///     println!("Location: {:?} ({}, {})", location.region, location.latitude, location.longitude);
/// }
/// ```
pub struct GeoIpService {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoIpService {
    /// Create a new GeoIP service from a MaxMind database file
    ///
    /// # Errors
    ///
    /// Returns an error if the database file cannot be opened or is invalid.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, GeoError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(GeoError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        log::info!("Loaded GeoIP database from {}", path.display());
        Ok(GeoIpService {
            reader: Arc::new(reader),
        })
    }

    fn city(&self, ip: &IpAddr) -> Result<geoip2::City<'_>, GeoError> {
        self.reader.lookup(*ip).map_err(|e| match e {
            maxminddb::MaxMindDBError::AddressNotFoundError(_) => GeoError::NotFound,
            other => GeoError::DatabaseOpen(other),
        })
    }

    /// Look up the location of an IP address
    ///
    /// The region is the first subdivision (US state for US addresses) by
    /// English name, falling back to its ISO code.
    pub fn lookup(&self, ip: &IpAddr) -> Result<GeoLocation, GeoError> {
        let city = self.city(ip)?;

        let location = city.location.ok_or(GeoError::NoLocation)?;
        let latitude = location.latitude.ok_or(GeoError::NoLocation)?;
        let longitude = location.longitude.ok_or(GeoError::NoLocation)?;

        let region = city
            .subdivisions
            .and_then(|subdivisions| subdivisions.into_iter().next())
            .and_then(|s| {
                s.names
                    .and_then(|n| n.get("en").copied())
                    .or(s.iso_code)
                    .map(String::from)
            });
        let country = city.country.and_then(|c| c.iso_code).map(String::from);

        Ok(GeoLocation {
            latitude,
            longitude,
            region,
            country,
        })
    }

    /// Check if an IP address is in the database
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.lookup(ip).is_ok()
    }
}

impl Geolocator for GeoIpService {
    fn locate(&self, ip: &IpAddr) -> Option<GeoLocation> {
        match self.lookup(ip) {
            Ok(location) => Some(location),
            Err(e) => {
                log::debug!("No geolocation for {}: {}", ip, e);
                None
            }
        }
    }
}

impl Clone for GeoIpService {
    fn clone(&self) -> Self {
        GeoIpService {
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Fixed address-to-location table, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticGeolocator {
    locations: HashMap<IpAddr, GeoLocation>,
}

impl StaticGeolocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: IpAddr, location: GeoLocation) {
        self.locations.insert(ip, location);
    }

    pub fn with(mut self, ip: IpAddr, location: GeoLocation) -> Self {
        self.insert(ip, location);
        self
    }
}

impl Geolocator for StaticGeolocator {
    fn locate(&self, ip: &IpAddr) -> Option<GeoLocation> {
        self.locations.get(ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // These tests need a GeoLite2-City.mmdb file and are skipped without one.
    fn get_test_service() -> Option<GeoIpService> {
        let paths = [
            "GeoLite2-City.mmdb",
            "../GeoLite2-City.mmdb",
            "assets/GeoLite2-City.mmdb",
        ];

        for path in &paths {
            if let Ok(service) = GeoIpService::new(path) {
                return Some(service);
            }
        }
        None
    }

    #[test]
    fn test_file_not_found() {
        let result = GeoIpService::new("nonexistent.mmdb");
        assert!(matches!(result, Err(GeoError::FileNotFound(_))));
    }

    #[test]
    fn test_private_ip_not_located() {
        if let Some(service) = get_test_service() {
            let private_ip = IpAddr::from_str("192.168.1.1").unwrap();
            assert!(service.lookup(&private_ip).is_err());
            assert!(service.locate(&private_ip).is_none());
        }
    }

    #[test]
    fn test_public_ip_lookup() {
        if let Some(service) = get_test_service() {
            let google_dns = IpAddr::from_str("8.8.8.8").unwrap();
            // Coverage of this address depends on the database version
            if let Ok(location) = service.lookup(&google_dns) {
                assert!(location.latitude >= -90.0 && location.latitude <= 90.0);
                assert!(location.longitude >= -180.0 && location.longitude <= 180.0);
                assert!(service.contains(&google_dns));
            }
        }
    }

    #[test]
    fn test_static_geolocator() {
        let ip = IpAddr::from_str("1.1.1.1").unwrap();
        let geo = StaticGeolocator::new().with(
            ip,
            GeoLocation::new(34.68, -82.84).with_region("South Carolina"),
        );

        let location = geo.locate(&ip).unwrap();
        assert_eq!(location.region.as_deref(), Some("South Carolina"));
        assert!(geo.locate(&IpAddr::from_str("2.2.2.2").unwrap()).is_none());
    }
}
