//! Ingestion of raw 2FA provider logs
//!
//! The provider exports one JSON object per line. Records are validated and
//! normalized into [`AuthEvent`]s in file order, and each accepted event gets
//! the next ingestion sequence number. A bad record is logged and reported
//! in the batch; it never aborts the rest of the batch.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;

use crate::geolocation::Geolocator;
use crate::models::{AuthEvent, GeoLocation, Outcome, TargetSystem};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed event on line {line}: {reason}")]
    MalformedEvent { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timestamp as exported: epoch seconds or a date-time string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    EpochFractional(f64),
    Text(String),
}

impl RawTimestamp {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Epoch(secs) => Utc.timestamp_opt(*secs, 0).single(),
            RawTimestamp::EpochFractional(secs) => {
                DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
            }
            RawTimestamp::Text(text) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    return Some(dt.with_timezone(&Utc));
                }
                NAIVE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                    .map(|naive| naive.and_utc())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLocation {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAccessDevice {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub location: Option<RawLocation>,
}

/// One provider log record, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAuthRecord {
    #[serde(alias = "username")]
    pub user: Option<String>,
    #[serde(alias = "isotimestamp", alias = "_time")]
    pub timestamp: Option<RawTimestamp>,
    pub result: Option<String>,
    pub integration: Option<String>,
    pub factor: Option<String>,
    pub reason: Option<String>,
    pub device: Option<String>,
    pub access_device: Option<RawAccessDevice>,
}

/// Map the provider's result string to an outcome
pub fn parse_outcome(result: &str) -> Option<Outcome> {
    match result.trim().to_ascii_lowercase().as_str() {
        "success" => Some(Outcome::Success),
        "failure" | "denied" => Some(Outcome::Failure),
        "fraud" | "fraud_report" => Some(Outcome::FraudReport),
        _ => None,
    }
}

/// The device management portal is the only integration detected separately
pub fn parse_target(integration: Option<&str>) -> TargetSystem {
    match integration {
        Some(name) if name.starts_with("Device Management Portal") => {
            TargetSystem::DeviceManagementPortal
        }
        _ => TargetSystem::Primary2fa,
    }
}

/// Parse an access-device address
///
/// Accepts plain addresses, `localhost`, and reverse-DNS style host names
/// whose first label encodes the IPv4 address with dashes.
pub fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if raw.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    raw.split('.')
        .next()
        .and_then(|label| label.replace('-', ".").parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4)
}

/// Accounts that are not people: integrations authenticate as "System" or
/// under descriptive names containing spaces
fn is_service_account(user: &str) -> bool {
    user == "System" || user.chars().any(char::is_whitespace)
}

impl RawAuthRecord {
    /// Validate and normalize into an event with the given sequence number
    ///
    /// Returns the reason on failure. A missing location is not an error:
    /// `geolocator` is consulted for records that carry an address without
    /// coordinates.
    pub fn into_event(
        self,
        sequence: u64,
        geolocator: Option<&dyn Geolocator>,
    ) -> Result<AuthEvent, String> {
        let user = self
            .user
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or("missing user")?;
        let timestamp = self
            .timestamp
            .ok_or("missing timestamp")?
            .to_utc()
            .ok_or("unparseable timestamp")?;
        let result = self.result.ok_or("missing result")?;
        let outcome =
            parse_outcome(&result).ok_or_else(|| format!("unknown result {:?}", result))?;
        let target = parse_target(self.integration.as_deref());

        let mut event = AuthEvent::new(sequence, user, timestamp, outcome, target);
        let access = self.access_device.unwrap_or_default();

        event.source_ip = access.ip.as_deref().and_then(parse_address);
        event.device = self.device.or(access.mac).filter(|d| !d.is_empty());
        event.location = locate(access.location, event.source_ip, geolocator);
        Ok(event)
    }
}

fn locate(
    reported: Option<RawLocation>,
    ip: Option<IpAddr>,
    geolocator: Option<&dyn Geolocator>,
) -> Option<GeoLocation> {
    let reported = reported.unwrap_or_default();
    let nonempty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
    let region = nonempty(reported.state);
    let country = nonempty(reported.country);

    let mut location = match (reported.latitude, reported.longitude) {
        (Some(latitude), Some(longitude)) => GeoLocation::new(latitude, longitude),
        _ => {
            let (ip, geolocator) = (ip?, geolocator?);
            geolocator.locate(&ip)?
        }
    };
    // The provider's own region beats the database's guess
    if region.is_some() {
        location.region = region;
    }
    if country.is_some() {
        location.country = country;
    }
    Some(location)
}

#[derive(Debug)]
pub struct RejectedRecord {
    pub line: usize,
    pub error: IngestError,
}

/// Result of ingesting one input
#[derive(Debug, Default)]
pub struct IngestBatch {
    /// Accepted events in input order
    pub events: Vec<AuthEvent>,
    pub rejected: Vec<RejectedRecord>,
    /// Service-account records dropped without error
    pub skipped: usize,
}

/// Stateful parser that keeps sequence numbers increasing across inputs
pub struct EventParser {
    next_sequence: u64,
    geolocator: Option<Arc<dyn Geolocator>>,
}

impl EventParser {
    pub fn new(start_sequence: u64) -> Self {
        EventParser {
            next_sequence: start_sequence,
            geolocator: None,
        }
    }

    pub fn with_geolocator(mut self, geolocator: Arc<dyn Geolocator>) -> Self {
        self.geolocator = Some(geolocator);
        self
    }

    /// Sequence number the next accepted event will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Parse one line; `Ok(None)` for blank lines and service accounts
    pub fn parse_line(
        &mut self,
        line_no: usize,
        line: &str,
    ) -> Result<Option<AuthEvent>, IngestError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let malformed = |reason: String| IngestError::MalformedEvent {
            line: line_no,
            reason,
        };
        let raw: RawAuthRecord =
            serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;

        if let Some(user) = raw.user.as_deref() {
            if is_service_account(user.trim()) {
                log::debug!("Skipping service account record for '{}'", user);
                return Ok(None);
            }
        }

        let event = raw
            .into_event(self.next_sequence, self.geolocator.as_deref())
            .map_err(malformed)?;
        self.next_sequence += 1;
        Ok(Some(event))
    }

    fn accept(&mut self, batch: &mut IngestBatch, line_no: usize, line: &str) {
        let is_blank = line.trim().is_empty();
        match self.parse_line(line_no, line) {
            Ok(Some(event)) => batch.events.push(event),
            Ok(None) if !is_blank => batch.skipped += 1,
            Ok(None) => {}
            Err(error) => {
                log::warn!("Skipping record: {}", error);
                batch.rejected.push(RejectedRecord {
                    line: line_no,
                    error,
                });
            }
        }
    }

    /// Parse a whole JSON-lines document
    pub fn parse_str(&mut self, input: &str) -> IngestBatch {
        let mut batch = IngestBatch::default();
        for (i, line) in input.lines().enumerate() {
            self.accept(&mut batch, i + 1, line);
        }
        log_batch(&batch);
        batch
    }

    /// Parse JSON lines from a reader; only read errors are fatal
    pub fn read<R: BufRead>(&mut self, reader: R) -> Result<IngestBatch, IngestError> {
        let mut batch = IngestBatch::default();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            self.accept(&mut batch, i + 1, &line);
        }
        log_batch(&batch);
        Ok(batch)
    }
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new(0)
    }
}

fn log_batch(batch: &IngestBatch) {
    log::info!(
        "Ingested {} event(s), rejected {}, skipped {} service record(s)",
        batch.events.len(),
        batch.rejected.len(),
        batch.skipped
    );
}
