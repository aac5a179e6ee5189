use std::net::IpAddr;

use super::{DetectionContext, Detector};
use crate::models::{AuthEvent, Finding, FindingKind, GeoLocation, TravelDetails};

/// Flags consecutive logins whose distance and time gap imply a travel speed
/// no traveller could reach
pub struct ImpossibleTravelDetector {
    /// GeoIP is only reliable to roughly 250 km; closer pairs are never reported
    min_distance_km: f64,
    /// Maximum plausible travel speed in km/h
    max_speed_kph: f64,
    /// Egress addresses of the VPN; they geolocate to the concentrator
    vpn_addresses: Vec<IpAddr>,
}

impl ImpossibleTravelDetector {
    pub fn new(min_distance_km: f64, max_speed_kph: f64, vpn_addresses: Vec<IpAddr>) -> Self {
        ImpossibleTravelDetector {
            min_distance_km,
            max_speed_kph,
            vpn_addresses,
        }
    }

    /// VPN egress and internal addresses say nothing about where the user is
    fn is_travel_point(&self, event: &AuthEvent) -> bool {
        match event.source_ip {
            Some(ip) => !self.vpn_addresses.contains(&ip) && !is_internal(&ip),
            None => true,
        }
    }

    /// Measure one consecutive pair; `None` if the pair is not reportable
    fn check_pair(&self, prev: &AuthEvent, next: &AuthEvent) -> Option<TravelDetails> {
        if !prev.differs_in_origin(next) {
            return None;
        }

        let (from, to) = match (&prev.location, &next.location) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                log::debug!(
                    "Skipping travel pair for '{}' at {}: missing geolocation",
                    next.user,
                    next.timestamp.to_rfc3339()
                );
                return None;
            }
        };

        let elapsed_ms = (next.timestamp - prev.timestamp).num_milliseconds();
        if elapsed_ms <= 0 {
            return None;
        }
        let elapsed_seconds = elapsed_ms as f64 / 1000.0;

        let distance_km = haversine_distance(from, to);
        if distance_km <= self.min_distance_km {
            return None;
        }

        let speed_kph = distance_km / (elapsed_seconds / 3600.0);
        if speed_kph <= self.max_speed_kph {
            return None;
        }

        Some(TravelDetails {
            distance_km,
            elapsed_seconds,
            speed_kph,
        })
    }
}

impl Default for ImpossibleTravelDetector {
    fn default() -> Self {
        Self::new(250.0, 1000.0, Vec::new())
    }
}

impl Detector for ImpossibleTravelDetector {
    fn kind(&self) -> FindingKind {
        FindingKind::ImpossibleTravel
    }

    fn detect(&self, ctx: &DetectionContext<'_>) -> Vec<Finding> {
        let sequence: Vec<&AuthEvent> = ctx
            .events
            .iter()
            .filter(|e| self.is_travel_point(e))
            .collect();

        sequence
            .windows(2)
            .filter(|pair| ctx.window.contains(pair[1].timestamp))
            .filter_map(|pair| {
                let (prev, next) = (pair[0], pair[1]);
                let details = self.check_pair(prev, next)?;
                let description = describe(ctx.user, prev, next, &details, self.max_speed_kph);
                Some(ctx.finding(
                    FindingKind::ImpossibleTravel,
                    vec![prev.clone(), next.clone()],
                    Some(details),
                    description,
                ))
            })
            .collect()
    }
}

fn describe(
    user: &str,
    prev: &AuthEvent,
    next: &AuthEvent,
    details: &TravelDetails,
    max_speed_kph: f64,
) -> String {
    let place = |event: &AuthEvent| match event.location.as_ref() {
        Some(loc) => match &loc.region {
            Some(region) => format!("{} ({:.4}, {:.4})", region, loc.latitude, loc.longitude),
            None => format!("({:.4}, {:.4})", loc.latitude, loc.longitude),
        },
        None => "unknown".to_string(),
    };
    format!(
        "User '{}' traveled {:.1} km in {:.2} hours ({:.0} km/h). \
         Max plausible speed: {:.0} km/h. Previous location: {}, Current location: {}.",
        user,
        details.distance_km,
        details.elapsed_seconds / 3600.0,
        details.speed_kph,
        max_speed_kph,
        place(prev),
        place(next)
    )
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Calculate the great-circle distance between two points using the Haversine formula
/// Returns distance in kilometers
pub fn haversine_distance(loc1: &GeoLocation, loc2: &GeoLocation) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = loc1.latitude.to_radians();
    let lat2_rad = loc2.latitude.to_radians();
    let delta_lat = (loc2.latitude - loc1.latitude).to_radians();
    let delta_lon = (loc2.longitude - loc1.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}
