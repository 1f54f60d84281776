//! Home/location classification
//!
//! Decides whether the vehicle is charging at the configured home circuit.
//! Named-location match first (the vehicle service's own geofence), GPS
//! proximity as the fallback. The result gates all charging logic: away or
//! unknown suspends optimization entirely, so a misconfigured home location
//! can never cause amperage commands at someone else's charger.

use crate::settings::Settings;
use crate::telemetry::VehicleState;
use serde::{Deserialize, Serialize};

/// Where the vehicle is relative to the home circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargerLocation {
    /// Plugged in at the home circuit
    ChargingAtHome,
    /// Plugged in somewhere else
    ChargingAway,
    /// Plugged in, but neither signal could place the vehicle
    LocationUnknown,
    /// Charge port not connected
    NotConnected,
}

/// Which signal produced the classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    NamedLocation,
    GpsProximity,
    None,
}

/// Classification result for one cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationFix {
    pub location: ChargerLocation,
    pub method: DetectionMethod,
}

/// Classify the vehicle's charging location for this cycle
pub fn classify(vehicle: &VehicleState, settings: &Settings) -> LocationFix {
    if !vehicle.charge_port_connected {
        return LocationFix {
            location: ChargerLocation::NotConnected,
            method: DetectionMethod::None,
        };
    }

    // Layer 1: the vehicle service's own named location
    if let Some(ref name) = vehicle.saved_location {
        let location = if name == "home" {
            ChargerLocation::ChargingAtHome
        } else {
            ChargerLocation::ChargingAway
        };
        return LocationFix {
            location,
            method: DetectionMethod::NamedLocation,
        };
    }

    // Layer 2: GPS proximity to configured home coordinates
    let (Some(home_lat), Some(home_lon)) = (settings.home_lat, settings.home_lon) else {
        return LocationFix {
            location: ChargerLocation::LocationUnknown,
            method: DetectionMethod::None,
        };
    };
    if vehicle.latitude == 0.0 && vehicle.longitude == 0.0 {
        return LocationFix {
            location: ChargerLocation::LocationUnknown,
            method: DetectionMethod::None,
        };
    }

    let distance_m = haversine_m(vehicle.latitude, vehicle.longitude, home_lat, home_lon);
    let location = if distance_m <= settings.home_radius_m {
        ChargerLocation::ChargingAtHome
    } else {
        ChargerLocation::ChargingAway
    };
    LocationFix {
        location,
        method: DetectionMethod::GpsProximity,
    }
}

/// Great-circle distance between two coordinates in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}
