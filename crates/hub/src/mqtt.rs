use crate::state::CriticalFault;

/// Topic critical faults are published on.
pub(crate) const FAULT_TOPIC: &str = "hub/fault";

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Subscription filter for station observations.
pub(crate) fn weather_filter(station: Option<&str>) -> String {
    format!("weather/{}/obs", station.unwrap_or("+"))
}

/// Extract the station name from "weather/<station>/obs".
pub(crate) fn extract_station(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "weather" && parts[2] == "obs" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract the numeric zone id from "zone/<id>/set".
pub(crate) fn extract_zone_id(topic: &str) -> Option<u8> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "zone" && parts[2] == "set" {
        parts[1].parse().ok()
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZoneCommand {
    On { duration_sec: i64 },
    Off,
}

/// Parse "ON <secs>" / "OFF" (case-insensitive, trims whitespace).
pub(crate) fn parse_zone_command(payload: &[u8]) -> Result<ZoneCommand, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    let mut words = s.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("OFF"), None, None) => Ok(ZoneCommand::Off),
        (Some("ON"), Some(secs), None) => secs
            .parse()
            .map(|duration_sec| ZoneCommand::On { duration_sec })
            .map_err(|_| format!("bad duration '{secs}' in zone command")),
        (Some("ON"), None, None) => Err("ON requires a duration in seconds".to_string()),
        _ => Err(format!("unknown zone command '{s}'")),
    }
}

pub(crate) fn fault_payload(fault: &CriticalFault) -> Vec<u8> {
    serde_json::to_vec(fault).unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
