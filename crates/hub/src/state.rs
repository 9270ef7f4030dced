use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::adjust::Adjustment;
use crate::history::{Outcome, RunRecord};
use crate::schedule::Zone;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;
/// Maximum number of critical faults retained for the status view.
const MAX_FAULTS: usize = 20;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Read-only projection of scheduler state for the web and MQTT layers.
/// The scheduler is the only writer of zone state.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub zones: BTreeMap<u8, ZoneSummary>,
    pub adjustment: Option<Adjustment>,
    pub rain_sensor_active: bool,
    pub weather_at: Option<i64>,
    pub events: VecDeque<SystemEvent>,
    pub faults: VecDeque<CriticalFault>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Idle,
    Pending,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneSummary {
    pub name: String,
    pub enabled: bool,
    pub status: ZoneStatus,
    pub last_start: Option<i64>,
    /// Seconds; `None` while the run is still open.
    pub last_run_sec: Option<i64>,
    pub last_adjustment: Option<Adjustment>,
    pub last_outcome: Option<Outcome>,
}

/// A zone that could not be turned off. Raised every failed attempt until
/// the relay finally deactivates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalFault {
    pub zone_id: u8,
    pub at: i64,
    pub attempt: u32,
    pub error: String,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Run,
    Weather,
    Fault,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub adjustment: Option<Adjustment>,
    pub rain_sensor_active: bool,
    pub weather_at: Option<i64>,
    pub zones: BTreeMap<u8, ZoneSummary>,
    pub faults: Vec<CriticalFault>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(zones: &[Zone]) -> Self {
        let zones = zones
            .iter()
            .map(|z| {
                (
                    z.id,
                    ZoneSummary {
                        name: z.name.clone(),
                        enabled: z.enabled,
                        status: ZoneStatus::Idle,
                        last_start: None,
                        last_run_sec: None,
                        last_adjustment: None,
                        last_outcome: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            zones,
            adjustment: None,
            rain_sensor_active: false,
            weather_at: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            faults: VecDeque::with_capacity(MAX_FAULTS),
        }
    }

    pub fn shared(zones: &[Zone]) -> SharedState {
        Arc::new(RwLock::new(Self::new(zones)))
    }

    /// Fill per-zone summaries from the latest persisted record of each zone.
    pub fn seed_history(&mut self, latest: &[RunRecord]) {
        for r in latest {
            if let Some(zone) = self.zones.get_mut(&r.zone_id) {
                apply_record(zone, r);
            }
        }
    }

    pub fn set_status(&mut self, zone_id: u8, status: ZoneStatus) {
        if let Some(zone) = self.zones.get_mut(&zone_id) {
            zone.status = status;
        }
    }

    /// Record a run record being opened or closed.
    pub fn record_run(&mut self, r: &RunRecord) {
        if let Some(zone) = self.zones.get_mut(&r.zone_id) {
            apply_record(zone, r);
        }

        let detail = match r.stopped_at {
            None => format!(
                "zone {} started for {}s ({})",
                r.zone_id,
                r.programmed_sec,
                describe(r.adjustment)
            ),
            Some(stop) => format!(
                "zone {} {} after {}s",
                r.zone_id,
                r.outcome.as_str(),
                stop - r.started_at
            ),
        };
        self.push_event(EventKind::Run, detail);
    }

    /// Record the result of this pass's adjustment evaluation.
    pub fn record_adjustment(&mut self, adjustment: Adjustment, rain_active: bool, weather_at: Option<i64>) {
        if self.adjustment != Some(adjustment) {
            self.push_event(
                EventKind::Weather,
                format!("adjustment now {}", describe(adjustment)),
            );
        }
        self.adjustment = Some(adjustment);
        self.rain_sensor_active = rain_active;
        self.weather_at = weather_at;
    }

    pub fn record_fault(&mut self, fault: CriticalFault) {
        self.set_status(fault.zone_id, ZoneStatus::Stopping);
        self.push_event(
            EventKind::Fault,
            format!(
                "zone {} failed to turn off (attempt {}): {}",
                fault.zone_id, fault.attempt, fault.error
            ),
        );
        if self.faults.len() >= MAX_FAULTS {
            self.faults.pop_front();
        }
        self.faults.push_back(fault);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            adjustment: self.adjustment,
            rain_sensor_active: self.rain_sensor_active,
            weather_at: self.weather_at,
            zones: self.zones.clone(),
            faults: self.faults.iter().rev().cloned().collect(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            kind,
            detail,
        });
    }
}

fn apply_record(zone: &mut ZoneSummary, r: &RunRecord) {
    zone.last_start = Some(r.started_at);
    zone.last_run_sec = r.stopped_at.map(|stop| stop - r.started_at);
    zone.last_adjustment = Some(r.adjustment);
    zone.last_outcome = Some(r.outcome);
}

fn describe(a: Adjustment) -> String {
    match a {
        Adjustment::Weather(f) => format!("weather x{f:.2}"),
        Adjustment::Unadjusted => "unadjusted".to_string(),
        Adjustment::Manual => "manual".to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn zones() -> Vec<Zone> {
        vec![
            Zone {
                id: 1,
                name: "Front lawn".into(),
                enabled: true,
                baseline_sec: 600,
                gpio_pin: 17,
            },
            Zone {
                id: 2,
                name: "Beds".into(),
                enabled: false,
                baseline_sec: 300,
                gpio_pin: 27,
            },
        ]
    }

    fn record(zone_id: u8, stopped_at: Option<i64>, outcome: Outcome) -> RunRecord {
        RunRecord {
            id: 1,
            zone_id,
            started_at: 1_000,
            stopped_at,
            programmed_sec: 300,
            baseline_sec: 600,
            adjustment: Adjustment::Weather(0.5),
            trigger: Some("1@06:00".into()),
            outcome,
        }
    }

    #[test]
    fn new_state_has_idle_zones() {
        let s = SystemState::new(&zones());
        assert_eq!(s.zones.len(), 2);
        assert!(s.zones.values().all(|z| z.status == ZoneStatus::Idle));
        assert!(!s.zones[&2].enabled);
    }

    #[test]
    fn record_run_updates_summary_and_events() {
        let mut s = SystemState::new(&zones());
        s.record_run(&record(1, None, Outcome::Running));
        assert_eq!(s.zones[&1].last_start, Some(1_000));
        assert_eq!(s.zones[&1].last_run_sec, None);

        s.record_run(&record(1, Some(1_300), Outcome::Completed));
        assert_eq!(s.zones[&1].last_run_sec, Some(300));
        assert_eq!(s.zones[&1].last_outcome, Some(Outcome::Completed));
        assert_eq!(s.events.len(), 2);
        assert!(s.events[1].detail.contains("completed"));
    }

    #[test]
    fn adjustment_change_logged_once() {
        let mut s = SystemState::new(&zones());
        s.record_adjustment(Adjustment::Weather(1.0), false, Some(5));
        s.record_adjustment(Adjustment::Weather(1.0), false, Some(6));
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.weather_at, Some(6));
        s.record_adjustment(Adjustment::Unadjusted, false, None);
        assert_eq!(s.events.len(), 2);
    }

    #[test]
    fn fault_marks_zone_stopping() {
        let mut s = SystemState::new(&zones());
        s.record_fault(CriticalFault {
            zone_id: 1,
            at: 10,
            attempt: 1,
            error: "stuck".into(),
        });
        assert_eq!(s.zones[&1].status, ZoneStatus::Stopping);
        assert_eq!(s.faults.len(), 1);
        assert_eq!(s.events.back().unwrap().kind, EventKind::Fault);
    }

    #[test]
    fn event_ring_buffer_is_bounded() {
        let mut s = SystemState::new(&zones());
        for i in 0..(MAX_EVENTS + 10) {
            s.record_system(format!("event {i}"));
        }
        assert_eq!(s.events.len(), MAX_EVENTS);
        let status = s.to_status();
        // Newest first.
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 9));
    }

    #[test]
    fn unknown_zone_updates_are_ignored() {
        let mut s = SystemState::new(&zones());
        s.set_status(9, ZoneStatus::Running);
        s.seed_history(&[record(9, Some(1_100), Outcome::Completed)]);
        assert_eq!(s.zones.len(), 2);
    }
}
