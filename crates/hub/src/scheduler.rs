//! Zone scheduler: evaluates schedules against the clock and the weather
//! adjustment, serializes valve access, and owns every relay transition and
//! run-record write.
//!
//! Everything runs on one task. A `tokio::select!` loop multiplexes the pass
//! ticker, the nearest run/retry deadline and operator commands, so no two
//! transitions for a zone can interleave.
//!
//! ## Per-zone state machine
//!
//! ```text
//! Idle ──[trigger / manual start]──▶ Pending ──[slot free]──▶ Running
//!  ▲  ▲                                 │                       │
//!  │  └──────[zero duration: skipped]───┘      [duration elapsed / stop]
//!  │                                                            ▼
//!  ├───────────────[relay off]──────────────────────────── (deactivate)
//!  │                                                            │ fails
//!  │                                                            ▼
//!  └──────────────[relay off]────────────────────────────── Stopping ◀─┐
//!                                                               └──────┘
//!                                                          retry, backoff
//! Running ◀─ activation fails ─▶ Failed ──[next pass]──▶ Idle
//! ```
//!
//! A zone in `Stopping` still counts toward the concurrency limit: its
//! valve may be open.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use anyhow::Result;
use thiserror::Error;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::adjust::{Adjustment, AdjustmentEngine, AdjustmentInputs, RainSensorState, WaterBalance};
use crate::config::{AdjustmentModel, Config, RainSensorKind};
use crate::history::{unix, History, NewRun, Outcome};
use crate::relay::{self, RelayDriver, RelayError};
use crate::schedule::{schedule_table, Schedule, TriggerCheck, Zone};
use crate::state::{CriticalFault, SharedState, ZoneStatus};
use crate::weather::{SnapshotRx, WeatherSnapshot};

/// Ceiling for the deactivation retry backoff.
const MAX_BACKOFF_SEC: i64 = 60;
/// Deactivation attempts per zone during shutdown before giving up.
const SHUTDOWN_ATTEMPTS: u32 = 5;
const SHUTDOWN_RETRY_MS: u64 = 100;
/// Longest manual run accepted (4 h).
pub const MAX_MANUAL_SEC: i64 = 4 * 3600;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub type Reply = oneshot::Sender<Result<(), CommandError>>;

#[derive(Debug)]
pub enum Command {
    StartZone {
        zone_id: u8,
        duration_sec: i64,
        reply: Option<Reply>,
    },
    StopZone {
        zone_id: u8,
        reply: Option<Reply>,
    },
    /// Stop all zones, close their records, then signal `done`.
    Shutdown { done: oneshot::Sender<()> },
}

pub type CommandTx = mpsc::Sender<Command>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown zone {0}")]
    UnknownZone(u8),
    #[error("zone {0} is disabled")]
    ZoneDisabled(u8),
    #[error("zone {0} is busy")]
    ZoneBusy(u8),
    #[error("duration must be between 1 and 14400 seconds, got {0}")]
    InvalidDuration(i64),
    #[error("zone {0} is not running")]
    NotRunning(u8),
}

// ---------------------------------------------------------------------------
// Per-zone state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum ZoneState {
    Idle,
    /// Queued behind the concurrency limit.
    Pending,
    Running {
        until: OffsetDateTime,
    },
    /// Deactivation failed; retry at `retry_at`.
    Stopping {
        outcome: Outcome,
        attempt: u32,
        retry_at: OffsetDateTime,
    },
    /// Activation failed this pass.
    Failed,
}

impl ZoneState {
    fn status(self) -> ZoneStatus {
        match self {
            ZoneState::Idle => ZoneStatus::Idle,
            ZoneState::Pending => ZoneStatus::Pending,
            ZoneState::Running { .. } => ZoneStatus::Running,
            ZoneState::Stopping { .. } => ZoneStatus::Stopping,
            ZoneState::Failed => ZoneStatus::Failed,
        }
    }

    fn holds_relay(self) -> bool {
        matches!(self, ZoneState::Running { .. } | ZoneState::Stopping { .. })
    }

    fn deadline(self) -> Option<OffsetDateTime> {
        match self {
            ZoneState::Running { until } => Some(until),
            ZoneState::Stopping { retry_at, .. } => Some(retry_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRun {
    zone_id: u8,
    baseline_sec: i64,
    duration_sec: i64,
    adjustment: Adjustment,
    trigger: Option<String>,
}

/// Retry delay after the `attempt`-th failed deactivation: 1 s doubling to
/// a 60 s ceiling.
fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::seconds((1i64 << exp).min(MAX_BACKOFF_SEC))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Channels the scheduler shares with the rest of the hub.
pub struct SchedulerIo {
    pub weather: SnapshotRx,
    pub shared: SharedState,
    pub faults: broadcast::Sender<CriticalFault>,
}

pub struct Scheduler<R> {
    zones: BTreeMap<u8, Zone>,
    schedules: Vec<Schedule>,
    states: BTreeMap<u8, ZoneState>,
    /// At most one pending run per zone; started lowest zone id first.
    queue: BTreeMap<u8, PendingRun>,
    /// Site-local date of the last trigger consumed, per trigger key.
    last_fired: HashMap<String, Date>,

    relay: R,
    history: History,
    engine: AdjustmentEngine,
    rain: RainSensorState,
    balance: WaterBalance,
    io: SchedulerIo,

    offset: UtcOffset,
    pass_interval: StdDuration,
    max_concurrent: usize,
    catch_up: Duration,
}

impl<R: RelayDriver> Scheduler<R> {
    pub fn new(config: &Config, relay: R, history: History, io: SchedulerIo) -> Result<Self> {
        let zones: BTreeMap<u8, Zone> = config
            .zone_table()
            .into_iter()
            .map(|z| (z.id, z))
            .collect();
        let states = zones.keys().map(|&id| (id, ZoneState::Idle)).collect();
        let engine = AdjustmentEngine::from_config(config);
        let offset = UtcOffset::from_whole_seconds(config.site.utc_offset_min * 60)?;

        Ok(Self {
            schedules: schedule_table(&config.schedules),
            states,
            queue: BTreeMap::new(),
            last_fired: HashMap::new(),
            relay,
            history,
            rain: RainSensorState::new(config.rain_sensor.kind),
            balance: WaterBalance::new(engine.initial_deficit_mm()),
            engine,
            io,
            zones,
            offset,
            pass_interval: StdDuration::from_secs(config.controller.pass_interval_sec),
            max_concurrent: config.controller.max_concurrent_zones,
            catch_up: Duration::minutes(config.controller.catch_up_min),
        })
    }

    /// Close runs a previous process left open and restore trigger history,
    /// so nothing already fired today fires again.
    pub async fn recover(&mut self, now: OffsetDateTime) -> Result<()> {
        let interrupted = self.history.reconcile_interrupted(unix(now)).await?;
        {
            let mut st = self.io.shared.write().await;
            for r in &interrupted {
                warn!(
                    zone = r.zone_id,
                    run_id = r.id,
                    started_at = r.started_at,
                    "run interrupted by restart, record closed"
                );
                st.record_run(r);
            }
        }

        let starts = self.history.last_trigger_starts().await?;
        for schedule in &self.schedules {
            let key = schedule.key();
            let Some(started) = starts.get(&key) else {
                continue;
            };
            if let Ok(t) = OffsetDateTime::from_unix_timestamp(*started) {
                self.last_fired
                    .insert(key, schedule.trigger_date(t, self.offset));
            }
        }

        let latest = self.history.reader().latest_per_zone().await?;
        self.io.shared.write().await.seed_history(&latest);

        info!(
            interrupted = interrupted.len(),
            triggers = self.last_fired.len(),
            "scheduler state recovered"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run until a `Shutdown` command arrives or every command sender is
    /// dropped. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            zones = self.zones.len(),
            schedules = self.schedules.len(),
            pass_sec = self.pass_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            model = ?self.engine.model(),
            "scheduler started"
        );
        self.io.shared.write().await.record_system(format!(
            "scheduler started ({} zones, {} schedules, max concurrent {})",
            self.zones.len(),
            self.schedules.len(),
            self.max_concurrent
        ));

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = ticker.tick() => {
                    self.pass(OffsetDateTime::now_utc()).await;
                }
                _ = sleep_until(deadline) => {
                    self.expire_due(OffsetDateTime::now_utc()).await;
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down scheduler");
                        self.shutdown(OffsetDateTime::now_utc()).await;
                        return;
                    };
                    if !self.handle(cmd, OffsetDateTime::now_utc()).await {
                        return;
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<OffsetDateTime> {
        self.states.values().filter_map(|s| s.deadline()).min()
    }

    /// Apply one command. Returns false once the scheduler has shut down.
    pub async fn handle(&mut self, cmd: Command, now: OffsetDateTime) -> bool {
        let (result, reply) = match cmd {
            Command::StartZone {
                zone_id,
                duration_sec,
                reply,
            } => (self.start_manual(zone_id, duration_sec, now).await, reply),
            Command::StopZone { zone_id, reply } => (self.stop_zone(zone_id, now).await, reply),
            Command::Shutdown { done } => {
                self.shutdown(now).await;
                let _ = done.send(());
                return false;
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "command rejected");
        }
        if let Some(tx) = reply {
            let _ = tx.send(result);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Pass
    // -----------------------------------------------------------------------

    /// One scheduling pass: refresh weather-derived state, evaluate the
    /// adjustment once, queue due triggers, then start what fits.
    pub async fn pass(&mut self, now: OffsetDateTime) {
        self.expire_due(now).await;

        let failed: Vec<u8> = self
            .states
            .iter()
            .filter(|(_, s)| **s == ZoneState::Failed)
            .map(|(z, _)| *z)
            .collect();
        for zone in failed {
            self.set_state(zone, ZoneState::Idle).await;
        }

        let snapshot = self.io.weather.borrow().clone();
        self.observe_weather(snapshot.as_ref(), now);

        let adjustment = self.engine.evaluate(&AdjustmentInputs {
            now,
            snapshot: snapshot.as_ref(),
            rain: &self.rain,
            balance: &self.balance,
        });
        let freeze = self.engine.freeze_hold(snapshot.as_ref(), now);
        let rain_active = self.rain.is_active(now, self.engine.rain_sensor());
        self.io.shared.write().await.record_adjustment(
            adjustment,
            rain_active,
            snapshot.as_ref().map(|s| unix(s.observation.timestamp)),
        );

        self.evaluate_triggers(now, adjustment, freeze).await;
        self.dispatch(now).await;
    }

    fn observe_weather(&mut self, snapshot: Option<&WeatherSnapshot>, now: OffsetDateTime) {
        if self.engine.model() == AdjustmentModel::PenmanMonteith {
            let today = now.to_offset(self.offset).date();
            let et0 = self
                .engine
                .fresh(snapshot, now)
                .map(|obs| self.engine.reference_et0(obs, today))
                .unwrap_or(0.0);
            if self.balance.roll_day(today, et0) {
                info!(
                    %today,
                    et0_mm = et0,
                    deficit_mm = self.balance.deficit_mm,
                    "water balance rolled"
                );
            }
        }

        if let Some(s) = snapshot {
            let fell = self.rain.observe_snapshot(&s.observation, self.engine.rain_sensor());
            if fell > 0.0 {
                debug!(rain_mm = fell, "new rainfall observed");
                self.balance.add_rain(fell);
            }
        }
        self.rain.expire(now, self.engine.rain_sensor());

        if self.engine.rain_sensor().kind == RainSensorKind::Hardware {
            let station = self
                .engine
                .fresh(snapshot, now)
                .and_then(|obs| obs.rain_sensor_active);
            if let Some(active) = self.relay.read_rain_pin().or(station) {
                self.rain.observe_pin(active, now);
            }
        }
    }

    async fn evaluate_triggers(&mut self, now: OffsetDateTime, adjustment: Adjustment, freeze: bool) {
        let mut credited = false;

        for schedule in self.schedules.clone() {
            let key = schedule.key();
            let last = self.last_fired.get(&key).copied();

            let Some(zone) = self.zones.get(&schedule.zone_id).cloned() else {
                continue;
            };
            // Disabled zones produce no history at all.
            if !zone.enabled {
                continue;
            }

            let check = schedule.evaluate(now, self.offset, last, self.catch_up);
            match check {
                TriggerCheck::NotToday | TriggerCheck::NotYet | TriggerCheck::Done => {}
                TriggerCheck::Missed { at } => {
                    warn!(zone = zone.id, trigger = %key, %at, "trigger missed its catch-up window");
                    self.append(NewRun {
                        zone_id: zone.id,
                        started_at: unix(at),
                        programmed_sec: 0,
                        baseline_sec: 0,
                        adjustment: Adjustment::Unadjusted,
                        trigger: Some(key.clone()),
                        outcome: Outcome::Missed,
                    })
                    .await;
                    self.last_fired.insert(key, self.local_date(at));
                }
                TriggerCheck::Due { at } => {
                    if self.is_busy(zone.id) {
                        debug!(zone = zone.id, trigger = %key, "zone busy, trigger deferred");
                        continue;
                    }
                    if freeze {
                        debug!(zone = zone.id, trigger = %key, "freeze guard, trigger deferred");
                        continue;
                    }

                    let adj = if schedule.weather_adjust {
                        adjustment
                    } else {
                        Adjustment::Unadjusted
                    };
                    let baseline_sec = schedule.duration_sec.unwrap_or(zone.baseline_sec);
                    let duration_sec = adj.effective_sec(baseline_sec);
                    info!(
                        zone = zone.id,
                        trigger = %key,
                        %at,
                        baseline_sec,
                        duration_sec,
                        adjustment = ?adj,
                        "schedule triggered"
                    );

                    if !credited && self.engine.model() == AdjustmentModel::PenmanMonteith {
                        if let Adjustment::Weather(f) = adj {
                            if f > 0.0 {
                                self.balance.credit(f * self.engine.application_mm());
                                credited = true;
                            }
                        }
                    }

                    self.queue.insert(zone.id, PendingRun {
                        zone_id: zone.id,
                        baseline_sec,
                        duration_sec,
                        adjustment: adj,
                        trigger: Some(key.clone()),
                    });
                    self.set_state(zone.id, ZoneState::Pending).await;
                    self.last_fired.insert(key, self.local_date(at));
                }
            }
        }
    }

    fn local_date(&self, t: OffsetDateTime) -> Date {
        t.to_offset(self.offset).date()
    }

    fn state(&self, zone: u8) -> ZoneState {
        self.states.get(&zone).copied().unwrap_or(ZoneState::Idle)
    }

    fn is_busy(&self, zone: u8) -> bool {
        !matches!(self.state(zone), ZoneState::Idle | ZoneState::Failed)
            || self.history.open_run(zone).is_some()
    }

    fn active_count(&self) -> usize {
        self.states.values().filter(|s| s.holds_relay()).count()
    }

    async fn set_state(&mut self, zone: u8, state: ZoneState) {
        self.states.insert(zone, state);
        self.io.shared.write().await.set_status(zone, state.status());
    }

    // -----------------------------------------------------------------------
    // Starting and stopping runs
    // -----------------------------------------------------------------------

    /// Start pending runs in ascending zone-id order while concurrency
    /// allows. Zero-length runs never touch the relay and are recorded
    /// immediately.
    async fn dispatch(&mut self, now: OffsetDateTime) {
        let mut waiting = BTreeMap::new();
        while let Some((zone, run)) = self.queue.pop_first() {
            if run.duration_sec > 0 && self.active_count() >= self.max_concurrent {
                waiting.insert(zone, run);
                continue;
            }
            self.start_run(run, now).await;
        }
        self.queue = waiting;
    }

    async fn start_run(&mut self, run: PendingRun, now: OffsetDateTime) {
        let zone = run.zone_id;
        let started_at = unix(now);
        let skipped = run.duration_sec <= 0;

        let opened = self
            .append(NewRun {
                zone_id: zone,
                started_at,
                programmed_sec: run.duration_sec.max(0),
                baseline_sec: run.baseline_sec,
                adjustment: run.adjustment,
                trigger: run.trigger.clone(),
                outcome: if skipped {
                    Outcome::Skipped
                } else {
                    Outcome::Running
                },
            })
            .await;

        if skipped {
            info!(zone, trigger = ?run.trigger, adjustment = ?run.adjustment, "run skipped");
            self.set_state(zone, ZoneState::Idle).await;
            return;
        }
        if !opened {
            self.set_state(zone, ZoneState::Idle).await;
            return;
        }

        match self.relay.activate(zone) {
            Ok(()) => {
                info!(zone, duration_sec = run.duration_sec, "zone running");
                let until = now + Duration::seconds(run.duration_sec);
                self.set_state(zone, ZoneState::Running { until }).await;
            }
            Err(e) => {
                error!(zone, error = %e, "relay activation failed");
                self.io
                    .shared
                    .write()
                    .await
                    .record_error(format!("zone {zone} failed to start: {e}"));

                // The output may have latched despite the error.
                match self.relay.deactivate(zone) {
                    Ok(()) => {
                        self.close(zone, started_at, Outcome::Failed).await;
                        self.set_state(zone, ZoneState::Failed).await;
                    }
                    Err(off) if self.relay.is_active(zone) => {
                        self.escalate(zone, Outcome::Failed, 1, off, now).await;
                    }
                    Err(off) => {
                        error!(zone, error = %off, "relay off after failed start also failed");
                        self.raise_fault(zone, 1, &off, now).await;
                        self.close(zone, started_at, Outcome::Failed).await;
                        self.set_state(zone, ZoneState::Failed).await;
                    }
                }
            }
        }
    }

    /// Turn a running zone off and close its record with `outcome`.
    async fn finish_run(&mut self, zone: u8, outcome: Outcome, now: OffsetDateTime) {
        match self.relay.deactivate(zone) {
            Ok(()) => {
                info!(zone, outcome = outcome.as_str(), "zone off");
                self.close(zone, unix(now), outcome).await;
                self.set_state(zone, ZoneState::Idle).await;
            }
            Err(e) => self.escalate(zone, outcome, 1, e, now).await,
        }
    }

    async fn escalate(
        &mut self,
        zone: u8,
        outcome: Outcome,
        attempt: u32,
        e: RelayError,
        now: OffsetDateTime,
    ) {
        let retry_in = backoff(attempt);
        error!(
            zone,
            attempt,
            retry_in_sec = retry_in.whole_seconds(),
            error = %e,
            "CRITICAL: relay failed to turn off"
        );
        self.raise_fault(zone, attempt, &e, now).await;
        self.set_state(
            zone,
            ZoneState::Stopping {
                outcome,
                attempt,
                retry_at: now + retry_in,
            },
        )
        .await;
    }

    async fn raise_fault(&mut self, zone: u8, attempt: u32, e: &RelayError, now: OffsetDateTime) {
        let fault = CriticalFault {
            zone_id: zone,
            at: unix(now),
            attempt,
            error: e.to_string(),
        };
        // No subscribers is fine.
        let _ = self.io.faults.send(fault.clone());
        self.io.shared.write().await.record_fault(fault);
    }

    /// Complete runs whose time is up and retry pending deactivations.
    pub async fn expire_due(&mut self, now: OffsetDateTime) {
        let due: Vec<(u8, ZoneState)> = self
            .states
            .iter()
            .filter(|(_, s)| s.deadline().is_some_and(|d| d <= now))
            .map(|(z, s)| (*z, *s))
            .collect();

        for (zone, state) in due {
            match state {
                ZoneState::Running { .. } => self.finish_run(zone, Outcome::Completed, now).await,
                ZoneState::Stopping {
                    outcome, attempt, ..
                } => match self.relay.deactivate(zone) {
                    Ok(()) => {
                        warn!(zone, attempts = attempt + 1, "relay turned off after retries");
                        self.close(zone, unix(now), outcome).await;
                        self.set_state(zone, ZoneState::Idle).await;
                    }
                    Err(e) => self.escalate(zone, outcome, attempt + 1, e, now).await,
                },
                _ => {}
            }
        }

        self.dispatch(now).await;
    }

    async fn start_manual(
        &mut self,
        zone_id: u8,
        duration_sec: i64,
        now: OffsetDateTime,
    ) -> Result<(), CommandError> {
        let zone = self
            .zones
            .get(&zone_id)
            .ok_or(CommandError::UnknownZone(zone_id))?;
        if !zone.enabled {
            return Err(CommandError::ZoneDisabled(zone_id));
        }
        if !(1..=MAX_MANUAL_SEC).contains(&duration_sec) {
            return Err(CommandError::InvalidDuration(duration_sec));
        }
        if self.is_busy(zone_id) {
            return Err(CommandError::ZoneBusy(zone_id));
        }

        info!(zone = zone_id, duration_sec, "manual start requested");
        self.queue.insert(zone_id, PendingRun {
            zone_id,
            baseline_sec: duration_sec,
            duration_sec,
            adjustment: Adjustment::Manual,
            trigger: None,
        });
        self.set_state(zone_id, ZoneState::Pending).await;
        self.dispatch(now).await;
        Ok(())
    }

    async fn stop_zone(&mut self, zone_id: u8, now: OffsetDateTime) -> Result<(), CommandError> {
        if !self.zones.contains_key(&zone_id) {
            return Err(CommandError::UnknownZone(zone_id));
        }
        match self.state(zone_id) {
            ZoneState::Pending => {
                self.queue.remove(&zone_id);
                info!(zone = zone_id, "pending run cancelled");
                self.set_state(zone_id, ZoneState::Idle).await;
                Ok(())
            }
            ZoneState::Running { .. } => {
                info!(zone = zone_id, "manual stop requested");
                self.finish_run(zone_id, Outcome::Stopped, now).await;
                Ok(())
            }
            // Already being turned off; the retry loop owns it.
            ZoneState::Stopping { .. } => Ok(()),
            ZoneState::Idle | ZoneState::Failed => Err(CommandError::NotRunning(zone_id)),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Drop the queue, turn every active zone off and close its record.
    /// A zone whose relay still refuses after a bounded number of attempts
    /// keeps its record open for reconciliation at the next start.
    pub async fn shutdown(&mut self, now: OffsetDateTime) {
        info!(active = self.active_count(), queued = self.queue.len(), "scheduler shutting down");
        let began = std::time::Instant::now();

        let queued: Vec<u8> = std::mem::take(&mut self.queue).into_keys().collect();
        for zone in queued {
            self.set_state(zone, ZoneState::Idle).await;
        }

        let holding: Vec<(u8, ZoneState)> = self
            .states
            .iter()
            .filter(|(_, s)| s.holds_relay())
            .map(|(z, s)| (*z, *s))
            .collect();

        for (zone, state) in holding {
            let outcome = match state {
                ZoneState::Stopping { outcome, .. } => outcome,
                _ => Outcome::Shutdown,
            };
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.relay.deactivate(zone) {
                    Ok(()) => {
                        let stopped = now + began.elapsed();
                        info!(zone, outcome = outcome.as_str(), "zone off for shutdown");
                        self.close(zone, unix(stopped), outcome).await;
                        self.set_state(zone, ZoneState::Idle).await;
                        break;
                    }
                    Err(e) if attempt < SHUTDOWN_ATTEMPTS => {
                        warn!(zone, attempt, error = %e, "relay off failed during shutdown, retrying");
                        tokio::time::sleep(StdDuration::from_millis(SHUTDOWN_RETRY_MS << attempt))
                            .await;
                    }
                    Err(e) => {
                        error!(
                            zone,
                            attempts = attempt,
                            error = %e,
                            "CRITICAL: relay still on at shutdown, run left open for restart"
                        );
                        let fault = CriticalFault {
                            zone_id: zone,
                            at: unix(now + began.elapsed()),
                            attempt,
                            error: e.to_string(),
                        };
                        let _ = self.io.faults.send(fault.clone());
                        self.io.shared.write().await.record_fault(fault);
                        break;
                    }
                }
            }
        }

        // Force every output low/high-off regardless of tracked state.
        let all: Vec<u8> = self.zones.values().filter(|z| z.enabled).map(|z| z.id).collect();
        relay::all_off(&mut self.relay, &all);

        self.io
            .shared
            .write()
            .await
            .record_system("scheduler stopped".to_string());
    }

    // -----------------------------------------------------------------------
    // History helpers
    // -----------------------------------------------------------------------

    async fn append(&mut self, run: NewRun) -> bool {
        match self.history.append(run).await {
            Ok(record) => {
                self.io.shared.write().await.record_run(&record);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to append run record");
                self.io.shared.write().await.record_error(format!("{e:#}"));
                false
            }
        }
    }

    async fn close(&mut self, zone: u8, stopped_at: i64, outcome: Outcome) {
        match self.history.update_open_record(zone, stopped_at, outcome).await {
            Ok(Some(record)) => self.io.shared.write().await.record_run(&record),
            Ok(None) => warn!(zone, "no open run record to close"),
            Err(e) => {
                error!(zone, error = %e, "failed to close run record");
                self.io.shared.write().await.record_error(format!("{e:#}"));
            }
        }
    }
}

async fn sleep_until(deadline: Option<OffsetDateTime>) {
    match deadline {
        Some(d) => {
            let wait = StdDuration::try_from(d - OffsetDateTime::now_utc()).unwrap_or(StdDuration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending().await,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduleEntry, ZoneEntry};
    use crate::history::{Db, HistoryFilter, HistoryReader, RunRecord};
    use crate::state::SystemState;
    use crate::weather::{calm_observation, WeatherObservation};
    use std::collections::{BTreeSet, HashSet};
    use std::sync::{Arc, Mutex};
    use time::macros::datetime;
    use tokio::sync::watch;

    const T0: OffsetDateTime = datetime!(2026-06-01 06:00 UTC);

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    // -- Scripted relay ---------------------------------------------------

    #[derive(Default)]
    struct RelayLog {
        active: BTreeSet<u8>,
        max_active: usize,
        activations: Vec<u8>,
        fail_activate: HashSet<u8>,
        /// A failed activation still energises the output.
        latch_on_failure: bool,
        /// Number of upcoming deactivations that fail.
        fail_deactivate: u32,
        rain: Option<bool>,
    }

    #[derive(Clone, Default)]
    struct ScriptedRelay(Arc<Mutex<RelayLog>>);

    impl ScriptedRelay {
        fn log(&self) -> std::sync::MutexGuard<'_, RelayLog> {
            self.0.lock().unwrap()
        }
    }

    impl RelayDriver for ScriptedRelay {
        fn activate(&mut self, zone: u8) -> Result<(), RelayError> {
            let mut log = self.log();
            if log.fail_activate.contains(&zone) {
                if log.latch_on_failure {
                    log.active.insert(zone);
                }
                return Err(RelayError::Write {
                    zone,
                    reason: "scripted".into(),
                });
            }
            log.active.insert(zone);
            log.activations.push(zone);
            log.max_active = log.max_active.max(log.active.len());
            Ok(())
        }

        fn deactivate(&mut self, zone: u8) -> Result<(), RelayError> {
            let mut log = self.log();
            if log.fail_deactivate > 0 && log.active.contains(&zone) {
                log.fail_deactivate -= 1;
                return Err(RelayError::Write {
                    zone,
                    reason: "stuck".into(),
                });
            }
            log.active.remove(&zone);
            Ok(())
        }

        fn is_active(&self, zone: u8) -> bool {
            self.log().active.contains(&zone)
        }

        fn read_rain_pin(&mut self) -> Option<bool> {
            self.log().rain
        }
    }

    // -- Harness ----------------------------------------------------------

    struct Harness {
        sched: Scheduler<ScriptedRelay>,
        relay: ScriptedRelay,
        reader: HistoryReader,
        weather: watch::Sender<Option<WeatherSnapshot>>,
        faults: broadcast::Receiver<CriticalFault>,
        shared: SharedState,
        db: Db,
    }

    impl Harness {
        fn set_weather(&self, obs: WeatherObservation) {
            self.weather.send_replace(Some(WeatherSnapshot {
                fetched_at: obs.timestamp,
                observation: obs,
            }));
        }

        async fn runs(&self) -> Vec<RunRecord> {
            let mut runs = self.reader.query(&HistoryFilter::default()).await.unwrap();
            runs.reverse(); // oldest first
            runs
        }

        async fn start(&mut self, zone_id: u8, duration_sec: i64, now: OffsetDateTime) -> Result<(), CommandError> {
            let (tx, rx) = oneshot::channel();
            self.sched
                .handle(
                    Command::StartZone {
                        zone_id,
                        duration_sec,
                        reply: Some(tx),
                    },
                    now,
                )
                .await;
            rx.await.unwrap()
        }

        async fn stop(&mut self, zone_id: u8, now: OffsetDateTime) -> Result<(), CommandError> {
            let (tx, rx) = oneshot::channel();
            self.sched
                .handle(Command::StopZone { zone_id, reply: Some(tx) }, now)
                .await;
            rx.await.unwrap()
        }
    }

    fn zone(id: u8, pin: i64) -> ZoneEntry {
        ZoneEntry {
            zone_id: id,
            name: format!("Zone {id}"),
            enabled: true,
            baseline_sec: 600,
            valve_gpio_pin: pin,
        }
    }

    fn at_six(zone_id: u8) -> ScheduleEntry {
        ScheduleEntry {
            zone_id,
            start: "06:00".into(),
            every_days: 1,
            months: vec![],
            duration_sec: None,
            weather_adjust: true,
        }
    }

    fn config(schedules: Vec<ScheduleEntry>) -> Config {
        Config {
            zones: vec![zone(1, 17), zone(2, 27), zone(3, 22)],
            schedules,
            ..Config::default()
        }
    }

    async fn fresh_db(cfg: &Config) -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        crate::config::apply(cfg, &db).await.unwrap();
        db
    }

    async fn harness_on(cfg: Config, db: Db) -> Harness {
        let history = History::open(db.clone()).await.unwrap();
        let reader = history.reader();
        let (weather, weather_rx) = watch::channel(None);
        let shared = SystemState::shared(&cfg.zone_table());
        let (fault_tx, faults) = broadcast::channel(16);
        let relay = ScriptedRelay::default();
        let mut sched = Scheduler::new(
            &cfg,
            relay.clone(),
            history,
            SchedulerIo {
                weather: weather_rx,
                shared: shared.clone(),
                faults: fault_tx,
            },
        )
        .unwrap();
        sched.recover(T0).await.unwrap();
        Harness {
            sched,
            relay,
            reader,
            weather,
            faults,
            shared,
            db,
        }
    }

    async fn harness(cfg: Config) -> Harness {
        let db = fresh_db(&cfg).await;
        harness_on(cfg, db).await
    }

    // -- Scheduled runs ---------------------------------------------------

    #[tokio::test]
    async fn dry_day_runs_full_baseline() {
        let mut h = harness(config(vec![at_six(1)])).await;
        h.set_weather(calm_observation(T0 - Duration::minutes(5)));

        h.sched.pass(T0).await;
        assert!(h.relay.is_active(1));
        let runs = h.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].programmed_sec, 600);
        assert_eq!(runs[0].adjustment, Adjustment::Weather(1.0));
        assert_eq!(runs[0].trigger.as_deref(), Some("1@06:00"));
        assert!(runs[0].stopped_at.is_none());

        h.sched.expire_due(T0 + secs(600)).await;
        assert!(!h.relay.is_active(1));
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Completed);
        assert_eq!(runs[0].stopped_at, Some(unix(T0) + 600));
    }

    #[tokio::test]
    async fn heavy_rain_records_skip_without_touching_relay() {
        let mut h = harness(config(vec![at_six(1)])).await;
        let mut obs = calm_observation(T0 - Duration::minutes(5));
        obs.precipitation_mm = 10.0;
        h.set_weather(obs);

        h.sched.pass(T0).await;
        assert!(h.relay.log().activations.is_empty());
        let runs = h.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Outcome::Skipped);
        assert_eq!(runs[0].programmed_sec, 0);
        assert_eq!(runs[0].stopped_at, Some(runs[0].started_at));
        assert_eq!(runs[0].adjustment, Adjustment::Weather(0.0));
    }

    #[tokio::test]
    async fn stale_weather_runs_unadjusted() {
        let mut h = harness(config(vec![at_six(1)])).await;
        let mut obs = calm_observation(T0 - Duration::hours(4));
        obs.precipitation_mm = 10.0;
        h.set_weather(obs);

        h.sched.pass(T0).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].adjustment, Adjustment::Unadjusted);
        assert_eq!(runs[0].programmed_sec, 600);
    }

    #[tokio::test]
    async fn hardware_rain_sensor_blocks_scheduled_run() {
        let mut cfg = config(vec![at_six(1)]);
        cfg.rain_sensor.kind = RainSensorKind::Hardware;
        cfg.rain_sensor.pin = Some(5);
        let mut h = harness(cfg).await;
        h.relay.log().rain = Some(true);

        h.sched.pass(T0).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Skipped);
        assert!(h.relay.log().activations.is_empty());
    }

    #[tokio::test]
    async fn unadjusted_schedule_ignores_rain() {
        let mut entry = at_six(1);
        entry.weather_adjust = false;
        entry.duration_sec = Some(120);
        let mut h = harness(config(vec![entry])).await;
        let mut obs = calm_observation(T0);
        obs.precipitation_mm = 10.0;
        h.set_weather(obs);

        h.sched.pass(T0).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].adjustment, Adjustment::Unadjusted);
        assert_eq!(runs[0].programmed_sec, 120);
    }

    #[tokio::test]
    async fn trigger_fires_once_per_day() {
        let mut h = harness(config(vec![at_six(1)])).await;
        h.sched.pass(T0).await;
        h.sched.pass(T0 + secs(5)).await;
        h.sched.expire_due(T0 + secs(600)).await;
        h.sched.pass(T0 + secs(700)).await;
        assert_eq!(h.runs().await.len(), 1);

        h.sched.pass(T0 + Duration::days(1)).await;
        assert_eq!(h.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn restart_does_not_refire_completed_trigger() {
        let cfg = config(vec![at_six(1)]);
        let db = fresh_db(&cfg).await;
        {
            let mut h = harness_on(cfg.clone(), db.clone()).await;
            h.sched.pass(T0).await;
            h.sched.expire_due(T0 + secs(600)).await;
        }

        let mut h = harness_on(cfg, db).await;
        h.sched.pass(T0 + secs(700)).await;
        assert_eq!(h.runs().await.len(), 1);
        assert!(h.relay.log().activations.is_empty());
    }

    #[tokio::test]
    async fn restart_closes_interrupted_run() {
        let cfg = config(vec![]);
        let db = fresh_db(&cfg).await;
        {
            let mut history = History::open(db.clone()).await.unwrap();
            history
                .append(NewRun {
                    zone_id: 3,
                    started_at: unix(T0) - 120,
                    programmed_sec: 600,
                    baseline_sec: 600,
                    adjustment: Adjustment::Manual,
                    trigger: None,
                    outcome: Outcome::Running,
                })
                .await
                .unwrap();
        }

        let h = harness_on(cfg, db).await;
        let runs = h.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Outcome::Interrupted);
        assert_eq!(runs[0].stopped_at, Some(unix(T0)));

        let st = h.shared.read().await;
        assert_eq!(st.zones[&3].last_outcome, Some(Outcome::Interrupted));
        assert_eq!(st.zones[&3].status, ZoneStatus::Idle);
    }

    #[tokio::test]
    async fn missed_trigger_is_recorded() {
        let mut h = harness(config(vec![at_six(1)])).await;
        h.sched.pass(T0 + Duration::hours(3)).await;
        let runs = h.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Outcome::Missed);
        assert_eq!(runs[0].started_at, unix(T0));
        assert!(h.relay.log().activations.is_empty());

        h.sched.pass(T0 + Duration::hours(3) + secs(5)).await;
        assert_eq!(h.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn late_first_pass_still_fires_next_day() {
        let mut h = harness(config(vec![at_six(1)])).await;
        h.sched.pass(T0 + Duration::hours(8)).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Missed);
        assert_eq!(runs[0].started_at, unix(T0));

        h.sched.pass(T0 + Duration::days(1)).await;
        assert_eq!(h.relay.log().activations, vec![1]);
        let runs = h.runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].outcome, Outcome::Running);
        assert_eq!(runs[1].started_at, unix(T0 + Duration::days(1)));
    }

    #[tokio::test]
    async fn restart_after_missed_trigger_fires_next_day() {
        let cfg = config(vec![at_six(1)]);
        let db = fresh_db(&cfg).await;
        {
            let mut h = harness_on(cfg.clone(), db.clone()).await;
            h.sched.pass(T0 + Duration::hours(8)).await;
        }

        let mut h = harness_on(cfg, db).await;
        h.sched.pass(T0 + Duration::hours(8) + secs(5)).await;
        assert_eq!(h.runs().await.len(), 1);

        h.sched.pass(T0 + Duration::days(1)).await;
        assert_eq!(h.relay.log().activations, vec![1]);
        assert_eq!(h.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn disabled_zone_schedule_leaves_no_history() {
        let mut cfg = config(vec![at_six(2)]);
        cfg.zones[1].enabled = false;
        let mut h = harness(cfg).await;

        h.sched.pass(T0 + Duration::hours(8)).await;
        h.sched.pass(T0 + Duration::days(1)).await;
        assert!(h.runs().await.is_empty());
        assert!(h.relay.log().activations.is_empty());
    }

    #[tokio::test]
    async fn freeze_guard_defers_trigger() {
        let mut cfg = config(vec![at_six(1)]);
        cfg.adjustment.freeze_guard_c = Some(2.0);
        let mut h = harness(cfg).await;
        let mut obs = calm_observation(T0);
        obs.temperature_c = -3.0;
        h.set_weather(obs);

        h.sched.pass(T0).await;
        assert!(h.runs().await.is_empty());

        let mut warmer = calm_observation(T0 + Duration::minutes(30));
        warmer.temperature_c = 4.0;
        h.set_weather(warmer);
        h.sched.pass(T0 + Duration::minutes(30)).await;
        assert_eq!(h.runs().await.len(), 1);
        assert!(h.relay.is_active(1));
    }

    #[tokio::test]
    async fn penman_monteith_scales_by_deficit_and_credits() {
        let mut cfg = config(vec![at_six(1)]);
        cfg.adjustment.model = AdjustmentModel::PenmanMonteith;
        let mut h = harness(cfg).await;
        h.set_weather(calm_observation(T0));

        h.sched.pass(T0).await;
        let runs = h.runs().await;
        // Initial deficit 5 mm over a 10 mm application.
        assert_eq!(runs[0].adjustment, Adjustment::Weather(0.5));
        assert_eq!(runs[0].programmed_sec, 300);
        assert_eq!(h.sched.balance.deficit_mm, 0.0);
    }

    // -- Exclusivity and deferral -----------------------------------------

    #[tokio::test]
    async fn zones_run_one_at_a_time() {
        let mut h = harness(config(vec![at_six(1), at_six(2)])).await;
        h.sched.pass(T0).await;
        assert!(h.relay.is_active(1));
        assert!(!h.relay.is_active(2));
        assert_eq!(h.shared.read().await.zones[&2].status, ZoneStatus::Pending);

        h.sched.expire_due(T0 + secs(600)).await;
        assert!(!h.relay.is_active(1));
        assert!(h.relay.is_active(2));

        h.sched.expire_due(T0 + secs(1200)).await;
        let runs = h.runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].zone_id, 2);
        assert_eq!(runs[1].started_at, unix(T0) + 600);
        assert_eq!(runs[1].stopped_at, Some(unix(T0) + 1200));
        assert_eq!(h.relay.log().max_active, 1);
    }

    #[tokio::test]
    async fn concurrency_limit_above_one() {
        let mut cfg = config(vec![at_six(1), at_six(2), at_six(3)]);
        cfg.controller.max_concurrent_zones = 2;
        let mut h = harness(cfg).await;
        h.sched.pass(T0).await;
        assert!(h.relay.is_active(1) && h.relay.is_active(2));
        assert!(!h.relay.is_active(3));
        assert_eq!(h.relay.log().max_active, 2);
    }

    #[tokio::test]
    async fn overlapping_trigger_waits_for_zone() {
        let mut late = at_six(1);
        late.start = "06:05".into();
        let mut h = harness(config(vec![at_six(1), late])).await;

        h.sched.pass(T0).await;
        h.sched.pass(T0 + Duration::minutes(5)).await;
        assert_eq!(h.runs().await.len(), 1);

        h.sched.expire_due(T0 + secs(600)).await;
        h.sched.pass(T0 + secs(601)).await;
        let runs = h.runs().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].trigger.as_deref(), Some("1@06:05"));
    }

    #[tokio::test]
    async fn pending_zones_start_lowest_id_first() {
        let mut later = at_six(2);
        later.start = "06:05".into();
        let mut h = harness(config(vec![at_six(1), at_six(3), later])).await;

        h.sched.pass(T0).await;
        h.sched.pass(T0 + Duration::minutes(5)).await;
        assert_eq!(h.shared.read().await.zones[&2].status, ZoneStatus::Pending);
        assert_eq!(h.shared.read().await.zones[&3].status, ZoneStatus::Pending);

        h.sched.expire_due(T0 + secs(600)).await;
        assert_eq!(h.relay.log().activations, vec![1, 2]);
        assert_eq!(h.shared.read().await.zones[&3].status, ZoneStatus::Pending);

        h.sched.expire_due(T0 + secs(1200)).await;
        assert_eq!(h.relay.log().activations, vec![1, 2, 3]);
    }

    // -- Relay failures ---------------------------------------------------

    #[tokio::test]
    async fn activation_failure_closes_record_as_failed() {
        let mut h = harness(config(vec![at_six(1)])).await;
        h.relay.log().fail_activate.insert(1);

        h.sched.pass(T0).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Failed);
        assert_eq!(runs[0].stopped_at, Some(runs[0].started_at));
        assert_eq!(h.shared.read().await.zones[&1].status, ZoneStatus::Failed);

        // Next pass: back to idle, no retry within the same cycle.
        h.relay.log().fail_activate.clear();
        h.sched.pass(T0 + secs(5)).await;
        assert_eq!(h.shared.read().await.zones[&1].status, ZoneStatus::Idle);
        assert_eq!(h.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_start_with_latched_relay_escalates() {
        let mut h = harness(config(vec![at_six(1)])).await;
        {
            let mut log = h.relay.log();
            log.fail_activate.insert(1);
            log.latch_on_failure = true;
            log.fail_deactivate = 1;
        }

        h.sched.pass(T0).await;
        let fault = h.faults.try_recv().unwrap();
        assert_eq!((fault.zone_id, fault.attempt), (1, 1));
        assert!(h.runs().await[0].stopped_at.is_none());
        assert_eq!(h.shared.read().await.zones[&1].status, ZoneStatus::Stopping);

        h.sched.expire_due(T0 + secs(1)).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Failed);
        assert_eq!(runs[0].stopped_at, Some(unix(T0) + 1));
        assert!(!h.relay.is_active(1));
        assert_eq!(h.shared.read().await.zones[&1].status, ZoneStatus::Idle);
    }

    #[tokio::test]
    async fn deactivation_failure_retries_with_backoff() {
        let mut h = harness(config(vec![])).await;
        h.start(1, 10, T0).await.unwrap();
        h.relay.log().fail_deactivate = 2;

        h.sched.expire_due(T0 + secs(10)).await;
        let fault = h.faults.try_recv().unwrap();
        assert_eq!((fault.zone_id, fault.attempt), (1, 1));
        assert!(h.runs().await[0].stopped_at.is_none());
        assert_eq!(h.shared.read().await.zones[&1].status, ZoneStatus::Stopping);

        // Zone 2 must wait: zone 1's valve may still be open.
        h.start(2, 30, T0 + secs(10)).await.unwrap();
        assert!(!h.relay.is_active(2));

        h.sched.expire_due(T0 + secs(11)).await;
        assert_eq!(h.faults.try_recv().unwrap().attempt, 2);
        assert_eq!(h.sched.next_deadline(), Some(T0 + secs(13)));

        h.sched.expire_due(T0 + secs(12)).await;
        assert!(h.faults.try_recv().is_err());

        h.sched.expire_due(T0 + secs(13)).await;
        let runs = h.runs().await;
        assert_eq!(runs[0].outcome, Outcome::Completed);
        assert_eq!(runs[0].stopped_at, Some(unix(T0) + 13));
        assert!(!h.relay.is_active(1));
        assert!(h.relay.is_active(2));
        assert_eq!(h.relay.log().max_active, 1);
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let seq: Vec<i64> = (1..=8).map(|a| backoff(a).whole_seconds()).collect();
        assert_eq!(seq, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    // -- Manual commands --------------------------------------------------

    #[tokio::test]
    async fn manual_start_and_stop() {
        let mut h = harness(config(vec![])).await;
        h.start(1, 30, T0).await.unwrap();
        assert!(h.relay.is_active(1));
        assert_eq!(h.start(1, 30, T0).await, Err(CommandError::ZoneBusy(1)));

        h.stop(1, T0 + secs(5)).await.unwrap();
        assert!(!h.relay.is_active(1));
        let runs = h.runs().await;
        assert_eq!(runs[0].adjustment, Adjustment::Manual);
        assert_eq!(runs[0].outcome, Outcome::Stopped);
        assert_eq!(runs[0].stopped_at, Some(unix(T0) + 5));

        assert_eq!(h.stop(1, T0 + secs(6)).await, Err(CommandError::NotRunning(1)));
    }

    #[tokio::test]
    async fn manual_start_rejections() {
        let mut cfg = config(vec![]);
        cfg.zones[2].enabled = false;
        let mut h = harness(cfg).await;
        assert_eq!(h.start(9, 30, T0).await, Err(CommandError::UnknownZone(9)));
        assert_eq!(h.start(3, 30, T0).await, Err(CommandError::ZoneDisabled(3)));
        assert_eq!(h.start(1, 0, T0).await, Err(CommandError::InvalidDuration(0)));
        assert_eq!(
            h.start(1, MAX_MANUAL_SEC + 1, T0).await,
            Err(CommandError::InvalidDuration(MAX_MANUAL_SEC + 1))
        );
        assert!(h.runs().await.is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_pending_run() {
        let mut h = harness(config(vec![])).await;
        h.start(1, 30, T0).await.unwrap();
        h.start(2, 30, T0).await.unwrap();
        assert_eq!(h.shared.read().await.zones[&2].status, ZoneStatus::Pending);

        h.stop(2, T0 + secs(1)).await.unwrap();
        h.sched.expire_due(T0 + secs(30)).await;
        assert!(h.relay.log().activations.iter().all(|&z| z == 1));
        assert_eq!(h.runs().await.len(), 1);
    }

    // -- Shutdown ---------------------------------------------------------

    #[tokio::test]
    async fn shutdown_turns_zones_off_and_closes_records() {
        let mut h = harness(config(vec![])).await;
        h.start(1, 300, T0).await.unwrap();
        h.start(2, 300, T0).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let keep_going = h.sched.handle(Command::Shutdown { done: tx }, T0 + secs(5)).await;
        assert!(!keep_going);
        rx.await.unwrap();

        assert!(!h.relay.is_active(1));
        let runs = h.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Outcome::Shutdown);
        assert_eq!(runs[0].stopped_at, Some(unix(T0) + 5));
        assert!(History::open(h.db.clone()).await.unwrap().open_run(1).is_none());
    }

    #[tokio::test]
    async fn shutdown_leaves_record_open_when_relay_stuck() {
        let mut h = harness(config(vec![])).await;
        h.start(1, 300, T0).await.unwrap();
        h.relay.log().fail_deactivate = u32::MAX;

        h.sched.shutdown(T0 + secs(5)).await;
        assert!(h.runs().await[0].stopped_at.is_none());
        assert_eq!(h.faults.try_recv().unwrap().attempt, SHUTDOWN_ATTEMPTS);
    }
}
