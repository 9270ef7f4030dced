//! Zone and schedule tables plus trigger evaluation.
//!
//! A schedule fires at most once per site-local day, at its start time, on
//! days allowed by its month filter and `every_days` recurrence. Recurrence
//! counts site-local calendar days from the date of the last trigger that
//! fired or was missed. That date is recovered from the run recorded under
//! the trigger key, so a restart never re-fires a trigger that already
//! produced a run.

use serde::Serialize;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::config::ScheduleEntry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: u8,
    pub name: String,
    pub enabled: bool,
    pub baseline_sec: i64,
    pub gpio_pin: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub zone_id: u8,
    pub start: Time,
    pub every_days: u32,
    pub months: Vec<u8>,
    pub duration_sec: Option<i64>,
    pub weather_adjust: bool,
}

/// Outcome of checking one schedule against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCheck {
    /// Not a watering day (month filter or recurrence).
    NotToday,
    /// Today's start time has not arrived.
    NotYet,
    /// Today's trigger already fired or was recorded missed.
    Done,
    Due { at: OffsetDateTime },
    /// Due, but the catch-up window has elapsed.
    Missed { at: OffsetDateTime },
}

/// Parse a 24-hour "HH:MM" string.
pub fn parse_hh_mm(s: &str) -> Option<Time> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || m.len() != 2 {
        return None;
    }
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    Time::from_hms(h, m, 0).ok()
}

impl Schedule {
    pub fn from_entry(e: &ScheduleEntry) -> Option<Self> {
        Some(Self {
            zone_id: e.zone_id,
            start: parse_hh_mm(&e.start)?,
            every_days: e.every_days.max(1),
            months: e.months.clone(),
            duration_sec: e.duration_sec,
            weather_adjust: e.weather_adjust,
        })
    }

    /// Stable identity persisted on the run records this schedule produces.
    pub fn key(&self) -> String {
        format!(
            "{}@{:02}:{:02}",
            self.zone_id,
            self.start.hour(),
            self.start.minute()
        )
    }

    pub fn active_in(&self, month: Month) -> bool {
        self.months.is_empty() || self.months.contains(&(month as u8))
    }

    pub fn trigger_on(&self, date: Date, offset: UtcOffset) -> OffsetDateTime {
        PrimitiveDateTime::new(date, self.start).assume_offset(offset)
    }

    /// Site-local date of the trigger a run started at `started` belongs
    /// to: the latest start instant at or before it. Exact while runs start
    /// less than a day after their trigger.
    pub fn trigger_date(&self, started: OffsetDateTime, offset: UtcOffset) -> Date {
        let local = started.to_offset(offset);
        if local.time() >= self.start {
            local.date()
        } else {
            local.date().previous_day().unwrap_or(local.date())
        }
    }

    /// `last_date` is the site-local date of the last trigger consumed
    /// (fired or missed).
    pub fn evaluate(
        &self,
        now: OffsetDateTime,
        offset: UtcOffset,
        last_date: Option<Date>,
        catch_up: Duration,
    ) -> TriggerCheck {
        let today = now.to_offset(offset).date();
        if !self.active_in(today.month()) {
            return TriggerCheck::NotToday;
        }

        if let Some(last) = last_date {
            if last >= today {
                return TriggerCheck::Done;
            }
            if (today - last).whole_days() < i64::from(self.every_days) {
                return TriggerCheck::NotToday;
            }
        }

        let at = self.trigger_on(today, offset);

        if now < at {
            TriggerCheck::NotYet
        } else if now - at > catch_up {
            TriggerCheck::Missed { at }
        } else {
            TriggerCheck::Due { at }
        }
    }
}

/// Build the schedule table ordered by start time so that, for one zone,
/// the earliest trigger of the day is considered first.
pub fn schedule_table(entries: &[ScheduleEntry]) -> Vec<Schedule> {
    let mut table: Vec<Schedule> = entries.iter().filter_map(Schedule::from_entry).collect();
    table.sort_by_key(|s| (s.start, s.zone_id));
    table
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset, time};

    fn daily_at_six() -> Schedule {
        Schedule {
            zone_id: 1,
            start: time!(06:00),
            every_days: 1,
            months: vec![],
            duration_sec: None,
            weather_adjust: true,
        }
    }

    const CATCH_UP: Duration = Duration::hours(2);

    // -- parse_hh_mm ------------------------------------------------------

    #[test]
    fn parse_hh_mm_valid() {
        assert_eq!(parse_hh_mm("06:30"), Some(time!(06:30)));
        assert_eq!(parse_hh_mm(" 6:05 "), Some(time!(06:05)));
        assert_eq!(parse_hh_mm("23:59"), Some(time!(23:59)));
    }

    #[test]
    fn parse_hh_mm_invalid() {
        assert_eq!(parse_hh_mm("24:00"), None);
        assert_eq!(parse_hh_mm("12:60"), None);
        assert_eq!(parse_hh_mm("12:5"), None);
        assert_eq!(parse_hh_mm("noon"), None);
        assert_eq!(parse_hh_mm(""), None);
    }

    #[test]
    fn key_is_zone_and_start() {
        assert_eq!(daily_at_six().key(), "1@06:00");
    }

    // -- evaluate ---------------------------------------------------------

    #[test]
    fn before_start_is_not_yet() {
        let check = daily_at_six().evaluate(datetime!(2026-06-01 05:59 UTC), offset!(UTC), None, CATCH_UP);
        assert_eq!(check, TriggerCheck::NotYet);
    }

    #[test]
    fn at_start_is_due() {
        let check = daily_at_six().evaluate(datetime!(2026-06-01 06:00 UTC), offset!(UTC), None, CATCH_UP);
        assert_eq!(
            check,
            TriggerCheck::Due {
                at: datetime!(2026-06-01 06:00 UTC)
            }
        );
    }

    #[test]
    fn already_fired_today_is_done() {
        let check = daily_at_six().evaluate(
            datetime!(2026-06-01 06:30 UTC),
            offset!(UTC),
            Some(date!(2026-06-01)),
            CATCH_UP,
        );
        assert_eq!(check, TriggerCheck::Done);
    }

    #[test]
    fn fired_yesterday_is_due_again() {
        let check = daily_at_six().evaluate(
            datetime!(2026-06-02 06:00:10 UTC),
            offset!(UTC),
            Some(date!(2026-06-01)),
            CATCH_UP,
        );
        assert!(matches!(check, TriggerCheck::Due { .. }));
    }

    #[test]
    fn late_start_maps_to_its_trigger_date() {
        let s = daily_at_six();
        // Queued behind other zones, began at 08:30.
        assert_eq!(
            s.trigger_date(datetime!(2026-06-01 08:30 UTC), offset!(UTC)),
            date!(2026-06-01)
        );
        assert_eq!(
            s.trigger_date(datetime!(2026-06-01 06:00 UTC), offset!(UTC)),
            date!(2026-06-01)
        );
        // Before the start time belongs to the previous day's trigger.
        assert_eq!(
            s.trigger_date(datetime!(2026-06-02 01:00 UTC), offset!(UTC)),
            date!(2026-06-01)
        );
        // Site-local: 04:00 UTC is 22:00 the day before at UTC-6.
        assert_eq!(
            s.trigger_date(datetime!(2026-06-02 04:00 UTC), offset!(-6)),
            date!(2026-05-31)
        );
    }

    #[test]
    fn missed_yesterday_is_due_again_today() {
        // Yesterday was consumed as missed well after its start time.
        let s = daily_at_six();
        let last = Some(s.trigger_date(datetime!(2026-06-01 06:00 UTC), offset!(UTC)));
        let check = s.evaluate(datetime!(2026-06-02 06:00 UTC), offset!(UTC), last, CATCH_UP);
        assert!(matches!(check, TriggerCheck::Due { .. }));
    }

    #[test]
    fn every_other_day_counts_calendar_days() {
        let s = Schedule {
            start: time!(21:00),
            every_days: 2,
            ..daily_at_six()
        };
        // The last run started 90 min late. Two dates on the trigger is due
        // again although fewer than 48 h have passed since that run.
        let last = Some(s.trigger_date(datetime!(2026-06-01 22:30 UTC), offset!(UTC)));
        let check = s.evaluate(datetime!(2026-06-03 21:00 UTC), offset!(UTC), last, CATCH_UP);
        assert!(matches!(check, TriggerCheck::Due { .. }));
    }

    #[test]
    fn every_other_day_skips_intervening_day() {
        let s = Schedule {
            every_days: 2,
            ..daily_at_six()
        };
        let last = Some(date!(2026-06-01));
        let day2 = s.evaluate(datetime!(2026-06-02 06:00 UTC), offset!(UTC), last, CATCH_UP);
        assert_eq!(day2, TriggerCheck::NotToday);
        let day3 = s.evaluate(datetime!(2026-06-03 06:00 UTC), offset!(UTC), last, CATCH_UP);
        assert!(matches!(day3, TriggerCheck::Due { .. }));
    }

    #[test]
    fn month_filter_excludes_winter() {
        let s = Schedule {
            months: vec![5, 6, 7, 8, 9],
            ..daily_at_six()
        };
        let jan = s.evaluate(datetime!(2026-01-10 06:00 UTC), offset!(UTC), None, CATCH_UP);
        assert_eq!(jan, TriggerCheck::NotToday);
        let jun = s.evaluate(datetime!(2026-06-10 06:00 UTC), offset!(UTC), None, CATCH_UP);
        assert!(matches!(jun, TriggerCheck::Due { .. }));
    }

    #[test]
    fn past_catch_up_window_is_missed() {
        let check = daily_at_six().evaluate(datetime!(2026-06-01 08:01 UTC), offset!(UTC), None, CATCH_UP);
        assert_eq!(
            check,
            TriggerCheck::Missed {
                at: datetime!(2026-06-01 06:00 UTC)
            }
        );
    }

    #[test]
    fn start_time_is_site_local() {
        // 06:00 at UTC-6 is 12:00 UTC.
        let site = offset!(-6);
        let early = daily_at_six().evaluate(datetime!(2026-06-01 11:59 UTC), site, None, CATCH_UP);
        assert_eq!(early, TriggerCheck::NotYet);
        let due = daily_at_six().evaluate(datetime!(2026-06-01 12:00 UTC), site, None, CATCH_UP);
        assert!(matches!(due, TriggerCheck::Due { .. }));
    }

    #[test]
    fn table_orders_by_start_time() {
        let entries = vec![
            ScheduleEntry {
                zone_id: 2,
                start: "18:00".into(),
                every_days: 1,
                months: vec![],
                duration_sec: None,
                weather_adjust: true,
            },
            ScheduleEntry {
                zone_id: 2,
                start: "06:00".into(),
                every_days: 1,
                months: vec![],
                duration_sec: Some(300),
                weather_adjust: false,
            },
        ];
        let table = schedule_table(&entries);
        assert_eq!(table[0].key(), "2@06:00");
        assert_eq!(table[1].key(), "2@18:00");
    }
}
