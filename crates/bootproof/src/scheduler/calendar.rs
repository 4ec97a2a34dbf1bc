use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};

use crate::model::WeeklySchedule;

const DAY: i64 = 86_400;

/// Device-local calendar used to map snapshot epochs onto the weekly
/// backup and verification bitmaps.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    offset: FixedOffset,
    backup_offset_secs: i64,
}

/// Hour-of-week slot, day 0 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekHour {
    pub day: u32,
    pub hour: u32,
}

impl Calendar {
    pub fn new(utc_offset_minutes: Option<i32>, backup_offset_minutes: i32) -> Self {
        let secs = match utc_offset_minutes {
            Some(m) => m.saturating_mul(60),
            None => chrono::Local::now().offset().local_minus_utc(),
        };
        let offset = FixedOffset::east_opt(secs).unwrap_or_else(|| {
            tracing::warn!(offset_secs = secs, "utc offset out of range, using UTC");
            Utc.fix()
        });
        Self {
            offset,
            backup_offset_secs: i64::from(backup_offset_minutes) * 60,
        }
    }

    pub fn utc() -> Self {
        Self::new(Some(0), 0)
    }

    fn local(&self, epoch: i64) -> NaiveDateTime {
        DateTime::from_timestamp(epoch, 0)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .naive_local()
    }

    pub fn date(&self, epoch: i64) -> NaiveDate {
        self.local(epoch).date()
    }

    pub fn same_day(&self, a: i64, b: i64) -> bool {
        self.date(a) == self.date(b)
    }

    /// Local wall-clock slot of `epoch`.
    pub fn week_hour(&self, epoch: i64) -> WeekHour {
        let t = self.local(epoch);
        WeekHour {
            day: t.weekday().num_days_from_sunday(),
            hour: t.hour(),
        }
    }

    /// Slot of `epoch` on the backup calendar, i.e. shifted back by the
    /// device backup offset.
    pub fn backup_week_hour(&self, epoch: i64) -> WeekHour {
        self.week_hour(epoch - self.backup_offset_secs)
    }

    /// Same day on the backup calendar.
    pub fn same_backup_day(&self, a: i64, b: i64) -> bool {
        self.same_day(a - self.backup_offset_secs, b - self.backup_offset_secs)
    }

    /// Same backup-calendar day and hour.
    pub fn same_backup_window(&self, a: i64, b: i64) -> bool {
        let (sa, sb) = (a - self.backup_offset_secs, b - self.backup_offset_secs);
        self.same_backup_day(a, b) && self.week_hour(sa).hour == self.week_hour(sb).hour
    }

    fn day_start(&self, epoch: i64) -> i64 {
        epoch - i64::from(self.local(epoch).num_seconds_from_midnight())
    }

    /// First backup slot strictly after `after`. Slots restart at each local
    /// midnight (shifted by the backup offset) and repeat every
    /// `interval_minutes`; a slot counts when its hour is set in `schedule`.
    pub fn next_scheduled_backup(
        &self,
        schedule: &WeeklySchedule,
        interval_minutes: u32,
        after: i64,
    ) -> Option<i64> {
        if schedule.is_empty() {
            return None;
        }
        let interval = i64::from(interval_minutes.max(1)) * 60;
        let shifted = after - self.backup_offset_secs;
        let mut day = self.day_start(shifted);
        for _ in 0..8 {
            let mut t = day;
            while t < day + DAY {
                let wh = self.week_hour(t);
                if t > shifted && schedule.is_set(wh.day, wh.hour) {
                    return Some(t + self.backup_offset_secs);
                }
                t += interval;
            }
            day += DAY;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-11-14 22:13:20 UTC, a Tuesday.
    const T: i64 = 1_700_000_000;
    const TUE_MIDNIGHT: i64 = 1_699_920_000;

    fn weekdays() -> WeeklySchedule {
        WeeklySchedule::with_hours(&[1, 2, 3, 4, 5], 8..19)
    }

    #[test]
    fn week_hour_follows_the_utc_offset() {
        assert_eq!(Calendar::utc().week_hour(T), WeekHour { day: 2, hour: 22 });
        assert_eq!(
            Calendar::new(Some(-300), 0).week_hour(T),
            WeekHour { day: 2, hour: 17 }
        );
        assert_eq!(
            Calendar::new(Some(180), 0).week_hour(T),
            WeekHour { day: 3, hour: 1 }
        );
    }

    #[test]
    fn backup_offset_shifts_the_slot_back() {
        let cal = Calendar::new(Some(0), 30);
        // 08:20 on the backup calendar is 07:50.
        let t = TUE_MIDNIGHT + 8 * 3600 + 20 * 60;
        assert_eq!(cal.backup_week_hour(t), WeekHour { day: 2, hour: 7 });
    }

    #[test]
    fn backup_day_starts_at_the_offset() {
        let cal = Calendar::new(Some(0), 30);
        let wed = TUE_MIDNIGHT + DAY;
        assert!(cal.same_day(wed + 10 * 60, wed + 50 * 60));
        assert!(!cal.same_backup_day(wed + 10 * 60, wed + 50 * 60));
        assert!(cal.same_backup_day(wed - 3600, wed + 10 * 60));
    }

    #[test]
    fn next_backup_after_last_slot_is_tomorrow_morning() {
        let cal = Calendar::utc();
        let next = cal.next_scheduled_backup(&weekdays(), 60, T);
        assert_eq!(next, Some(TUE_MIDNIGHT + DAY + 8 * 3600));
    }

    #[test]
    fn next_backup_during_business_hours_is_the_next_hour() {
        let cal = Calendar::utc();
        let after = TUE_MIDNIGHT + 10 * 3600 + 30 * 60;
        assert_eq!(
            cal.next_scheduled_backup(&weekdays(), 60, after),
            Some(TUE_MIDNIGHT + 11 * 3600)
        );
    }

    #[test]
    fn coarse_interval_skips_unscheduled_slots() {
        let cal = Calendar::utc();
        // Four-hour slots at 00, 04, 08, 12, 16, 20; only 8, 12, 16 are set.
        let after = TUE_MIDNIGHT + 16 * 3600 + 30 * 60;
        assert_eq!(
            cal.next_scheduled_backup(&weekdays(), 240, after),
            Some(TUE_MIDNIGHT + DAY + 8 * 3600)
        );
    }

    #[test]
    fn friday_evening_rolls_over_the_weekend() {
        let cal = Calendar::utc();
        let fri_evening = TUE_MIDNIGHT + 3 * DAY + 20 * 3600;
        assert_eq!(
            cal.next_scheduled_backup(&weekdays(), 60, fri_evening),
            Some(TUE_MIDNIGHT + 6 * DAY + 8 * 3600)
        );
        assert_eq!(
            cal.next_scheduled_backup(&WeeklySchedule::empty(), 60, T),
            None
        );
    }
}
