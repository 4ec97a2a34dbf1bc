use serde::{Deserialize, Serialize};

pub const HOURS_MASK: u32 = (1 << 24) - 1;

/// Hour bitmap for one week. `days[0]` is Sunday; bit `h` is hour `h`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule {
    days: [u32; 7],
}

impl WeeklySchedule {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            days: [HOURS_MASK; 7],
        }
    }

    pub fn from_days(days: [u32; 7]) -> Self {
        let mut days = days;
        for d in &mut days {
            *d &= HOURS_MASK;
        }
        Self { days }
    }

    /// Set `hours` on each of `days` (0 = Sunday).
    pub fn with_hours(days: &[u32], hours: std::ops::Range<u32>) -> Self {
        let mut s = Self::empty();
        for &d in days {
            for h in hours.clone() {
                s.set(d, h, true);
            }
        }
        s
    }

    pub fn is_set(&self, day: u32, hour: u32) -> bool {
        day < 7 && hour < 24 && self.days[day as usize] & (1 << hour) != 0
    }

    pub fn set(&mut self, day: u32, hour: u32, on: bool) {
        if day >= 7 || hour >= 24 {
            return;
        }
        let bit = 1 << hour;
        if on {
            self.days[day as usize] |= bit;
        } else {
            self.days[day as usize] &= !bit;
        }
    }

    pub fn hours_on(&self, day: u32) -> u32 {
        if day >= 7 {
            return 0;
        }
        self.days[day as usize].count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(|d| *d == 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOption {
    Never,
    Offsite,
    FirstPoint,
    #[default]
    LastPoint,
    CustomSchedule,
}

impl ScheduleOption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Offsite => "offsite",
            Self::FirstPoint => "first_point",
            Self::LastPoint => "last_point",
            Self::CustomSchedule => "custom_schedule",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_business_hours() {
        let s = WeeklySchedule::with_hours(&[1, 2, 3, 4, 5], 8..19);
        assert!(s.is_set(2, 8));
        assert!(s.is_set(2, 18));
        assert!(!s.is_set(2, 19));
        assert!(!s.is_set(0, 12));
        assert_eq!(s.hours_on(3), 11);
        assert_eq!(s.hours_on(6), 0);
    }

    #[test]
    fn out_of_range_bits_are_ignored() {
        let mut s = WeeklySchedule::from_days([u32::MAX; 7]);
        assert_eq!(s.hours_on(0), 24);
        s.set(7, 0, true);
        s.set(0, 24, false);
        assert!(!s.is_set(7, 0));
        assert_eq!(s.hours_on(0), 24);
    }
}
