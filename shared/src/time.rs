//! Time period library
//!
//! Periods are value types describing recurring windows of time: time-of-day
//! intervals, day-of-week windows and recurring deltas, plus union and
//! intersection composites. Every period supports two primitives:
//!
//! - `contains(dt)`: is the instant inside the window?
//! - `rollback(dt)`: the most recent closed interval of the window ending at
//!   or before `dt`; if `dt` is inside the window the interval ends at `dt`.
//!
//! Intervals are closed on both ends: an instant equal to an endpoint is
//! inside the window.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use crate::utils::now_naive;

const MIDNIGHT: NaiveTime = NaiveTime::MIN;

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).expect("valid end-of-day time")
}

fn parse_clock(s: &str) -> crate::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| {
            crate::SchedulingError::Validation(format!("Invalid time of day '{}': {}", s, e)).into()
        })
}

/// A closed interval of time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeInterval {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        self.start <= dt && dt <= self.end
    }
}

/// A time-of-day interval on the local calendar.
///
/// `start > end` is interpreted as crossing midnight, `start == end` as a
/// full-day cycle anchored at that time and `None, None` as "always". An open
/// start means "from midnight", an open end "until end of day".
#[derive(Debug, Clone, PartialEq)]
pub struct TimeOfDay {
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

impl TimeOfDay {
    pub fn new(start: Option<NaiveTime>, end: Option<NaiveTime>) -> Self {
        Self { start, end }
    }

    /// Build from `"HH:MM"` (or `"HH:MM:SS"`) strings.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> crate::Result<Self> {
        let start = start.map(parse_clock).transpose()?;
        let end = end.map(parse_clock).transpose()?;
        Ok(Self::new(start, end))
    }

    fn is_always(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    fn effective(&self) -> (NaiveTime, NaiveTime) {
        (
            self.start.unwrap_or(MIDNIGHT),
            self.end.unwrap_or_else(end_of_day),
        )
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        if self.is_always() {
            return true;
        }
        let (start, end) = self.effective();
        let t = dt.time();
        if start == end {
            // Full cycle: every instant belongs to the window.
            true
        } else if start < end {
            start <= t && t <= end
        } else {
            // Overnight wrap
            t >= start || t <= end
        }
    }

    /// Most recent opening of the window at or before `dt`.
    fn prev_opening(&self, dt: NaiveDateTime) -> NaiveDateTime {
        let (start, _) = self.effective();
        if dt.time() >= start {
            dt.date().and_time(start)
        } else {
            let prev = dt.date().pred_opt().unwrap_or_else(|| dt.date());
            prev.and_time(start)
        }
    }

    /// Most recent closing of the window at or before `dt`; only meaningful
    /// when `dt` is outside the window.
    fn prev_closing(&self, dt: NaiveDateTime) -> NaiveDateTime {
        let (_, end) = self.effective();
        if dt.time() > end {
            dt.date().and_time(end)
        } else {
            let prev = dt.date().pred_opt().unwrap_or_else(|| dt.date());
            prev.and_time(end)
        }
    }

    pub fn rollback(&self, dt: NaiveDateTime) -> TimeInterval {
        if self.is_always() {
            return TimeInterval::new(NaiveDateTime::MIN, dt);
        }
        if self.contains(dt) {
            TimeInterval::new(self.prev_opening(dt), dt)
        } else {
            let closing = self.prev_closing(dt);
            TimeInterval::new(self.prev_opening(closing), closing)
        }
    }
}

/// A day-of-week window with whole-day granularity.
#[derive(Debug, Clone, PartialEq)]
pub struct WeekDays {
    days: Vec<Weekday>,
}

impl WeekDays {
    pub fn new(days: impl IntoIterator<Item = Weekday>) -> crate::Result<Self> {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        if days.is_empty() {
            return Err(crate::SchedulingError::Validation(
                "Day-of-week window needs at least one day".to_string(),
            )
            .into());
        }
        Ok(Self { days })
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        self.days.contains(&dt.weekday())
    }

    pub fn rollback(&self, dt: NaiveDateTime) -> TimeInterval {
        if self.contains(dt) {
            return TimeInterval::new(dt.date().and_time(MIDNIGHT), dt);
        }
        // Latest included full day before dt; the set is non-empty so at most
        // seven steps back are needed.
        let mut date = dt.date();
        for _ in 0..7 {
            match date.pred_opt() {
                Some(prev) => date = prev,
                None => break,
            }
            if self.days.contains(&date.weekday()) {
                return TimeInterval::new(date.and_time(MIDNIGHT), date.and_time(end_of_day()));
            }
        }
        TimeInterval::new(dt.date().and_time(MIDNIGHT), dt)
    }
}

/// A recurring delta: either a sliding "past N" window or, with a fixed
/// anchor, consecutive slots of the given length starting at the anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeDelta {
    length: Duration,
    anchor: Option<NaiveDateTime>,
}

impl TimeDelta {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            anchor: None,
        }
    }

    pub fn anchored(length: Duration, anchor: NaiveDateTime) -> Self {
        Self {
            length,
            anchor: Some(anchor),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::seconds(secs as i64))
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        match self.anchor {
            // Anchored slots tile the timeline.
            Some(_) => true,
            None => {
                let now = now_naive();
                dt >= now - self.length && dt <= now
            }
        }
    }

    pub fn rollback(&self, dt: NaiveDateTime) -> TimeInterval {
        match self.anchor {
            None => TimeInterval::new(dt - self.length, dt),
            Some(anchor) => {
                let len_ms = self.length.num_milliseconds().max(1);
                let offset_ms = (dt - anchor).num_milliseconds();
                let slot = offset_ms.div_euclid(len_ms);
                let slot_start = anchor + Duration::milliseconds(slot * len_ms);
                TimeInterval::new(slot_start, dt)
            }
        }
    }
}

/// A composable time window.
#[derive(Debug, Clone, PartialEq)]
pub enum TimePeriod {
    Always,
    Never,
    TimeOfDay(TimeOfDay),
    WeekDays(WeekDays),
    Delta(TimeDelta),
    /// One absolute range; an unset endpoint leaves that side unbounded.
    Span {
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    },
    /// Intersection of the member windows.
    All(Vec<TimePeriod>),
    /// Union of the member windows.
    Any(Vec<TimePeriod>),
}

impl TimePeriod {
    /// Time-of-day window from `"HH:MM"` strings.
    pub fn time_of_day(start: Option<&str>, end: Option<&str>) -> crate::Result<Self> {
        Ok(TimePeriod::TimeOfDay(TimeOfDay::parse(start, end)?))
    }

    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> crate::Result<Self> {
        Ok(TimePeriod::WeekDays(WeekDays::new(days)?))
    }

    /// Sliding window covering the past `secs` seconds.
    pub fn past_secs(secs: u64) -> Self {
        TimePeriod::Delta(TimeDelta::from_secs(secs))
    }

    /// Recurring slots of `length` anchored at `anchor`.
    pub fn every(length: Duration, anchor: NaiveDateTime) -> Self {
        TimePeriod::Delta(TimeDelta::anchored(length, anchor))
    }

    /// One absolute range; pass `None` for an unbounded endpoint.
    pub fn span(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        TimePeriod::Span { start, end }
    }

    pub fn contains(&self, dt: NaiveDateTime) -> bool {
        match self {
            TimePeriod::Always => true,
            TimePeriod::Never => false,
            TimePeriod::TimeOfDay(w) => w.contains(dt),
            TimePeriod::WeekDays(w) => w.contains(dt),
            TimePeriod::Delta(w) => w.contains(dt),
            TimePeriod::Span { start, end } => {
                start.map_or(true, |s| dt >= s) && end.map_or(true, |e| dt <= e)
            }
            TimePeriod::All(members) => members.iter().all(|p| p.contains(dt)),
            TimePeriod::Any(members) => members.iter().any(|p| p.contains(dt)),
        }
    }

    pub fn rollback(&self, dt: NaiveDateTime) -> TimeInterval {
        match self {
            TimePeriod::Always => TimeInterval::new(NaiveDateTime::MIN, dt),
            TimePeriod::Never => TimeInterval::new(dt, dt),
            TimePeriod::TimeOfDay(w) => w.rollback(dt),
            TimePeriod::WeekDays(w) => w.rollback(dt),
            TimePeriod::Delta(w) => w.rollback(dt),
            TimePeriod::Span { start, end } => {
                let lower = start.unwrap_or(NaiveDateTime::MIN);
                let upper = end.map_or(dt, |e| e.min(dt));
                TimeInterval::new(lower.min(upper), upper)
            }
            TimePeriod::All(members) => {
                let mut start = NaiveDateTime::MIN;
                let mut end = dt;
                for interval in members.iter().map(|p| p.rollback(dt)) {
                    start = start.max(interval.start);
                    end = end.min(interval.end);
                }
                if start > end {
                    start = end;
                }
                TimeInterval::new(start, end)
            }
            TimePeriod::Any(members) => {
                let mut start = dt;
                let mut end = NaiveDateTime::MIN;
                for interval in members.iter().map(|p| p.rollback(dt)) {
                    start = start.min(interval.start);
                    end = end.max(interval.end);
                }
                if end < start {
                    end = start;
                }
                TimeInterval::new(start, end)
            }
        }
    }
}
