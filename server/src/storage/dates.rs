/*
 * Created on Mon Feb 19 2024
 *
 * This file is a part of uptimed
 * uptimed is a free and open-source uptime monitoring daemon that probes
 * user-defined services, records the downtime intervals between healthy
 * and failed states and consolidates them into per-service SLA figures.
 *
 * Copyright (c) 2024, The uptimed authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Period arithmetic for the consolidation engine. Days and weeks have a
//! fixed length; months advance by calendar month, so their length varies
//! between 28 and 31 days. Weeks are ISO weeks and therefore anchor on
//! Monday. All timestamps are whole seconds since the epoch, interpreted
//! in UTC

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};

pub const DAY_SECONDS: i64 = 86_400;
pub const WEEK_SECONDS: i64 = 7 * DAY_SECONDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The three consolidation period kinds
pub enum PeriodKind {
    Daily,
    Weekly,
    Monthly,
}

impl PeriodKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
    /// Length in seconds of the period starting at `period_start`
    pub fn length_at(self, period_start: i64) -> i64 {
        match self {
            Self::Daily => DAY_SECONDS,
            Self::Weekly => WEEK_SECONDS,
            Self::Monthly => add_months(period_start, 1) - period_start,
        }
    }
    /// The period boundary one period after `ts`
    pub fn next(self, ts: i64) -> i64 {
        match self {
            Self::Daily => ts + DAY_SECONDS,
            Self::Weekly => ts + WEEK_SECONDS,
            Self::Monthly => add_months(ts, 1),
        }
    }
    /// The period boundary one period before `ts`
    pub fn previous(self, ts: i64) -> i64 {
        match self {
            Self::Daily => ts - DAY_SECONDS,
            Self::Weekly => ts - WEEK_SECONDS,
            Self::Monthly => add_months(ts, -1),
        }
    }
    /// Watermark anchor when the store has none: the start of the period
    /// containing `now`. Daily periods start at midnight, weekly periods
    /// on the Monday of the ISO week, monthly periods on the first of the
    /// month
    pub fn anchor(self, now: i64) -> i64 {
        let Some(date) = date_of(now) else {
            return now;
        };
        let start = match self {
            Self::Daily => Some(date),
            Self::Weekly => {
                let iso = date.iso_week();
                NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
            }
            Self::Monthly => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
        };
        start.map(midnight_ts).unwrap_or(now)
    }
}

impl std::fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shift `ts` by whole calendar months, clamping the day to the target
/// month's length (Jan 31 + 1 month = Feb 28/29)
pub fn add_months(ts: i64, months: i32) -> i64 {
    let Some(datetime) = DateTime::<Utc>::from_timestamp(ts, 0) else {
        return ts;
    };
    let date = datetime.date_naive();
    let zero_based = date.year() * 12 + date.month0() as i32 + months;
    let year = zero_based.div_euclid(12);
    let month = zero_based.rem_euclid(12) as u32 + 1;
    let day = date.day().min(days_in_month(year, month));
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(shifted) => {
            let secs_into_day = i64::from(datetime.time().num_seconds_from_midnight());
            midnight_ts(shifted) + secs_into_day
        }
        None => ts,
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next) {
        (Some(first), Some(next)) => (next - first).num_days() as u32,
        _ => 30,
    }
}

fn date_of(ts: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

fn midnight_ts(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn ts_for_ymd(year: i32, month: u32, day: u32) -> i64 {
    midnight_ts(NaiveDate::from_ymd_opt(year, month, day).unwrap())
}

#[cfg(test)]
mod tests {
    use super::{add_months, ts_for_ymd, PeriodKind, DAY_SECONDS, WEEK_SECONDS};

    #[test]
    fn month_addition_rolls_over_the_year() {
        assert_eq!(add_months(ts_for_ymd(2023, 12, 1), 1), ts_for_ymd(2024, 1, 1));
        assert_eq!(add_months(ts_for_ymd(2024, 1, 1), -1), ts_for_ymd(2023, 12, 1));
    }

    #[test]
    fn month_addition_clamps_the_day() {
        assert_eq!(add_months(ts_for_ymd(2024, 1, 31), 1), ts_for_ymd(2024, 2, 29));
        assert_eq!(add_months(ts_for_ymd(2023, 1, 31), 1), ts_for_ymd(2023, 2, 28));
    }

    #[test]
    fn monthly_period_length_varies() {
        // february of a leap year
        assert_eq!(
            PeriodKind::Monthly.length_at(ts_for_ymd(2024, 2, 1)),
            29 * DAY_SECONDS
        );
        assert_eq!(
            PeriodKind::Monthly.length_at(ts_for_ymd(2024, 3, 1)),
            31 * DAY_SECONDS
        );
    }

    #[test]
    fn previous_month_of_a_first_is_the_previous_first() {
        assert_eq!(
            PeriodKind::Monthly.previous(ts_for_ymd(2024, 3, 1)),
            ts_for_ymd(2024, 2, 1)
        );
    }

    #[test]
    fn weekly_anchor_is_the_iso_monday() {
        // 2024-01-04 is the Thursday of ISO week 1, which began on
        // 2024-01-01
        assert_eq!(
            PeriodKind::Weekly.anchor(ts_for_ymd(2024, 1, 4) + 3600),
            ts_for_ymd(2024, 1, 1)
        );
        // 2023-01-01 is a Sunday and belongs to ISO week 52 of 2022
        assert_eq!(
            PeriodKind::Weekly.anchor(ts_for_ymd(2023, 1, 1)),
            ts_for_ymd(2022, 12, 26)
        );
    }

    #[test]
    fn daily_and_monthly_anchors() {
        let midday = ts_for_ymd(2024, 3, 5) + 12 * 3600;
        assert_eq!(PeriodKind::Daily.anchor(midday), ts_for_ymd(2024, 3, 5));
        assert_eq!(PeriodKind::Monthly.anchor(midday), ts_for_ymd(2024, 3, 1));
    }

    #[test]
    fn fixed_length_periods() {
        let ts = ts_for_ymd(2024, 3, 4);
        assert_eq!(PeriodKind::Daily.next(ts), ts + DAY_SECONDS);
        assert_eq!(PeriodKind::Weekly.next(ts), ts + WEEK_SECONDS);
        assert_eq!(PeriodKind::Weekly.previous(ts), ts - WEEK_SECONDS);
    }
}
