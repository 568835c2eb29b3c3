//! Validation policies: how a store partition is split into train and
//! validation slices.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    /// First day (inclusive)
    pub start: NaiveDate,
    /// Last day (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the range is inverted.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInput(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether `date` falls inside the range.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Rule deriving the train/validation split of a store partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Explicit train and validation windows.
    DateRange {
        /// First training day
        train_start: NaiveDate,
        /// Last training day
        train_end: NaiveDate,
        /// First validation day
        valid_start: NaiveDate,
        /// Last validation day
        valid_end: NaiveDate,
    },
    /// Rolling-window cutoff: train up to and including `cutoff`, validate on
    /// the following `horizon_days`.
    Cutoff {
        /// Last training day
        cutoff: NaiveDate,
        /// Validation window length in days
        horizon_days: u32,
        /// Optional training window length; unbounded history when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lookback_days: Option<u32>,
    },
}

impl ValidationPolicy {
    /// Resolve into concrete `(train, validation)` date ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for inverted windows, a zero horizon, or a
    /// window that leaves the calendar range.
    pub fn resolve(&self) -> Result<(DateRange, DateRange)> {
        match *self {
            Self::DateRange {
                train_start,
                train_end,
                valid_start,
                valid_end,
            } => Ok((
                DateRange::new(train_start, train_end)?,
                DateRange::new(valid_start, valid_end)?,
            )),
            Self::Cutoff {
                cutoff,
                horizon_days,
                lookback_days,
            } => {
                if horizon_days == 0 {
                    return Err(Error::InvalidInput(
                        "cutoff policy needs horizon_days >= 1".to_string(),
                    ));
                }
                let train_start = match lookback_days {
                    Some(0) => {
                        return Err(Error::InvalidInput(
                            "cutoff policy needs lookback_days >= 1".to_string(),
                        ))
                    }
                    Some(days) => cutoff
                        .checked_sub_days(Days::new(u64::from(days) - 1))
                        .ok_or_else(|| out_of_range("lookback_days", cutoff, days))?,
                    None => NaiveDate::MIN,
                };
                let valid_start = cutoff
                    .checked_add_days(Days::new(1))
                    .ok_or_else(|| out_of_range("horizon_days", cutoff, 1))?;
                let valid_end = cutoff
                    .checked_add_days(Days::new(u64::from(horizon_days)))
                    .ok_or_else(|| out_of_range("horizon_days", cutoff, horizon_days))?;
                Ok((
                    DateRange::new(train_start, cutoff)?,
                    DateRange::new(valid_start, valid_end)?,
                ))
            }
        }
    }
}

fn out_of_range(field: &str, cutoff: NaiveDate, days: u32) -> Error {
    Error::InvalidInput(format!(
        "{field} = {days} from cutoff {cutoff} is out of calendar range"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_cutoff_resolves_adjacent_windows() {
        let policy = ValidationPolicy::Cutoff {
            cutoff: date(2017, 6, 30),
            horizon_days: 15,
            lookback_days: Some(30),
        };
        let (train, valid) = policy.resolve().unwrap();
        assert_eq!(train.start, date(2017, 6, 1));
        assert_eq!(train.end, date(2017, 6, 30));
        assert_eq!(valid.start, date(2017, 7, 1));
        assert_eq!(valid.end, date(2017, 7, 15));
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let policy = ValidationPolicy::DateRange {
            train_start: date(2017, 2, 1),
            train_end: date(2017, 1, 1),
            valid_start: date(2017, 3, 1),
            valid_end: date(2017, 3, 31),
        };
        assert!(policy.resolve().is_err());
    }

    #[test]
    fn test_policy_json_shape() {
        let policy: ValidationPolicy = serde_json::from_str(
            r#"{"type": "cutoff", "cutoff": "2017-06-30", "horizon_days": 7}"#,
        )
        .unwrap();
        let (train, _) = policy.resolve().unwrap();
        assert_eq!(train.start, NaiveDate::MIN);
    }

    #[test]
    fn test_horizon_beyond_calendar_is_error() {
        let policy = ValidationPolicy::Cutoff {
            cutoff: date(2017, 6, 30),
            horizon_days: 4_000_000_000,
            lookback_days: None,
        };
        let err = policy.resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("horizon_days")));
    }

    #[test]
    fn test_lookback_beyond_calendar_is_error() {
        let policy = ValidationPolicy::Cutoff {
            cutoff: date(2017, 6, 30),
            horizon_days: 7,
            lookback_days: Some(u32::MAX),
        };
        let err = policy.resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("lookback_days")));
    }

    #[test]
    fn test_cutoff_at_calendar_end_is_error() {
        let policy = ValidationPolicy::Cutoff {
            cutoff: NaiveDate::MAX,
            horizon_days: 1,
            lookback_days: Some(1),
        };
        assert!(matches!(policy.resolve(), Err(Error::InvalidInput(_))));
    }
}
