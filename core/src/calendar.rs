//! Simulation calendar — expands the configured horizon into ordered years
//! and maps in-year positions onto effective dates.
//!
//! RULE: Years are consumed strictly in ascending order. A year's
//! effective dates never leave that calendar year.

use crate::types::SimulationYear;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Earliest and latest years accepted by configuration validation.
pub const MIN_YEAR: SimulationYear = 1900;
pub const MAX_YEAR: SimulationYear = 2200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulationHorizon {
    pub start_year: SimulationYear,
    pub end_year:   SimulationYear,
}

impl SimulationHorizon {
    pub fn new(start_year: SimulationYear, end_year: SimulationYear) -> Self {
        Self { start_year, end_year }
    }

    /// Ordered years start..=end. Empty when end < start.
    pub fn years(&self) -> Vec<SimulationYear> {
        (self.start_year..=self.end_year).collect()
    }

    pub fn contains(&self, year: SimulationYear) -> bool {
        (self.start_year..=self.end_year).contains(&year)
    }

    pub fn len(&self) -> usize {
        self.years().len()
    }

    pub fn is_empty(&self) -> bool {
        self.end_year < self.start_year
    }
}

pub fn year_start(year: SimulationYear) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn year_end(year: SimulationYear) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(NaiveDate::MAX)
}

pub fn days_in_year(year: SimulationYear) -> u32 {
    year_end(year).ordinal()
}

/// The date `day_index` days after January 1 (clamped to December 31).
pub fn date_in_year(year: SimulationYear, day_index: u32) -> NaiveDate {
    let ordinal = (day_index + 1).min(days_in_year(year));
    NaiveDate::from_yo_opt(year, ordinal).unwrap_or_else(|| year_end(year))
}

/// Months from January through `date`, counting the month of `date`.
pub fn months_until(date: NaiveDate) -> u32 {
    date.month()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_index_is_clamped_to_year_end() {
        assert_eq!(date_in_year(2025, 0), year_start(2025));
        assert_eq!(date_in_year(2025, 400), year_end(2025));
        assert_eq!(days_in_year(2024), 366);
    }

    #[test]
    fn horizon_years_are_ordered() {
        let h = SimulationHorizon::new(2025, 2027);
        assert_eq!(h.years(), vec![2025, 2026, 2027]);
        assert!(SimulationHorizon::new(2027, 2025).is_empty());
    }
}
