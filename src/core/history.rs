use std::sync::LazyLock;

use super::error::SimError;
use super::types::{HistoricalChange, HistoryWindow};

const DEFAULT_WINDOW_YEARS: usize = 5;

/// Housing cost index by calendar year. New years are appended at the end.
const INDEX_DATA: &[(i32, f64)] = &[
    (2003, 1572.0),
    (2004, 1587.0),
    (2005, 1594.0),
    (2006, 1618.0),
    (2007, 1660.0),
    (2008, 1730.0),
    (2009, 1730.0),
    (2010, 1751.0),
    (2011, 1812.0),
    (2012, 1863.0),
    (2013, 1890.0),
    (2014, 1910.0),
    (2015, 1906.0),
    (2016, 1913.0),
    (2017, 1927.0),
    (2018, 1948.0),
    (2019, 1968.0),
    (2020, 1974.0),
    (2021, 2017.0),
    (2022, 2161.0),
    (2023, 2296.0),
];

static BUNDLED: LazyLock<Result<HistoricalTable, SimError>> =
    LazyLock::new(|| HistoricalTable::from_index(INDEX_DATA));

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalTable {
    changes: Vec<HistoricalChange>,
}

impl HistoricalTable {
    /// The compiled-in index table, derived once per process.
    pub fn bundled() -> Result<&'static HistoricalTable, SimError> {
        BUNDLED.as_ref().map_err(Clone::clone)
    }

    /// Derives year-over-year changes from `(year, index)` pairs. Years must be
    /// strictly consecutive and there must be at least two of them.
    pub fn from_index(index: &[(i32, f64)]) -> Result<Self, SimError> {
        if index.len() < 2 {
            return Err(SimError::MalformedHistoricalTable(format!(
                "need at least 2 years, got {}",
                index.len()
            )));
        }

        for &(year, value) in index {
            if !value.is_finite() || value <= 0.0 {
                return Err(SimError::MalformedHistoricalTable(format!(
                    "index for {year} must be a finite number > 0, got {value}"
                )));
            }
        }

        let mut changes = Vec::with_capacity(index.len() - 1);
        for pair in index.windows(2) {
            let (prev_year, prev) = pair[0];
            let (year, curr) = pair[1];
            if year != prev_year + 1 {
                return Err(SimError::MalformedHistoricalTable(format!(
                    "expected {} after {prev_year}, found {year}",
                    prev_year + 1
                )));
            }
            changes.push(HistoricalChange {
                year,
                change: (curr - prev) / prev * 100.0,
            });
        }

        Ok(Self { changes })
    }

    pub fn changes(&self) -> &[HistoricalChange] {
        &self.changes
    }

    /// Years that carry a derived change, i.e. valid window endpoints.
    pub fn available_years(&self) -> Vec<i32> {
        self.changes.iter().map(|c| c.year).collect()
    }

    pub fn default_window(&self) -> HistoryWindow {
        let years = self.available_years();
        let start = years[years.len().saturating_sub(DEFAULT_WINDOW_YEARS)];
        HistoryWindow::new(start, years[years.len() - 1])
    }

    /// Sampling population for `window`, in year order.
    pub fn window(&self, window: HistoryWindow) -> Result<Vec<f64>, SimError> {
        let population = self
            .changes
            .iter()
            .filter(|c| window.contains(c.year))
            .map(|c| c.change)
            .collect::<Vec<_>>();

        if population.is_empty() {
            let (start_year, end_year) = window.normalized();
            return Err(SimError::EmptyPopulation {
                start_year,
                end_year,
            });
        }
        Ok(population)
    }
}
