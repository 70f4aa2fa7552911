mod engine;
mod error;
mod history;
mod types;

pub use engine::run_simulation;
pub use error::SimError;
pub use history::HistoricalTable;
pub use types::{
    DEFAULT_TRIALS, HORIZON_YEARS, MAX_TRIALS, HistoricalChange, HistoryWindow, SimulationConfig,
    SimulationResult, Summary, YearStats, year_labels,
};
