use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    /// The requested history window selects no year-over-year changes.
    #[error("no historical changes between {start_year} and {end_year}; widen the history window")]
    EmptyPopulation { start_year: i32, end_year: i32 },
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    /// The index table is unusable; only raised while loading it.
    #[error("malformed historical index table: {0}")]
    MalformedHistoricalTable(String),
}
