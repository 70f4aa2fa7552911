//! Working configuration plus named comparison scenarios, optionally backed by a JSON
//! file holding a `workspace` entry and a `scenarios` entry.
//!
//! Simulations never run against a borrowed `Session`: callers take a
//! [`ProjectionInput`] snapshot, run it, and write the outcome back afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::{
    HistoricalTable, SimError, SimulationConfig, SimulationResult, Summary, run_simulation,
    year_labels,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("scenario name must not be empty")]
    EmptyName,
    #[error(transparent)]
    Simulation(#[from] SimError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedScenario {
    pub name: String,
    pub config: SimulationConfig,
    /// Median series computed when the scenario was saved.
    pub medians: Vec<f64>,
}

impl SavedScenario {
    /// Names are trimmed and must not end up empty.
    pub fn new(
        name: &str,
        config: SimulationConfig,
        result: &SimulationResult,
    ) -> Result<Self, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        Ok(Self {
            name: name.to_string(),
            config,
            medians: result.medians(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSeries {
    pub name: String,
    pub medians: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub labels: Vec<String>,
    pub main: SimulationResult,
    pub baseline: Option<SimulationResult>,
    pub comparisons: Vec<ComparisonSeries>,
    pub summary: Summary,
}

/// Runs `config` and, when asked, its unconstrained baseline. Either both succeed or
/// nothing is returned.
pub fn build_projection(
    table: &HistoricalTable,
    config: &SimulationConfig,
    include_baseline: bool,
    comparisons: Vec<ComparisonSeries>,
) -> Result<Projection, SimError> {
    let main = run_simulation(table, config)?;
    let baseline = if include_baseline {
        Some(run_simulation(table, &config.baseline())?)
    } else {
        None
    };
    let summary = main.summary();

    Ok(Projection {
        labels: year_labels(),
        main,
        baseline,
        comparisons,
        summary,
    })
}

/// Everything needed to project a session's state, detached from the session.
#[derive(Debug, Clone)]
pub struct ProjectionInput<'a> {
    pub table: &'a HistoricalTable,
    pub config: SimulationConfig,
    pub comparisons: Vec<ComparisonSeries>,
}

impl ProjectionInput<'_> {
    pub fn run(&self, include_baseline: bool) -> Result<Projection, SimError> {
        build_projection(
            self.table,
            &self.config,
            include_baseline,
            self.comparisons.clone(),
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredState {
    workspace: Option<SimulationConfig>,
    #[serde(default)]
    scenarios: Vec<SavedScenario>,
}

#[derive(Debug)]
pub struct Session<'a> {
    table: &'a HistoricalTable,
    workspace: SimulationConfig,
    scenarios: BTreeMap<String, SavedScenario>,
    store_path: Option<PathBuf>,
}

impl<'a> Session<'a> {
    pub fn new(table: &'a HistoricalTable, workspace: SimulationConfig) -> Self {
        Self {
            table,
            workspace,
            scenarios: BTreeMap::new(),
            store_path: None,
        }
    }

    /// Restores a session from `path`, falling back to `default_workspace` when the
    /// file does not exist yet. Later mutations are written back to `path`.
    pub fn open(
        table: &'a HistoricalTable,
        path: impl AsRef<Path>,
        default_workspace: SimulationConfig,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str::<StoredState>(&raw)?
        } else {
            StoredState::default()
        };
        debug!(
            path = %path.display(),
            scenarios = state.scenarios.len(),
            restored_workspace = state.workspace.is_some(),
            "opened session store"
        );

        Ok(Self {
            table,
            workspace: state.workspace.unwrap_or(default_workspace),
            scenarios: state
                .scenarios
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            store_path: Some(path),
        })
    }

    pub fn workspace(&self) -> &SimulationConfig {
        &self.workspace
    }

    /// Replaces the working config. Only call this with a config that simulated
    /// successfully.
    pub fn set_workspace(&mut self, config: SimulationConfig) -> Result<(), StoreError> {
        self.workspace = config;
        self.persist()
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &SavedScenario> {
        self.scenarios.values()
    }

    pub fn comparisons(&self) -> Vec<ComparisonSeries> {
        self.scenarios
            .values()
            .map(|s| ComparisonSeries {
                name: s.name.clone(),
                medians: s.medians.clone(),
            })
            .collect()
    }

    /// Working config and saved comparisons, ready to run without the session.
    pub fn snapshot(&self) -> ProjectionInput<'a> {
        ProjectionInput {
            table: self.table,
            config: self.workspace.clone(),
            comparisons: self.comparisons(),
        }
    }

    /// Stores `scenario`, replacing any scenario of the same name.
    pub fn insert_scenario(
        &mut self,
        scenario: SavedScenario,
    ) -> Result<&SavedScenario, StoreError> {
        let name = scenario.name.clone();
        self.scenarios.insert(name.clone(), scenario);
        self.persist()?;
        self.scenarios
            .get(&name)
            .ok_or(StoreError::UnknownScenario(name))
    }

    /// Makes the named scenario's config the working config.
    pub fn load_scenario(&mut self, name: &str) -> Result<&SimulationConfig, StoreError> {
        let config = self
            .scenarios
            .get(name)
            .map(|s| s.config.clone())
            .ok_or_else(|| StoreError::UnknownScenario(name.to_string()))?;
        self.set_workspace(config)?;
        Ok(&self.workspace)
    }

    pub fn delete_scenario(&mut self, name: &str) -> Result<SavedScenario, StoreError> {
        let removed = self
            .scenarios
            .remove(name)
            .ok_or_else(|| StoreError::UnknownScenario(name.to_string()))?;
        self.persist()?;
        Ok(removed)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let state = StoredState {
            workspace: Some(self.workspace.clone()),
            scenarios: self.scenarios.values().cloned().collect(),
        };
        fs::write(path, serde_json::to_string_pretty(&state)?)?;
        debug!(path = %path.display(), scenarios = state.scenarios.len(), "saved session store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HORIZON_YEARS, HistoryWindow};

    fn table() -> &'static HistoricalTable {
        HistoricalTable::bundled().expect("bundled table is well formed")
    }

    fn sample_config() -> SimulationConfig {
        SimulationConfig {
            initial_value: 900.0,
            water_fee: 20.0,
            fixed_addition: 1.0,
            min_hike: Some(0.0),
            max_hike: Some(4.0),
            history_window: HistoryWindow::new(2010, 2023),
            trials: 400,
            seed: Some(11),
        }
    }

    fn save(session: &mut Session<'_>, name: &str) -> Result<SavedScenario, StoreError> {
        let input = session.snapshot();
        let result = run_simulation(input.table, &input.config)?;
        let scenario = SavedScenario::new(name, input.config, &result)?;
        session.insert_scenario(scenario).cloned()
    }

    fn temp_store(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "rentsim-{name}-{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn projection_includes_baseline_and_summary() {
        let config = sample_config();
        let projection = build_projection(table(), &config, true, Vec::new()).expect("valid");

        assert_eq!(projection.labels.len(), HORIZON_YEARS + 1);
        assert_eq!(projection.labels[0], "Year 0");
        let baseline = projection.baseline.expect("baseline requested");
        assert_eq!(baseline.per_year[0], projection.main.per_year[0]);

        let summary = projection.summary;
        assert_eq!(summary.start_total, 920.0);
        assert_eq!(summary.final_median, projection.main.final_year().median);
        let expected_change = (summary.final_median - 920.0) / 920.0 * 100.0;
        assert!((summary.change_percent - expected_change).abs() < 1e-9);
    }

    #[test]
    fn projection_fails_whole_when_window_is_empty() {
        let mut config = sample_config();
        config.history_window = HistoryWindow::new(1990, 1995);
        let err = build_projection(table(), &config, true, Vec::new()).expect_err("empty");
        assert!(matches!(err, SimError::EmptyPopulation { .. }));
    }

    #[test]
    fn saved_scenarios_become_comparison_series() {
        let mut session = Session::new(table(), sample_config());
        let saved = save(&mut session, "  capped  ").expect("saved");
        assert_eq!(saved.name, "capped");
        assert_eq!(saved.medians.len(), HORIZON_YEARS + 1);

        let projection = session.snapshot().run(true).expect("valid");
        assert_eq!(projection.comparisons.len(), 1);
        assert_eq!(projection.comparisons[0].medians, saved.medians);
    }

    #[test]
    fn empty_or_unknown_names_are_rejected() {
        let mut session = Session::new(table(), sample_config());
        assert!(matches!(save(&mut session, "  "), Err(StoreError::EmptyName)));
        assert!(matches!(
            session.load_scenario("missing"),
            Err(StoreError::UnknownScenario(_))
        ));
        assert!(matches!(
            session.delete_scenario("missing"),
            Err(StoreError::UnknownScenario(_))
        ));
    }

    #[test]
    fn snapshot_of_an_unusable_workspace_surfaces_the_simulation_error() {
        let mut config = sample_config();
        config.history_window = HistoryWindow::new(2040, 2041);
        let mut session = Session::new(table(), config);
        let err = save(&mut session, "future").expect_err("empty window");
        assert!(matches!(
            err,
            StoreError::Simulation(SimError::EmptyPopulation { .. })
        ));
        assert_eq!(session.scenarios().count(), 0);
    }

    #[test]
    fn snapshot_is_detached_from_later_edits() {
        let mut session = Session::new(table(), sample_config());
        let input = session.snapshot();

        let mut other = sample_config();
        other.initial_value = 1500.0;
        session.set_workspace(other).expect("in-memory session");

        assert_eq!(input.config.initial_value, 900.0);
        assert_eq!(session.snapshot().config.initial_value, 1500.0);
    }

    #[test]
    fn loaded_scenario_drives_the_next_projection() {
        let mut session = Session::new(table(), sample_config());
        let saved = save(&mut session, "first").expect("saved");

        let mut other = sample_config();
        other.initial_value = 1500.0;
        session.set_workspace(other).expect("in-memory session");
        assert_eq!(session.workspace().initial_value, 1500.0);

        let loaded = session.load_scenario("first").expect("loaded");
        assert_eq!(loaded.initial_value, 900.0);

        let projection = session.snapshot().run(false).expect("valid");
        assert_eq!(projection.main.initial_value, 900.0);
        assert_eq!(projection.main.medians(), saved.medians);
    }

    #[test]
    fn store_file_round_trips_workspace_and_scenarios() {
        let path = temp_store("round-trip");
        {
            let mut session =
                Session::open(table(), &path, sample_config()).expect("fresh store");
            let mut open_bounds = sample_config();
            open_bounds.min_hike = None;
            open_bounds.max_hike = None;
            session.set_workspace(open_bounds).expect("persisted");
            save(&mut session, "open").expect("saved");
            save(&mut session, "doomed").expect("saved");
            session.delete_scenario("doomed").expect("deleted");
        }

        let raw = fs::read_to_string(&path).expect("store written");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert!(json.get("workspace").is_some());
        assert_eq!(json["scenarios"].as_array().map(Vec::len), Some(1));

        let restored = Session::open(table(), &path, sample_config()).expect("restored");
        assert_eq!(restored.workspace().min_hike, None);
        assert_eq!(restored.workspace().max_hike, None);
        let names = restored.scenarios().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["open"]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_store_file_is_reported() {
        let path = temp_store("corrupt");
        fs::write(&path, "{ not json").expect("write fixture");
        let err = Session::open(table(), &path, sample_config()).expect_err("corrupt");
        assert!(matches!(err, StoreError::Json(_)));
        let _ = fs::remove_file(&path);
    }
}
