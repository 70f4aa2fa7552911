use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Router,
    extract::{Json, Path as UrlPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    DEFAULT_TRIALS, HORIZON_YEARS, HistoricalChange, HistoricalTable, HistoryWindow, MAX_TRIALS,
    SimError, SimulationConfig, run_simulation,
};
use crate::session::{
    Projection, ProjectionInput, SavedScenario, Session, StoreError, build_projection,
};

#[derive(Parser, Debug)]
#[command(
    name = "rentsim",
    about = "Bootstrap projection of monthly rent + water cost from historical index changes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one projection and print it.
    Simulate(SimulateArgs),
    /// List the year-over-year changes available for sampling.
    History,
    /// Manage saved comparison scenarios in a store file.
    Scenarios {
        #[arg(long)]
        store: PathBuf,
        #[command(subcommand)]
        action: ScenarioAction,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, help = "JSON file for the working config and saved scenarios")]
        store: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScenarioAction {
    List,
    /// Make the named scenario the working config.
    Load { name: String },
    Delete { name: String },
}

/// Flags left out fall back to the stored working config when `--store` is given,
/// otherwise to the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct SimulateArgs {
    #[arg(long, help = "Monthly rent at year 0 [default: 1000]")]
    initial_rent: Option<f64>,
    #[arg(
        long,
        help = "Flat monthly water fee added on top of rent; never compounds [default: 0]"
    )]
    water_fee: Option<f64>,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Lowest allowed yearly change in percent [default: 0]"
    )]
    min_hike: Option<f64>,
    #[arg(long, conflicts_with = "min_hike", help = "Leave the lower clamp open")]
    no_min_hike: bool,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Highest allowed yearly change in percent [default: 5]"
    )]
    max_hike: Option<f64>,
    #[arg(long, conflicts_with = "max_hike", help = "Leave the upper clamp open")]
    no_max_hike: bool,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Percentage points added to every sampled change before clamping [default: 0]"
    )]
    fixed_addition: Option<f64>,
    #[arg(long, help = "First history year to sample from, defaults to the last 5 years")]
    start_year: Option<i32>,
    #[arg(long, help = "Last history year to sample from")]
    end_year: Option<i32>,
    #[arg(long, help = "Number of bootstrap trials [default: 2000]")]
    simulations: Option<u32>,
    #[arg(long, help = "Seed for a reproducible run")]
    seed: Option<u64>,
    #[arg(long)]
    no_baseline: bool,
    #[arg(long)]
    json: bool,
    #[arg(long, help = "Store file holding the working config and saved scenarios")]
    store: Option<PathBuf>,
    #[arg(long, requires = "store", help = "Save this config under a name in --store")]
    save_as: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    initial_rent: Option<f64>,
    water_fee: Option<f64>,
    min_hike: Option<f64>,
    min_hike_enabled: Option<bool>,
    max_hike: Option<f64>,
    max_hike_enabled: Option<bool>,
    fixed_addition: Option<f64>,
    start_year: Option<i32>,
    end_year: Option<i32>,
    simulations: Option<u32>,
    seed: Option<u64>,
    include_baseline: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SaveScenarioPayload {
    name: String,
}

#[derive(Debug)]
struct ApiRequest {
    config: SimulationConfig,
    include_baseline: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse<'a> {
    years: Vec<i32>,
    changes: &'a [HistoricalChange],
    default_window: HistoryWindow,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceResponse {
    workspace: SimulationConfig,
    projection: Projection,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Working config used before anything has been stored.
fn default_workspace(table: &HistoricalTable) -> SimulationConfig {
    SimulationConfig {
        initial_value: 1000.0,
        water_fee: 0.0,
        fixed_addition: 0.0,
        min_hike: Some(0.0),
        max_hike: Some(5.0),
        history_window: table.default_window(),
        trials: DEFAULT_TRIALS,
        seed: None,
    }
}

fn build_config(args: &SimulateArgs, base: &SimulationConfig) -> Result<SimulationConfig, String> {
    let initial_value = args.initial_rent.unwrap_or(base.initial_value);
    if !initial_value.is_finite() || initial_value <= 0.0 {
        return Err("--initial-rent must be > 0".to_string());
    }

    let water_fee = args.water_fee.unwrap_or(base.water_fee);
    if !water_fee.is_finite() || water_fee < 0.0 {
        return Err("--water-fee must be >= 0".to_string());
    }

    let fixed_addition = args.fixed_addition.unwrap_or(base.fixed_addition);
    if !fixed_addition.is_finite() {
        return Err("--fixed-addition must be a finite number".to_string());
    }

    let min_hike = if args.no_min_hike {
        None
    } else {
        args.min_hike.or(base.min_hike)
    };
    let max_hike = if args.no_max_hike {
        None
    } else {
        args.max_hike.or(base.max_hike)
    };
    for (name, bound) in [("--min-hike", min_hike), ("--max-hike", max_hike)] {
        if bound.is_some_and(|v| !v.is_finite()) {
            return Err(format!("{name} must be a finite number"));
        }
    }
    if let (Some(min), Some(max)) = (min_hike, max_hike) {
        if max < min {
            return Err("--max-hike must be >= --min-hike".to_string());
        }
    }

    let trials = args.simulations.unwrap_or(base.trials);
    if trials == 0 || trials > MAX_TRIALS {
        return Err(format!("--simulations must be between 1 and {MAX_TRIALS}"));
    }

    let history_window = HistoryWindow::new(
        args.start_year.unwrap_or(base.history_window.start_year),
        args.end_year.unwrap_or(base.history_window.end_year),
    );

    Ok(SimulationConfig {
        initial_value,
        water_fee,
        fixed_addition,
        min_hike,
        max_hike,
        history_window,
        trials,
        seed: args.seed.or(base.seed),
    })
}

fn api_request_from_payload(
    payload: SimulatePayload,
    base: &SimulationConfig,
) -> Result<ApiRequest, String> {
    let args = SimulateArgs {
        initial_rent: payload.initial_rent,
        water_fee: payload.water_fee,
        min_hike: payload.min_hike,
        no_min_hike: payload.min_hike_enabled == Some(false),
        max_hike: payload.max_hike,
        no_max_hike: payload.max_hike_enabled == Some(false),
        fixed_addition: payload.fixed_addition,
        start_year: payload.start_year,
        end_year: payload.end_year,
        simulations: payload.simulations,
        seed: payload.seed,
        ..SimulateArgs::default()
    };

    let config = build_config(&args, base)?;
    Ok(ApiRequest {
        config,
        include_baseline: payload.include_baseline.unwrap_or(true),
    })
}

#[cfg(test)]
fn api_request_from_json(json: &str, base: &SimulationConfig) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload, base)
}

/// Entry point for the binary. The bundled table is checked before any command runs.
pub async fn run(cli: Cli) -> Result<(), String> {
    let table = HistoricalTable::bundled().map_err(|e| e.to_string())?;

    match cli.command {
        Command::Simulate(args) => run_simulate_command(&args, table),
        Command::History => {
            print_history(table);
            Ok(())
        }
        Command::Scenarios { store, action } => run_scenarios_command(&store, action, table),
        Command::Serve { port, store } => run_http_server(port, store, table)
            .await
            .map_err(|e| format!("Server error: {e}")),
    }
}

fn run_simulate_command(
    args: &SimulateArgs,
    table: &'static HistoricalTable,
) -> Result<(), String> {
    let (config, projection) = simulate_with_store(args, table)?;

    if args.json {
        let json = serde_json::to_string_pretty(&projection).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        print_projection(&config, &projection);
    }
    Ok(())
}

/// Runs the projection first; the store is only written once it succeeded.
fn simulate_with_store(
    args: &SimulateArgs,
    table: &'static HistoricalTable,
) -> Result<(SimulationConfig, Projection), String> {
    let Some(store) = &args.store else {
        let config = build_config(args, &default_workspace(table))?;
        let projection = build_projection(table, &config, !args.no_baseline, Vec::new())
            .map_err(|e| e.to_string())?;
        return Ok((config, projection));
    };

    let mut session =
        Session::open(table, store, default_workspace(table)).map_err(|e| e.to_string())?;
    let config = build_config(args, session.workspace())?;
    let input = ProjectionInput {
        config,
        ..session.snapshot()
    };
    let projection = input.run(!args.no_baseline).map_err(|e| e.to_string())?;

    session.set_workspace(input.config.clone()).map_err(|e| e.to_string())?;
    if let Some(name) = &args.save_as {
        let scenario = SavedScenario::new(name, input.config.clone(), &projection.main)
            .map_err(|e| e.to_string())?;
        let saved = session.insert_scenario(scenario).map_err(|e| e.to_string())?;
        info!(name = %saved.name, "saved scenario");
    }
    Ok((input.config, projection))
}

fn run_scenarios_command(
    store: &Path,
    action: ScenarioAction,
    table: &'static HistoricalTable,
) -> Result<(), String> {
    let mut session =
        Session::open(table, store, default_workspace(table)).map_err(|e| e.to_string())?;

    match action {
        ScenarioAction::List => {
            for scenario in session.scenarios() {
                let final_median = scenario.medians.last().copied().unwrap_or(f64::NAN);
                println!(
                    "{:<20} start {:>10.2}  year-{HORIZON_YEARS} median {:>10.2}",
                    scenario.name,
                    scenario.config.initial_total(),
                    final_median
                );
            }
        }
        ScenarioAction::Load { name } => {
            let config = session.load_scenario(&name).map_err(|e| e.to_string())?;
            println!("Loaded '{name}' (initial {:.2})", config.initial_total());
        }
        ScenarioAction::Delete { name } => {
            session.delete_scenario(&name).map_err(|e| e.to_string())?;
            println!("Deleted '{name}'");
        }
    }
    Ok(())
}

fn print_history(table: &HistoricalTable) {
    println!("{:<6} {:>9}", "Year", "Change %");
    for change in table.changes() {
        println!("{:<6} {:>9.2}", change.year, change.change);
    }
}

fn print_projection(config: &SimulationConfig, projection: &Projection) {
    let (start, end) = config.history_window.normalized();
    println!("Sampling changes from {start}-{end}, {} trials", config.trials);
    println!(
        "{:<8} {:>10} {:>10} {:>10} {:>10}",
        "", "P10", "Median", "P90", "Baseline"
    );
    for (idx, label) in projection.labels.iter().enumerate() {
        let stats = projection.main.per_year[idx];
        let baseline = projection
            .baseline
            .as_ref()
            .map(|b| format!("{:.2}", b.per_year[idx].median))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:>10.2} {:>10.2} {:>10.2} {:>10}",
            label, stats.p10, stats.median, stats.p90, baseline
        );
    }
    for comparison in &projection.comparisons {
        let medians = comparison
            .medians
            .iter()
            .map(|m| format!("{m:.2}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("Compare {}: {medians}", comparison.name);
    }

    let summary = projection.summary;
    println!(
        "Expected monthly cost after {HORIZON_YEARS} years: {:.2} ({:+.1}%)",
        summary.final_median, summary.change_percent
    );
    println!(
        "80% range: {:.0} - {:.0}",
        summary.final_p10, summary.final_p90
    );
}

/// The session lock is only held to copy state in or out; simulations run without it.
#[derive(Clone)]
struct AppState {
    table: &'static HistoricalTable,
    session: Arc<Mutex<Session<'static>>>,
}

pub async fn run_http_server(
    port: u16,
    store: Option<PathBuf>,
    table: &'static HistoricalTable,
) -> std::io::Result<()> {
    let session = match store {
        Some(path) => Session::open(table, path, default_workspace(table))
            .map_err(|e| std::io::Error::other(e.to_string()))?,
        None => Session::new(table, default_workspace(table)),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(AppState {
        table,
        session: Arc::new(Mutex::new(session)),
    });

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "rentsim HTTP API listening");

    axum::serve(listener, app).await
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/history", get(history_handler))
        .route("/api/workspace", get(workspace_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route(
            "/api/scenarios",
            get(list_scenarios_handler).post(save_scenario_handler),
        )
        .route("/api/scenarios/:name", delete(delete_scenario_handler))
        .route("/api/scenarios/:name/load", post(load_scenario_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn history_handler(State(state): State<AppState>) -> Response {
    let table = state.table;
    json_response(
        StatusCode::OK,
        HistoryResponse {
            years: table.available_years(),
            changes: table.changes(),
            default_window: table.default_window(),
        },
    )
}

/// Projection of the stored working config, without changing it.
async fn workspace_handler(State(state): State<AppState>) -> Response {
    let input = lock_session(&state.session).snapshot();
    run_blocking("workspace", StatusCode::OK, move || {
        let projection = input.run(true)?;
        Ok(WorkspaceResponse {
            workspace: input.config,
            projection,
        })
    })
    .await
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_handler_impl(state: AppState, payload: SimulatePayload) -> Response {
    let input = lock_session(&state.session).snapshot();
    let request = match api_request_from_payload(payload, &input.config) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let input = ProjectionInput {
        config: request.config,
        ..input
    };

    let session = Arc::clone(&state.session);
    run_blocking("simulation", StatusCode::OK, move || {
        let projection = input.run(request.include_baseline)?;
        lock_session(&session).set_workspace(input.config)?;
        info!(
            final_median = projection.summary.final_median,
            comparisons = projection.comparisons.len(),
            "simulation served"
        );
        Ok(projection)
    })
    .await
}

async fn list_scenarios_handler(State(state): State<AppState>) -> Response {
    let scenarios = lock_session(&state.session)
        .scenarios()
        .cloned()
        .collect::<Vec<SavedScenario>>();
    json_response(StatusCode::OK, scenarios)
}

async fn save_scenario_handler(
    State(state): State<AppState>,
    Json(payload): Json<SaveScenarioPayload>,
) -> Response {
    let input = lock_session(&state.session).snapshot();
    let session = Arc::clone(&state.session);
    run_blocking("save", StatusCode::CREATED, move || {
        let result = run_simulation(input.table, &input.config)?;
        let scenario = SavedScenario::new(&payload.name, input.config, &result)?;
        lock_session(&session).insert_scenario(scenario).cloned()
    })
    .await
}

async fn load_scenario_handler(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let session = Arc::clone(&state.session);
    run_blocking("load", StatusCode::OK, move || {
        lock_session(&session).load_scenario(&name).cloned()
    })
    .await
}

async fn delete_scenario_handler(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let session = Arc::clone(&state.session);
    run_blocking("delete", StatusCode::OK, move || {
        lock_session(&session).delete_scenario(&name)
    })
    .await
}

/// Runs `task` on the blocking pool; it may simulate or write the store file.
async fn run_blocking<T, F>(what: &'static str, status: StatusCode, task: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(Ok(body)) => json_response(status, body),
        Ok(Err(err)) => store_error_response(err),
        Err(err) => {
            warn!(error = %err, task = what, "blocking task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "request task failed")
        }
    }
}

fn lock_session<'a>(session: &'a Mutex<Session<'static>>) -> MutexGuard<'a, Session<'static>> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sim_error_status(err: &SimError) -> StatusCode {
    match err {
        SimError::EmptyPopulation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SimError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        SimError::MalformedHistoricalTable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error_response(err: StoreError) -> Response {
    let status = match &err {
        StoreError::Simulation(sim) => sim_error_status(sim),
        StoreError::UnknownScenario(_) => StatusCode::NOT_FOUND,
        StoreError::EmptyName => StatusCode::BAD_REQUEST,
        StoreError::Io(_) | StoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, status = status.as_u16(), "request failed");
    error_response(status, &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
