use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::error::SimError;
use super::history::HistoricalTable;
use super::types::{HORIZON_YEARS, SimulationConfig, SimulationResult, YearStats};

const P10: f64 = 0.1;
const MEDIAN: f64 = 0.5;
const P90: f64 = 0.9;

/// Source of draws uniform on `[0, 1)`.
pub trait UniformSource {
    fn next_unit(&mut self) -> f64;
}

impl<R: RngCore> UniformSource for R {
    fn next_unit(&mut self) -> f64 {
        self.random::<f64>()
    }
}

/// Runs the bootstrap with a seeded ChaCha stream when the config carries a seed,
/// and with the thread-local generator otherwise.
pub fn run_simulation(
    table: &HistoricalTable,
    config: &SimulationConfig,
) -> Result<SimulationResult, SimError> {
    match config.seed {
        Some(seed) => simulate(table, config, &mut ChaCha8Rng::seed_from_u64(seed)),
        None => simulate(table, config, &mut rand::rng()),
    }
}

/// Resamples `config.trials` trajectories of `HORIZON_YEARS` steps from the windowed
/// change population and reduces every year to median/p10/p90.
///
/// Nothing is drawn from `rng` unless the config is valid and the window is non-empty.
pub fn simulate<U: UniformSource + ?Sized>(
    table: &HistoricalTable,
    config: &SimulationConfig,
    rng: &mut U,
) -> Result<SimulationResult, SimError> {
    config.validate()?;
    let population = table.window(config.history_window)?;
    let (min_hike, max_hike) = config.hike_bounds();
    let trials = config.trials as usize;

    debug!(
        trials,
        population = population.len(),
        window = ?config.history_window.normalized(),
        min_hike,
        max_hike,
        fixed_addition = config.fixed_addition,
        "running bootstrap simulation"
    );

    let initial_total = config.initial_total();
    let mut buckets = (0..=HORIZON_YEARS)
        .map(|_| Vec::with_capacity(trials))
        .collect::<Vec<Vec<f64>>>();

    for _ in 0..trials {
        let mut current = config.initial_value;
        buckets[0].push(initial_total);

        for bucket in buckets.iter_mut().skip(1) {
            let drawn = population[draw_index(rng, population.len())];
            let hike = effective_hike(drawn + config.fixed_addition, min_hike, max_hike);
            current *= 1.0 + hike / 100.0;
            bucket.push(current + config.water_fee);
        }
    }

    let per_year = buckets
        .iter_mut()
        .map(|bucket| reduce_bucket(bucket))
        .collect();

    Ok(SimulationResult {
        initial_value: config.initial_value,
        initial_total,
        per_year,
    })
}

/// `max(min, min(max, raw))`. Unlike `f64::clamp` this never panics on inverted bounds.
fn effective_hike(raw: f64, min_hike: f64, max_hike: f64) -> f64 {
    min_hike.max(max_hike.min(raw))
}

fn draw_index<U: UniformSource + ?Sized>(rng: &mut U, len: usize) -> usize {
    let idx = (rng.next_unit() * len as f64).floor() as usize;
    idx.min(len - 1)
}

fn reduce_bucket(values: &mut [f64]) -> YearStats {
    values.sort_by(|a, b| a.total_cmp(b));
    YearStats {
        median: quantile(values, MEDIAN),
        p10: quantile(values, P10),
        p90: quantile(values, P90),
    }
}

/// Index-based quantile `sorted[floor(n * q)]`, no interpolation.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = (sorted.len() as f64 * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
