//! Calibration sweeps: ensemble tests over a grid of true values for one
//! parameter, all other parameters held at their defaults.

use super::builder::check_parameters;
use super::options::EnsembleOptions;
use super::runner::{EnsembleTestRunner, ParameterSource, RunnerConfig};
use super::summary::{summarize_parameter, z_score};
use crate::data::ResultTable;
use crate::error::{EnsembleError, Result};
use crate::model::{safe_name, Fitter};
use crate::random::{RandomSource, SeededRandom};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Result table of one grid value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPoint {
    /// True value of the swept parameter.
    pub value: f64,
    /// Trials at this value.
    pub table: ResultTable,
}

/// One point of a calibration curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub value: f64,
    pub n_ok: usize,
    pub n_failed: usize,
    pub estimate_mean: f64,
    pub estimate_std: f64,
    pub uncertainty_mean: f64,
    pub bias: f64,
    pub pull_mean: f64,
    pub pull_std: f64,
    pub coverage: f64,
}

/// A completed sweep. Points keep the order of the input grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRun {
    /// Index of the swept parameter.
    pub parameter_index: usize,
    /// Name of the swept parameter.
    pub parameter_name: String,
    /// Values of all other parameters.
    pub defaults: Vec<f64>,
    /// Per-value tables.
    pub points: Vec<SweepPoint>,
}

impl CalibrationRun {
    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Grid values in input order.
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Calibration curve of the swept parameter.
    pub fn curve(&self, confidence_level: f64) -> Result<Vec<CalibrationPoint>> {
        let z = z_score(confidence_level)?;
        Ok(self
            .points
            .iter()
            .map(|point| {
                let s = summarize_parameter(&point.table, self.parameter_index, z);
                let n_failed = point.table.n_failed();
                CalibrationPoint {
                    value: point.value,
                    n_ok: point.table.len() - n_failed,
                    n_failed,
                    estimate_mean: s.estimate_mean,
                    estimate_std: s.estimate_std,
                    uncertainty_mean: s.uncertainty_mean,
                    bias: s.bias,
                    pull_mean: s.pull_mean,
                    pull_std: s.pull_std,
                    coverage: s.coverage,
                }
            })
            .collect())
    }

    /// Write the calibration curve as TSV.
    pub fn write_curve_tsv<W: Write>(&self, writer: W, confidence_level: f64) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        writer.write_record([
            "value",
            "n_ok",
            "n_failed",
            "estimate_mean",
            "estimate_std",
            "uncertainty_mean",
            "bias",
            "pull_mean",
            "pull_std",
            "coverage",
        ])?;
        for p in self.curve(confidence_level)? {
            writer.write_record(&[
                p.value.to_string(),
                p.n_ok.to_string(),
                p.n_failed.to_string(),
                p.estimate_mean.to_string(),
                p.estimate_std.to_string(),
                p.uncertainty_mean.to_string(),
                p.bias.to_string(),
                p.pull_mean.to_string(),
                p.pull_std.to_string(),
                p.coverage.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the calibration curve to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P, confidence_level: f64) -> Result<()> {
        self.write_curve_tsv(BufWriter::new(File::create(path)?), confidence_level)
    }

    /// Write every point's table to `<dir>/<label>.tsv`.
    pub fn write_tables<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for point in &self.points {
            point
                .table
                .to_tsv(dir.join(format!("{}.tsv", safe_name(point.table.label()))))?;
        }
        Ok(())
    }
}

fn check_sweep<F: Fitter + ?Sized>(
    fitter: &F,
    defaults: &[f64],
    parameter_index: usize,
    values: &[f64],
    nensembles: usize,
) -> Result<String> {
    if parameter_index >= defaults.len() {
        return Err(EnsembleError::ParameterIndexOutOfRange {
            index: parameter_index,
            len: defaults.len(),
        });
    }
    check_parameters(fitter, defaults)?;
    for &value in values {
        check_parameters(fitter, &point_parameters(defaults, parameter_index, value))?;
    }
    if nensembles < 1 {
        return Err(EnsembleError::InvalidEnsembleCount(nensembles));
    }
    Ok(fitter.parameter_names()[parameter_index].clone())
}

fn point_parameters(defaults: &[f64], parameter_index: usize, value: f64) -> Vec<f64> {
    let mut parameters = defaults.to_vec();
    parameters[parameter_index] = value;
    parameters
}

/// Sweep one parameter over `values`, sequentially on one random stream.
///
/// Grid values are processed in input order. Table `k` is labeled
/// `<parameter>_<k>`.
pub fn sweep<F, R>(
    runner: &mut EnsembleTestRunner<'_, F, R>,
    defaults: &[f64],
    parameter_index: usize,
    values: &[f64],
    nensembles: usize,
    options: &EnsembleOptions,
) -> Result<CalibrationRun>
where
    F: Fitter + ?Sized,
    R: RandomSource + ?Sized,
{
    let name = check_sweep(runner.fitter(), defaults, parameter_index, values, nensembles)?;
    info!(parameter = %name, points = values.len(), nensembles, "starting calibration sweep");

    let original_label = runner.config().label.clone();
    let mut points = Vec::with_capacity(values.len());
    for (k, &value) in values.iter().enumerate() {
        let parameters = point_parameters(defaults, parameter_index, value);
        runner.set_label(format!("{}_{}", name, k));
        let result = runner.run(ParameterSource::Fixed(&parameters), nensembles, options);
        let table = match result {
            Ok(table) => table,
            Err(e) => {
                runner.set_label(original_label);
                return Err(e);
            }
        };
        points.push(SweepPoint { value, table });
    }
    runner.set_label(original_label);

    info!(parameter = %name, points = points.len(), "calibration sweep finished");
    Ok(CalibrationRun {
        parameter_index,
        parameter_name: name,
        defaults: defaults.to_vec(),
        points,
    })
}

/// Sweep with one worker per grid value.
///
/// Each worker fits its own clone of `fitter` and draws from
/// `SeededRandom::new(seed).fork(k)`, so results depend only on `seed`
/// and come back in input order.
#[allow(clippy::too_many_arguments)]
pub fn sweep_parallel<F>(
    fitter: &F,
    seed: u64,
    config: &RunnerConfig,
    defaults: &[f64],
    parameter_index: usize,
    values: &[f64],
    nensembles: usize,
    options: &EnsembleOptions,
) -> Result<CalibrationRun>
where
    F: Fitter + Clone + Send + Sync,
{
    let name = check_sweep(fitter, defaults, parameter_index, values, nensembles)?;
    info!(
        parameter = %name,
        points = values.len(),
        nensembles,
        seed,
        "starting parallel calibration sweep"
    );
    let base = SeededRandom::new(seed);

    let points = values
        .par_iter()
        .enumerate()
        .map(|(k, &value)| {
            let mut worker = fitter.clone();
            let mut rng = base.fork(k as u64);
            let parameters = point_parameters(defaults, parameter_index, value);
            let config = config.clone().with_label(&format!("{}_{}", name, k));
            let table = EnsembleTestRunner::new(&mut worker, &mut rng)
                .with_config(config)
                .run(ParameterSource::Fixed(&parameters), nensembles, options)?;
            Ok(SweepPoint { value, table })
        })
        .collect::<Result<Vec<_>>>()?;

    info!(parameter = %name, points = points.len(), "parallel calibration sweep finished");
    Ok(CalibrationRun {
        parameter_index,
        parameter_name: name,
        defaults: defaults.to_vec(),
        points,
    })
}
