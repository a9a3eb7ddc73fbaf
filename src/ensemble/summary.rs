//! Aggregate statistics over a result table.

use crate::data::ResultTable;
use crate::error::{EnsembleError, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Per-parameter statistics over the successful trials of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSummary {
    /// Parameter name.
    pub name: String,
    /// Mean true value.
    pub true_mean: f64,
    /// Mean estimate.
    pub estimate_mean: f64,
    /// Standard deviation of the estimates.
    pub estimate_std: f64,
    /// Mean reported uncertainty.
    pub uncertainty_mean: f64,
    /// Mean of `estimate - true`.
    pub bias: f64,
    /// Mean pull.
    pub pull_mean: f64,
    /// Standard deviation of the pulls.
    pub pull_std: f64,
    /// Fraction of trials whose interval `estimate +/- z * err` covers the true value.
    pub coverage: f64,
}

/// Summary of one ensemble test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleSummary {
    /// Table label.
    pub label: String,
    /// Number of trials.
    pub n_trials: usize,
    /// Successful trials.
    pub n_ok: usize,
    /// Failed trials.
    pub n_failed: usize,
    /// Confidence level of the coverage intervals.
    pub confidence_level: f64,
    /// Per-parameter statistics.
    pub parameters: Vec<ParameterSummary>,
}

impl EnsembleSummary {
    /// Statistics for one parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSummary> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Save as JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(EnsembleError::from)
    }
}

/// Two-sided standard normal quantile for a confidence level.
pub(crate) fn z_score(confidence_level: f64) -> Result<f64> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(EnsembleError::InvalidParameter(format!(
            "confidence level must be in (0, 1), got {}",
            confidence_level
        )));
    }
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| EnsembleError::InvalidParameter(e.to_string()))?;
    Ok(normal.inverse_cdf(0.5 + confidence_level / 2.0))
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Summarize one parameter over the successful rows of a table.
pub(crate) fn summarize_parameter(
    table: &ResultTable,
    index: usize,
    z: f64,
) -> ParameterSummary {
    let rows: Vec<_> = table.ok_rows().collect();
    let truths: Vec<f64> = rows.iter().map(|r| r.parameters[index]).collect();
    let estimates: Vec<f64> = rows.iter().map(|r| r.estimates[index]).collect();
    let errors: Vec<f64> = rows.iter().map(|r| r.uncertainties[index]).collect();
    let residuals: Vec<f64> = rows.iter().filter_map(|r| r.residual(index)).collect();
    let pulls: Vec<f64> = rows.iter().filter_map(|r| r.pull(index)).collect();

    let covered = rows
        .iter()
        .filter(|r| {
            r.residual(index)
                .map(|d| d.abs() <= z * r.uncertainties[index])
                .unwrap_or(false)
        })
        .count();

    let estimate_mean = mean(&estimates);
    let pull_mean = mean(&pulls);
    ParameterSummary {
        name: table.parameter_names()[index].clone(),
        true_mean: mean(&truths),
        estimate_mean,
        estimate_std: std_dev(&estimates, estimate_mean),
        uncertainty_mean: mean(&errors),
        bias: mean(&residuals),
        pull_mean,
        pull_std: std_dev(&pulls, pull_mean),
        coverage: if rows.is_empty() {
            f64::NAN
        } else {
            covered as f64 / rows.len() as f64
        },
    }
}

/// Summarize a result table. Failed trials are counted but excluded from
/// the statistics.
pub fn summarize(table: &ResultTable, confidence_level: f64) -> Result<EnsembleSummary> {
    let z = z_score(confidence_level)?;
    let n_failed = table.n_failed();
    let parameters = (0..table.parameter_names().len())
        .map(|index| summarize_parameter(table, index, z))
        .collect();

    Ok(EnsembleSummary {
        label: table.label().to_string(),
        n_trials: table.len(),
        n_ok: table.len() - n_failed,
        n_failed,
        confidence_level,
        parameters,
    })
}

impl std::fmt::Display for EnsembleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Ensemble Test Summary: {}", self.label)?;
        writeln!(f, "==============================")?;
        writeln!(
            f,
            "Trials: {} ({} ok, {} failed)",
            self.n_trials, self.n_ok, self.n_failed
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<16} {:>12} {:>12} {:>12} {:>12} {:>10} {:>10} {:>10}",
            "parameter", "true", "mean", "std", "bias", "pull", "pull_std", "coverage"
        )?;
        for p in &self.parameters {
            writeln!(
                f,
                "{:<16} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>10.3} {:>10.3} {:>9.1}%",
                p.name,
                p.true_mean,
                p.estimate_mean,
                p.estimate_std,
                p.bias,
                p.pull_mean,
                p.pull_std,
                p.coverage * 100.0
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "Coverage at {:.1}% confidence level.",
            self.confidence_level * 100.0
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ResultRow;
    use crate::ensemble::EnsembleOptions;
    use crate::model::{FitOutcome, FitStatus};
    use approx::assert_relative_eq;

    fn row(trial: usize, estimate: f64, err: f64, status: FitStatus) -> ResultRow {
        ResultRow::from_outcome(
            trial,
            None,
            vec![10.0],
            FitOutcome {
                estimates: vec![estimate],
                uncertainties: vec![err],
                status,
                nll: None,
                message: None,
            },
            1,
            EnsembleOptions::default(),
        )
    }

    fn table() -> ResultTable {
        let mut table = ResultTable::new("t", vec!["mu".into()]);
        table.push(row(0, 9.0, 1.0, FitStatus::Ok)).unwrap();
        table.push(row(1, 11.0, 1.0, FitStatus::Ok)).unwrap();
        table.push(row(2, 13.0, 1.0, FitStatus::Ok)).unwrap();
        table.push(row(3, f64::NAN, f64::NAN, FitStatus::Failed)).unwrap();
        table
    }

    #[test]
    fn test_summary_statistics() {
        let summary = summarize(&table(), 0.6827).unwrap();
        assert_eq!(summary.n_trials, 4);
        assert_eq!(summary.n_ok, 3);
        assert_eq!(summary.n_failed, 1);

        let mu = summary.parameter("mu").unwrap();
        assert_relative_eq!(mu.true_mean, 10.0);
        assert_relative_eq!(mu.estimate_mean, 11.0);
        assert_relative_eq!(mu.estimate_std, 2.0);
        assert_relative_eq!(mu.bias, 1.0);
        assert_relative_eq!(mu.pull_mean, 1.0);
        // Only the first two trials lie within one sigma.
        assert_relative_eq!(mu.coverage, 2.0 / 3.0);
    }

    #[test]
    fn test_z_score() {
        assert_relative_eq!(z_score(0.95).unwrap(), 1.959964, epsilon = 1e-5);
        assert!(z_score(1.0).is_err());
        assert!(z_score(0.0).is_err());
    }

    #[test]
    fn test_display() {
        let summary = summarize(&table(), 0.68).unwrap();
        let text = summary.to_string();
        assert!(text.contains("Ensemble Test Summary: t"));
        assert!(text.contains("3 ok, 1 failed"));
        assert!(text.contains("mu"));
    }
}
