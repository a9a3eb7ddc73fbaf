//! Ensemble test runner: one synthetic dataset and one fit per trial.

use super::builder::{check_parameters, fluctuate_templates, sample, table_parameters};
use super::options::EnsembleOptions;
use crate::data::{Dataset, ParameterTable, ResultRow, ResultTable};
use crate::error::{EnsembleError, Result};
use crate::model::{FitMode, FitOutcome, Fitter, TemplateSet};
use crate::random::RandomSource;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Extra fit attempts for a failed trial, on the same dataset.
    pub max_retries: usize,
    /// Label given to the result table.
    pub label: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            label: "ensemble".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the table label.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

/// Shared cancellation flag, checked between trials.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where trial parameters come from.
#[derive(Debug, Clone, Copy)]
pub enum ParameterSource<'p> {
    /// The same vector for every trial.
    Fixed(&'p [f64]),
    /// Row `offset + i` for trial `i`.
    Table {
        table: &'p ParameterTable,
        offset: usize,
    },
}

/// Installs a trial's dataset (and templates) on the fitter and puts the
/// previous ones back when dropped, on every exit path.
struct TrialScope<'f, F: Fitter + ?Sized> {
    fitter: &'f mut F,
    saved_dataset: Option<Dataset>,
    saved_templates: Option<TemplateSet>,
}

impl<'f, F: Fitter + ?Sized> TrialScope<'f, F> {
    fn enter(fitter: &'f mut F, dataset: Dataset, templates: Option<TemplateSet>) -> Result<Self> {
        let saved_dataset = fitter.set_active_dataset(dataset)?;
        let mut scope = Self {
            fitter,
            saved_dataset: Some(saved_dataset),
            saved_templates: None,
        };
        if let Some(templates) = templates {
            scope.saved_templates = Some(scope.fitter.replace_templates(templates)?);
        }
        Ok(scope)
    }

    fn fitter(&mut self) -> &mut F {
        self.fitter
    }
}

impl<F: Fitter + ?Sized> Drop for TrialScope<'_, F> {
    fn drop(&mut self) {
        if let Some(templates) = self.saved_templates.take() {
            if let Err(e) = self.fitter.replace_templates(templates) {
                warn!(error = %e, "failed to restore templates");
            }
        }
        if let Some(dataset) = self.saved_dataset.take() {
            if let Err(e) = self.fitter.set_active_dataset(dataset) {
                warn!(error = %e, "failed to restore active dataset");
            }
        }
    }
}

/// Drives one fit per synthetic dataset and collects the results.
///
/// The fitter and the random stream are injected; the runner owns neither.
pub struct EnsembleTestRunner<'a, F: Fitter + ?Sized, R: RandomSource + ?Sized> {
    fitter: &'a mut F,
    rng: &'a mut R,
    config: RunnerConfig,
    cancel: Option<CancelFlag>,
}

impl<'a, F: Fitter + ?Sized, R: RandomSource + ?Sized> EnsembleTestRunner<'a, F, R> {
    /// Create a runner with the default configuration.
    pub fn new(fitter: &'a mut F, rng: &'a mut R) -> Self {
        Self {
            fitter,
            rng,
            config: RunnerConfig::default(),
            cancel: None,
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a cancellation flag.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Set the label of subsequent result tables.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.config.label = label.into();
    }

    /// The fitter under test.
    pub fn fitter(&self) -> &F {
        self.fitter
    }

    /// Run `nensembles` trials.
    ///
    /// All inputs are validated before the first draw or fit. A failed fit
    /// yields a `Failed` row; the table always has one row per trial.
    pub fn run(
        &mut self,
        source: ParameterSource<'_>,
        nensembles: usize,
        options: &EnsembleOptions,
    ) -> Result<ResultTable> {
        // Table rows are resolved by column name and validated up front.
        let (fixed, rows, offset): (&[f64], Vec<Vec<f64>>, usize) = match source {
            ParameterSource::Fixed(parameters) => {
                check_parameters(&*self.fitter, parameters)?;
                if nensembles < 1 {
                    return Err(EnsembleError::InvalidEnsembleCount(nensembles));
                }
                (parameters, Vec::new(), 0)
            }
            ParameterSource::Table { table, offset } => {
                let rows = table_parameters(&*self.fitter, table, nensembles, offset)?;
                (&[] as &[f64], rows, offset)
            }
        };

        self.fitter
            .initialize()
            .map_err(EnsembleError::into_initialization)?;

        let base_templates = if options.fluctuate_templates {
            let templates = self.fitter.templates().cloned().ok_or_else(|| {
                EnsembleError::FitterInitialization(
                    "template fluctuation requested but the fitter exposes no templates".into(),
                )
            })?;
            Some(templates)
        } else {
            None
        };

        let n_parameters = self.fitter.parameter_count();
        let mode = options.fit_mode();
        let mut table = ResultTable::new(self.config.label.clone(), self.fitter.parameter_names());

        info!(
            label = %self.config.label,
            nensembles,
            ?mode,
            actual_data = options.actual_data,
            fluctuate_templates = options.fluctuate_templates,
            "starting ensemble test"
        );

        for trial in 0..nensembles {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                warn!(completed = trial, requested = nensembles, "ensemble test cancelled");
                return Err(EnsembleError::Cancelled {
                    completed: trial,
                    requested: nensembles,
                });
            }

            let (parameters, source_row) = match rows.get(trial) {
                Some(row) => (row.as_slice(), Some(offset + trial)),
                None => (fixed, None),
            };

            // Data are sampled from the nominal templates before fluctuating them.
            let synthetic = sample(&*self.fitter, &mut *self.rng, parameters, source_row, options)?;
            let templates = match &base_templates {
                Some(base) => Some(fluctuate_templates(base, &mut *self.rng)?),
                None => None,
            };

            let mut scope = TrialScope::enter(&mut *self.fitter, synthetic.dataset, templates)?;
            let fitted = fit_with_retries(scope.fitter(), mode, self.config.max_retries, n_parameters);
            drop(scope);
            let (outcome, attempts) = fitted?;

            let outcome = if outcome.estimates.len() != n_parameters
                || outcome.uncertainties.len() != n_parameters
            {
                FitOutcome::failed(
                    n_parameters,
                    format!(
                        "fitter returned {} estimates and {} uncertainties",
                        outcome.estimates.len(),
                        outcome.uncertainties.len()
                    ),
                )
            } else {
                outcome
            };

            debug!(trial, status = outcome.status.name(), attempts, "trial finished");
            table.push(ResultRow::from_outcome(
                trial,
                source_row,
                parameters.to_vec(),
                outcome,
                attempts,
                *options,
            ))?;
        }

        info!(
            label = %self.config.label,
            rows = table.len(),
            failed = table.n_failed(),
            "ensemble test finished"
        );
        Ok(table)
    }
}

/// Fit, retrying failed fits up to `max_retries` times.
///
/// Returns the last outcome and the number of attempts made. Errors that are
/// not confined to this fit are propagated.
fn fit_with_retries<F: Fitter + ?Sized>(
    fitter: &mut F,
    mode: FitMode,
    max_retries: usize,
    n_parameters: usize,
) -> Result<(FitOutcome, usize)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = match fitter.fit(mode) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(attempt = attempts, error = %e, "fit failed");
                FitOutcome::failed(n_parameters, e.to_string())
            }
        };
        if outcome.status.is_ok() || attempts > max_retries {
            return Ok((outcome, attempts));
        }
        debug!(attempt = attempts, "retrying failed fit");
    }
}
