//! Binned multi-template likelihood fit.
//!
//! Each process contributes a normalized template shape scaled by its yield
//! and a per-channel efficiency. Systematic sources shift the templates bin
//! by bin through relative up/down variations, interpolated linearly in a
//! unit-Gaussian nuisance parameter.

use super::config::{FitSettings, ModelConfig, ProcessConfig, SystematicConfig};
use super::optimize::{metropolis, minimize, MinimizerSettings};
use super::{Channel, FitMode, FitOutcome, FitStatus, Fitter, RestrictableFitter, TemplateSet};
use crate::data::{Dataset, Histogram};
use crate::error::{EnsembleError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

/// Floor on expectations inside the logarithm.
const MIN_NU: f64 = 1e-12;

/// Acceptance window for a usable Markov chain.
const MIN_ACCEPTANCE: f64 = 0.01;
const MAX_ACCEPTANCE: f64 = 0.99;

/// Relative up/down variation of one process under one systematic.
#[derive(Debug, Clone, PartialEq)]
struct Variation {
    up: Vec<f64>,
    down: Vec<f64>,
}

impl Variation {
    fn shift(&self, bin: usize, theta: f64) -> f64 {
        if theta >= 0.0 {
            theta * self.up[bin]
        } else {
            -theta * self.down[bin]
        }
    }
}

/// Multi-template fitter over one or more channels.
#[derive(Debug, Clone)]
pub struct TemplateFitter {
    name: String,
    processes: Vec<ProcessConfig>,
    systematics: Vec<SystematicConfig>,
    channels: Vec<Channel>,
    /// Efficiency per channel and process (0 without a template).
    efficiencies: Vec<Vec<f64>>,
    templates: TemplateSet,
    /// Variations per channel, systematic and process.
    variations: Vec<Vec<Vec<Option<Variation>>>>,
    observed: Dataset,
    active: Dataset,
    channel_active: Vec<bool>,
    systematic_enabled: Vec<bool>,
    settings: FitSettings,
    fit_counter: u64,
}

impl TemplateFitter {
    /// Build a fitter from a model description.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        if config.processes.is_empty() {
            return Err(EnsembleError::InvalidModel("no processes defined".into()));
        }
        if config.channels.is_empty() {
            return Err(EnsembleError::InvalidModel("no channels defined".into()));
        }
        for process in &config.processes {
            let nominal = process.nominal_value();
            if !(process.min < process.max) || !(process.min..=process.max).contains(&nominal) {
                return Err(EnsembleError::InvalidModel(format!(
                    "process '{}' has range [{}, {}] and nominal {}",
                    process.name, process.min, process.max, nominal
                )));
            }
        }
        for syst in &config.systematics {
            if !(syst.min < 0.0 && syst.max > 0.0) {
                return Err(EnsembleError::InvalidModel(format!(
                    "systematic '{}' range [{}, {}] must contain 0",
                    syst.name, syst.min, syst.max
                )));
            }
        }

        let n_proc = config.processes.len();
        let n_syst = config.systematics.len();
        let mut channels = Vec::with_capacity(config.channels.len());
        let mut observed = Vec::with_capacity(config.channels.len());
        let mut efficiencies = Vec::with_capacity(config.channels.len());
        let mut templates = Vec::with_capacity(config.channels.len());
        let mut variations = Vec::with_capacity(config.channels.len());

        for ch in &config.channels {
            let edges = ch.binning.edges()?;
            let n_bins = edges.len().saturating_sub(1);
            let data = if ch.data.is_empty() {
                vec![0.0; n_bins]
            } else {
                ch.data.clone()
            };
            observed.push(Histogram::new(edges.clone(), data)?);

            let mut ch_eff = vec![0.0; n_proc];
            let mut ch_templates: Vec<Option<Vec<f64>>> = vec![None; n_proc];
            for template in &ch.templates {
                let p = config.process_index(&template.process).ok_or_else(|| {
                    EnsembleError::InvalidModel(format!(
                        "channel '{}': unknown process '{}'",
                        ch.name, template.process
                    ))
                })?;
                if ch_templates[p].is_some() {
                    return Err(EnsembleError::InvalidModel(format!(
                        "channel '{}': duplicate template for '{}'",
                        ch.name, template.process
                    )));
                }
                if template.counts.len() != n_bins {
                    return Err(EnsembleError::InvalidModel(format!(
                        "channel '{}': template '{}' has {} bins, expected {}",
                        ch.name,
                        template.process,
                        template.counts.len(),
                        n_bins
                    )));
                }
                if !(template.efficiency >= 0.0 && template.efficiency.is_finite()) {
                    return Err(EnsembleError::InvalidModel(format!(
                        "channel '{}': invalid efficiency {} for '{}'",
                        ch.name, template.efficiency, template.process
                    )));
                }
                ch_eff[p] = template.efficiency;
                ch_templates[p] = Some(template.counts.clone());
            }

            let mut ch_variations: Vec<Vec<Option<Variation>>> = vec![vec![None; n_proc]; n_syst];
            for variation in &ch.variations {
                let s = config.systematic_index(&variation.systematic).ok_or_else(|| {
                    EnsembleError::InvalidModel(format!(
                        "channel '{}': unknown systematic '{}'",
                        ch.name, variation.systematic
                    ))
                })?;
                let p = config.process_index(&variation.process).ok_or_else(|| {
                    EnsembleError::InvalidModel(format!(
                        "channel '{}': unknown process '{}'",
                        ch.name, variation.process
                    ))
                })?;
                if variation.up.len() != n_bins || variation.down.len() != n_bins {
                    return Err(EnsembleError::InvalidModel(format!(
                        "channel '{}': variation '{}' of '{}' must have {} bins",
                        ch.name, variation.systematic, variation.process, n_bins
                    )));
                }
                ch_variations[s][p] = Some(Variation {
                    up: variation.up.clone(),
                    down: variation.down.clone(),
                });
            }

            channels.push(Channel::new(ch.name.clone(), edges));
            efficiencies.push(ch_eff);
            templates.push(ch_templates);
            variations.push(ch_variations);
        }

        let observed = Dataset::new(observed);
        Ok(Self {
            name: config.name.clone(),
            processes: config.processes.clone(),
            systematics: config.systematics.clone(),
            channel_active: vec![true; channels.len()],
            systematic_enabled: vec![true; n_syst],
            channels,
            efficiencies,
            templates: TemplateSet::new(templates),
            variations,
            active: observed.clone(),
            observed,
            settings: config.fit.clone(),
            fit_counter: 0,
        })
    }

    /// Load a model YAML file and build a fitter.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(&ModelConfig::from_yaml_file(path)?)
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal parameter vector (process nominals, systematics at 0).
    pub fn nominal_parameters(&self) -> Vec<f64> {
        self.processes
            .iter()
            .map(ProcessConfig::nominal_value)
            .chain(std::iter::repeat(0.0).take(self.systematics.len()))
            .collect()
    }

    /// Lower and upper parameter bounds.
    pub fn parameter_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let lower = self
            .processes
            .iter()
            .map(|p| p.min)
            .chain(self.systematics.iter().map(|s| s.min))
            .collect();
        let upper = self
            .processes
            .iter()
            .map(|p| p.max)
            .chain(self.systematics.iter().map(|s| s.max))
            .collect();
        (lower, upper)
    }

    /// Replace the measured data (and the active dataset).
    pub fn set_observed(&mut self, dataset: Dataset) -> Result<()> {
        self.check_shape(&dataset)?;
        self.active = dataset.clone();
        self.observed = dataset;
        Ok(())
    }

    /// Which channels enter the likelihood.
    pub fn active_channels(&self) -> &[bool] {
        &self.channel_active
    }

    /// Which systematics are enabled.
    pub fn enabled_systematics(&self) -> &[bool] {
        &self.systematic_enabled
    }

    fn check_shape(&self, dataset: &Dataset) -> Result<()> {
        if !dataset.same_shape(&self.observed) {
            return Err(EnsembleError::InvalidParameter(format!(
                "dataset with {} channels does not match the binning of model '{}'",
                dataset.n_channels(),
                self.name
            )));
        }
        Ok(())
    }

    fn check_parameters(&self, parameters: &[f64]) -> Result<()> {
        let expected = self.parameter_count();
        if parameters.len() != expected {
            return Err(EnsembleError::ParameterCountMismatch {
                expected,
                actual: parameters.len(),
            });
        }
        Ok(())
    }

    /// Expected contents without argument checks.
    fn expectation(&self, channel: usize, parameters: &[f64]) -> Vec<f64> {
        let n_proc = self.processes.len();
        let n_bins = self.channels[channel].n_bins();
        let mut nu = vec![0.0; n_bins];

        for p in 0..n_proc {
            let Some(counts) = self.templates.get(channel, p) else {
                continue;
            };
            let total: f64 = counts.iter().sum();
            if total <= 0.0 {
                continue;
            }
            let scale = parameters[p] * self.efficiencies[channel][p] / total;

            for (bin, value) in nu.iter_mut().enumerate() {
                let mut factor = 1.0;
                for (s, enabled) in self.systematic_enabled.iter().enumerate() {
                    if !enabled {
                        continue;
                    }
                    if let Some(variation) = &self.variations[channel][s][p] {
                        factor += variation.shift(bin, parameters[n_proc + s]);
                    }
                }
                *value += scale * counts[bin] * factor;
            }
        }

        // Clamp negatives only; NaN must reach the caller.
        for value in nu.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
        nu
    }

    /// Binned Poisson negative log-likelihood of the active dataset plus
    /// Gaussian constraints, up to a constant.
    pub fn nll(&self, parameters: &[f64]) -> Result<f64> {
        self.check_parameters(parameters)?;
        Ok(self.nll_unchecked(parameters))
    }

    fn nll_unchecked(&self, parameters: &[f64]) -> f64 {
        let mut value = 0.0;
        for (channel, hist) in self.active.iter().enumerate() {
            if !self.channel_active[channel] {
                continue;
            }
            let nu = self.expectation(channel, parameters);
            for (&mu, &n) in nu.iter().zip(hist.contents()) {
                let mu = mu.max(MIN_NU);
                value += mu - n * mu.ln();
            }
        }

        let n_proc = self.processes.len();
        for (s, enabled) in self.systematic_enabled.iter().enumerate() {
            if *enabled {
                let theta = parameters[n_proc + s];
                value += 0.5 * theta * theta;
            }
        }
        value
    }

    /// Indices of parameters that influence an active channel.
    fn free_parameters(&self) -> Vec<usize> {
        let n_proc = self.processes.len();
        let active = |c: &usize| self.channel_active[*c];
        let channels: Vec<usize> = (0..self.channels.len()).filter(active).collect();

        let processes = (0..n_proc).filter(|&p| {
            channels
                .iter()
                .any(|&c| self.efficiencies[c][p] > 0.0 && self.templates.get(c, p).is_some())
        });
        let systematics = (0..self.systematics.len())
            .filter(|&s| {
                self.systematic_enabled[s]
                    && channels
                        .iter()
                        .any(|&c| self.variations[c][s].iter().any(Option::is_some))
            })
            .map(|s| n_proc + s);

        processes.chain(systematics).collect()
    }

    fn profile(&self, free: &[usize]) -> (Vec<f64>, Vec<f64>, f64, bool, Option<String>) {
        let nominal = self.nominal_parameters();
        let (lower, upper) = self.parameter_bounds();
        let x0: Vec<f64> = free.iter().map(|&i| nominal[i]).collect();
        let lo: Vec<f64> = free.iter().map(|&i| lower[i]).collect();
        let hi: Vec<f64> = free.iter().map(|&i| upper[i]).collect();

        let expand = |x: &[f64]| {
            let mut full = nominal.clone();
            for (&i, &v) in free.iter().zip(x) {
                full[i] = v;
            }
            full
        };
        let objective = |x: &[f64]| self.nll_unchecked(&expand(x));

        let settings = MinimizerSettings::default()
            .with_max_iterations(self.settings.max_iterations)
            .with_tolerance(self.settings.tolerance);
        let result = minimize(objective, &x0, &lo, &hi, &settings);

        let estimates = expand(&result.x);
        let mut uncertainties = vec![0.0; estimates.len()];
        let message = match result.std_errors() {
            Some(errors) => {
                for (&i, err) in free.iter().zip(errors) {
                    uncertainties[i] = err;
                }
                (!result.converged)
                    .then(|| format!("no convergence after {} iterations", result.iterations))
            }
            None => {
                for &i in free {
                    uncertainties[i] = f64::NAN;
                }
                Some("hessian is not positive definite".to_string())
            }
        };
        let ok = message.is_none();
        (estimates, uncertainties, result.value, ok, message)
    }
}

impl Fitter for TemplateFitter {
    fn parameter_names(&self) -> Vec<String> {
        self.processes
            .iter()
            .map(|p| p.name.clone())
            .chain(self.systematics.iter().map(|s| s.name.clone()))
            .collect()
    }

    fn parameter_count(&self) -> usize {
        self.processes.len() + self.systematics.len()
    }

    fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn expected(&self, channel: usize, parameters: &[f64]) -> Result<Vec<f64>> {
        self.check_parameters(parameters)?;
        if channel >= self.channels.len() {
            return Err(EnsembleError::InvalidParameter(format!(
                "channel {} out of range for {} channels",
                channel,
                self.channels.len()
            )));
        }
        Ok(self.expectation(channel, parameters))
    }

    fn observed(&self) -> &Dataset {
        &self.observed
    }

    fn active_dataset(&self) -> &Dataset {
        &self.active
    }

    fn set_active_dataset(&mut self, dataset: Dataset) -> Result<Dataset> {
        self.check_shape(&dataset)?;
        Ok(std::mem::replace(&mut self.active, dataset))
    }

    fn templates(&self) -> Option<&TemplateSet> {
        Some(&self.templates)
    }

    fn replace_templates(&mut self, templates: TemplateSet) -> Result<TemplateSet> {
        let compatible = templates.n_channels() == self.channels.len()
            && (0..self.channels.len()).all(|c| {
                (0..self.processes.len()).all(|p| {
                    match (templates.get(c, p), self.templates.get(c, p)) {
                        (Some(new), Some(old)) => new.len() == old.len(),
                        (None, None) => true,
                        _ => false,
                    }
                })
            });
        if !compatible {
            return Err(EnsembleError::InvalidModel(format!(
                "template layout does not match model '{}'",
                self.name
            )));
        }
        Ok(std::mem::replace(&mut self.templates, templates))
    }

    fn initialize(&self) -> Result<()> {
        let fail = |msg: String| Err(EnsembleError::FitterInitialization(msg));

        for (c, channel) in self.channels.iter().enumerate() {
            for (p, process) in self.processes.iter().enumerate() {
                let Some(counts) = self.templates.get(c, p) else {
                    continue;
                };
                if counts.iter().any(|v| !v.is_finite() || *v < 0.0) {
                    return fail(format!(
                        "template '{}' in channel '{}' has negative or non-finite counts",
                        process.name, channel.name
                    ));
                }
                if counts.iter().sum::<f64>() <= 0.0 {
                    return fail(format!(
                        "template '{}' in channel '{}' is empty",
                        process.name, channel.name
                    ));
                }
            }
        }

        if self
            .observed
            .iter()
            .any(|h| h.contents().iter().any(|v| !v.is_finite() || *v < 0.0))
        {
            return fail("observed data has negative or non-finite counts".into());
        }
        if self.free_parameters().is_empty() {
            return fail(format!("model '{}' has no free parameters", self.name));
        }
        Ok(())
    }

    fn fit(&mut self, mode: FitMode) -> Result<FitOutcome> {
        let fit_index = self.fit_counter;
        self.fit_counter += 1;

        let free = self.free_parameters();
        if free.is_empty() {
            return Err(EnsembleError::Fit("no free parameters".into()));
        }

        let (estimates, uncertainties, nll, profile_ok, message) = self.profile(&free);
        if !nll.is_finite() {
            return Err(EnsembleError::Fit(format!(
                "non-finite likelihood in model '{}'",
                self.name
            )));
        }

        if mode == FitMode::Profile {
            return Ok(FitOutcome {
                estimates,
                uncertainties,
                status: if profile_ok { FitStatus::Ok } else { FitStatus::Failed },
                nll: Some(nll),
                message,
            });
        }

        let (lower, upper) = self.parameter_bounds();
        let x0: Vec<f64> = free.iter().map(|&i| estimates[i]).collect();
        let lo: Vec<f64> = free.iter().map(|&i| lower[i]).collect();
        let hi: Vec<f64> = free.iter().map(|&i| upper[i]).collect();
        let steps: Vec<f64> = free
            .iter()
            .map(|&i| {
                let err = uncertainties[i];
                if err.is_finite() && err > 0.0 {
                    err
                } else {
                    0.01 * (upper[i] - lower[i])
                }
            })
            .collect();

        let expand = |x: &[f64]| {
            let mut full = estimates.clone();
            for (&i, &v) in free.iter().zip(x) {
                full[i] = v;
            }
            full
        };
        let mcmc = &self.settings.mcmc;
        let mut rng = StdRng::seed_from_u64(mcmc.seed.wrapping_add(fit_index));
        let chain = metropolis(
            |x: &[f64]| self.nll_unchecked(&expand(x)),
            &x0,
            &steps,
            &lo,
            &hi,
            mcmc.iterations,
            mcmc.burn_in,
            &mut rng,
        );

        let mut posterior_mean = estimates.clone();
        let mut posterior_std = vec![0.0; estimates.len()];
        for (k, &i) in free.iter().enumerate() {
            posterior_mean[i] = chain.mean[k];
            posterior_std[i] = chain.std[k];
        }

        let chain_ok = (MIN_ACCEPTANCE..=MAX_ACCEPTANCE).contains(&chain.acceptance);
        let message = message.or_else(|| {
            (!chain_ok).then(|| format!("chain acceptance {:.3} outside window", chain.acceptance))
        });

        Ok(FitOutcome {
            estimates: posterior_mean,
            uncertainties: posterior_std,
            status: if profile_ok && chain_ok {
                FitStatus::Ok
            } else {
                FitStatus::Failed
            },
            nll: Some(nll),
            message,
        })
    }
}

impl RestrictableFitter for TemplateFitter {
    fn systematic_names(&self) -> Vec<String> {
        self.systematics.iter().map(|s| s.name.clone()).collect()
    }

    fn restrict_to_channel(&self, channel: usize) -> Result<Self> {
        if channel >= self.channels.len() {
            return Err(EnsembleError::InvalidParameter(format!(
                "channel {} out of range for {} channels",
                channel,
                self.channels.len()
            )));
        }
        let mut restricted = self.clone();
        restricted.channel_active = (0..self.channels.len()).map(|c| c == channel).collect();
        Ok(restricted)
    }

    fn with_systematics(&self, enabled: &[bool]) -> Result<Self> {
        if enabled.len() != self.systematics.len() {
            return Err(EnsembleError::InvalidParameter(format!(
                "{} systematic flags for {} systematics",
                enabled.len(),
                self.systematics.len()
            )));
        }
        let mut copy = self.clone();
        copy.systematic_enabled = enabled.to_vec();
        Ok(copy)
    }
}
