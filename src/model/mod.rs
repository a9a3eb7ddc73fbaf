//! The fit model interface consumed by the ensemble engine.
//!
//! The engine never looks inside an estimator. It needs the parameter layout,
//! the channel binning, the expected bin contents for a parameter vector, a
//! way to swap the active dataset (and optionally the templates), and a fit.
//! [`TemplateFitter`] is the bundled binned multi-template implementation.

mod config;
mod optimize;
mod template;

pub use config::{
    Binning, ChannelConfig, FitSettings, McmcSettings, ModelConfig, ProcessConfig,
    SystematicConfig, TemplateConfig, VariationConfig,
};
pub use optimize::{metropolis, minimize, McmcResult, MinimizeResult, MinimizerSettings};
pub use template::TemplateFitter;

use crate::data::Dataset;
use crate::error::{EnsembleError, Result};
use serde::{Deserialize, Serialize};

/// A named measurement channel and its binning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel name.
    pub name: String,
    /// Bin edges.
    pub edges: Vec<f64>,
}

impl Channel {
    /// Create a channel.
    pub fn new(name: impl Into<String>, edges: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            edges,
        }
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }

    /// Name with anything but alphanumerics, `-` and `_` replaced, for file paths.
    pub fn safe_name(&self) -> String {
        safe_name(&self.name)
    }
}

pub(crate) fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Inference mode of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitMode {
    /// Point estimate at the likelihood maximum.
    Profile,
    /// Posterior summaries from Markov chain sampling.
    Marginalize,
}

/// Outcome status of one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Ok,
    Failed,
}

impl FitStatus {
    /// Check whether the fit succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Integer status code (0 = ok).
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
        }
    }

    /// Get the descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

/// Estimates returned by a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    /// Point estimates, one per parameter.
    pub estimates: Vec<f64>,
    /// Uncertainties, one per parameter.
    pub uncertainties: Vec<f64>,
    /// Status.
    pub status: FitStatus,
    /// Negative log-likelihood at the best fit.
    pub nll: Option<f64>,
    /// Diagnostic message for failed fits.
    pub message: Option<String>,
}

impl FitOutcome {
    /// A failed outcome with undefined estimates.
    pub fn failed(n_parameters: usize, message: impl Into<String>) -> Self {
        Self {
            estimates: vec![f64::NAN; n_parameters],
            uncertainties: vec![f64::NAN; n_parameters],
            status: FitStatus::Failed,
            nll: None,
            message: Some(message.into()),
        }
    }
}

/// Raw (unnormalized) template counts, indexed by channel then process.
///
/// A process without a template in a channel is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSet {
    counts: Vec<Vec<Option<Vec<f64>>>>,
}

impl TemplateSet {
    /// Create a template set.
    pub fn new(counts: Vec<Vec<Option<Vec<f64>>>>) -> Self {
        Self { counts }
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.counts.len()
    }

    /// Raw counts of one process in one channel.
    pub fn get(&self, channel: usize, process: usize) -> Option<&[f64]> {
        self.counts.get(channel)?.get(process)?.as_deref()
    }

    /// Apply a fallible transformation to every template bin, keeping the layout.
    pub fn try_map<E>(&self, mut f: impl FnMut(f64) -> std::result::Result<f64, E>) -> std::result::Result<Self, E> {
        let counts = self
            .counts
            .iter()
            .map(|channel| {
                channel
                    .iter()
                    .map(|template| {
                        template
                            .as_ref()
                            .map(|bins| bins.iter().map(|&c| f(c)).collect::<std::result::Result<Vec<f64>, E>>())
                            .transpose()
                    })
                    .collect::<std::result::Result<Vec<_>, E>>()
            })
            .collect::<std::result::Result<Vec<_>, E>>()?;
        Ok(Self { counts })
    }
}

/// A statistical estimator driven by the ensemble engine.
pub trait Fitter {
    /// Parameter names in parameter order.
    fn parameter_names(&self) -> Vec<String>;

    /// Number of parameters.
    fn parameter_count(&self) -> usize {
        self.parameter_names().len()
    }

    /// Channels in channel order.
    fn channels(&self) -> &[Channel];

    /// Expected bin contents of one channel for a parameter vector.
    fn expected(&self, channel: usize, parameters: &[f64]) -> Result<Vec<f64>>;

    /// The measured data.
    fn observed(&self) -> &Dataset;

    /// The dataset the next fit will use.
    fn active_dataset(&self) -> &Dataset;

    /// Install a dataset for subsequent fits, returning the previous one.
    fn set_active_dataset(&mut self, dataset: Dataset) -> Result<Dataset>;

    /// Templates the fit uses, if the fitter exposes them.
    fn templates(&self) -> Option<&TemplateSet> {
        None
    }

    /// Install templates, returning the previous ones.
    fn replace_templates(&mut self, _templates: TemplateSet) -> Result<TemplateSet> {
        Err(EnsembleError::InvalidModel(
            "fitter does not expose templates".to_string(),
        ))
    }

    /// Check that the fitter can run at all.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Fit the active dataset.
    ///
    /// A failure confined to this fit is either a `Failed` outcome or
    /// `EnsembleError::Fit`. Any other error aborts the calling run.
    fn fit(&mut self, mode: FitMode) -> Result<FitOutcome>;
}

/// A fitter that can be narrowed to a subset of channels or systematics.
pub trait RestrictableFitter: Fitter + Clone {
    /// Systematic source names.
    fn systematic_names(&self) -> Vec<String>;

    /// Copy that only uses one channel.
    fn restrict_to_channel(&self, channel: usize) -> Result<Self>;

    /// Copy with the given systematics enabled (one flag per systematic).
    fn with_systematics(&self, enabled: &[bool]) -> Result<Self>;
}
