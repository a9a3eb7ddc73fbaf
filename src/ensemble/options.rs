//! Options controlling ensemble generation and fitting.

use crate::model::FitMode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Structured ensemble options.
///
/// The legacy token strings (`"data"`, `"MC"`, `"mcmc"`, `"nosyst"`) are
/// parsed once into this record by [`EnsembleOptions::parse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleOptions {
    /// Use the measured data instead of Poisson samples.
    pub actual_data: bool,
    /// Replace the fitter's templates by Poisson fluctuations of themselves.
    pub fluctuate_templates: bool,
    /// Run the marginalized (MCMC) fit instead of the profile fit.
    pub marginalize: bool,
    /// Disable all systematic uncertainties (batch analyses only).
    pub ignore_systematics: bool,
}

impl EnsembleOptions {
    /// Parse a token string. Tokens are separated by whitespace, commas or
    /// semicolons and matched case-insensitively. Unknown tokens are ignored.
    pub fn parse(tokens: &str) -> Self {
        let mut options = Self::default();
        for token in tokens
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
        {
            match token.to_ascii_lowercase().as_str() {
                "data" | "use-actual-data" => options.actual_data = true,
                "mc" | "fluctuate-templates" => options.fluctuate_templates = true,
                "mcmc" => options.marginalize = true,
                "nosyst" => options.ignore_systematics = true,
                other => debug!(token = other, "ignoring unknown ensemble option"),
            }
        }
        options
    }

    /// Use the measured data.
    pub fn with_actual_data(mut self, on: bool) -> Self {
        self.actual_data = on;
        self
    }

    /// Fluctuate the templates.
    pub fn with_fluctuated_templates(mut self, on: bool) -> Self {
        self.fluctuate_templates = on;
        self
    }

    /// Use the marginalized fit.
    pub fn with_marginalize(mut self, on: bool) -> Self {
        self.marginalize = on;
        self
    }

    /// Disable systematics.
    pub fn with_ignore_systematics(mut self, on: bool) -> Self {
        self.ignore_systematics = on;
        self
    }

    /// Fit mode selected by these options.
    pub fn fit_mode(&self) -> FitMode {
        if self.marginalize {
            FitMode::Marginalize
        } else {
            FitMode::Profile
        }
    }
}
