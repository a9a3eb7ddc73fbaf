//! YAML description of a binned multi-template model.

use crate::data::uniform_edges;
use crate::error::{EnsembleError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A process whose yield is a fit parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process name.
    pub name: String,
    /// Lower bound of the yield.
    #[serde(default)]
    pub min: f64,
    /// Upper bound of the yield.
    pub max: f64,
    /// Nominal yield, used as the fit starting point. Defaults to the range midpoint.
    #[serde(default)]
    pub nominal: Option<f64>,
}

impl ProcessConfig {
    /// Nominal yield, or the midpoint of the range.
    pub fn nominal_value(&self) -> f64 {
        self.nominal.unwrap_or(0.5 * (self.min + self.max))
    }
}

/// A systematic uncertainty source with a unit-Gaussian nuisance parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystematicConfig {
    /// Systematic name.
    pub name: String,
    /// Lower bound of the nuisance parameter.
    #[serde(default = "default_syst_min")]
    pub min: f64,
    /// Upper bound of the nuisance parameter.
    #[serde(default = "default_syst_max")]
    pub max: f64,
}

fn default_syst_min() -> f64 {
    -5.0
}

fn default_syst_max() -> f64 {
    5.0
}

/// Channel binning: explicit edges or equal-width bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binning {
    Edges(Vec<f64>),
    Uniform { n: usize, lo: f64, hi: f64 },
}

impl Binning {
    /// Bin edges.
    pub fn edges(&self) -> Result<Vec<f64>> {
        match self {
            Binning::Edges(edges) => Ok(edges.clone()),
            Binning::Uniform { n, lo, hi } => uniform_edges(*n, *lo, *hi),
        }
    }
}

/// Template of one process in one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Process name.
    pub process: String,
    /// Raw template counts (normalized internally).
    pub counts: Vec<f64>,
    /// Selection efficiency of the process in this channel.
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
}

fn default_efficiency() -> f64 {
    1.0
}

/// Relative shape variation of one process under one systematic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationConfig {
    /// Systematic name.
    pub systematic: String,
    /// Process name.
    pub process: String,
    /// Relative change per bin at +1 sigma.
    pub up: Vec<f64>,
    /// Relative change per bin at -1 sigma.
    pub down: Vec<f64>,
}

/// One measurement channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name.
    pub name: String,
    /// Binning.
    pub binning: Binning,
    /// Observed counts. Empty means no data yet (all zeros).
    #[serde(default)]
    pub data: Vec<f64>,
    /// Process templates.
    pub templates: Vec<TemplateConfig>,
    /// Systematic variations.
    #[serde(default)]
    pub variations: Vec<VariationConfig>,
}

/// Settings of the marginalized (MCMC) fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcSettings {
    /// Iterations kept after burn-in.
    pub iterations: usize,
    /// Iterations discarded at the start.
    pub burn_in: usize,
    /// Base seed of the sampler.
    pub seed: u64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            iterations: 4000,
            burn_in: 1000,
            seed: 1,
        }
    }
}

/// Fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    /// Maximum Newton iterations.
    pub max_iterations: usize,
    /// Relative convergence tolerance on the negative log-likelihood.
    pub tolerance: f64,
    /// MCMC settings.
    #[serde(default)]
    pub mcmc: McmcSettings,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            mcmc: McmcSettings::default(),
        }
    }
}

/// Complete model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name.
    pub name: String,
    /// Processes, in parameter order.
    pub processes: Vec<ProcessConfig>,
    /// Systematics, in parameter order after the processes.
    #[serde(default)]
    pub systematics: Vec<SystematicConfig>,
    /// Channels.
    pub channels: Vec<ChannelConfig>,
    /// Fit settings.
    #[serde(default)]
    pub fit: FitSettings,
}

impl ModelConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(EnsembleError::from)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(EnsembleError::from)
    }

    /// Index of a process by name.
    pub fn process_index(&self, name: &str) -> Option<usize> {
        self.processes.iter().position(|p| p.name == name)
    }

    /// Index of a systematic by name.
    pub fn systematic_index(&self, name: &str) -> Option<usize> {
        self.systematics.iter().position(|s| s.name == name)
    }

    /// An example model: one signal peak over two backgrounds in two
    /// channels, with one shape systematic.
    pub fn example() -> Self {
        let n_bins = 20;
        let centers: Vec<f64> = (0..n_bins).map(|i| 5.0 + 10.0 * i as f64).collect();

        let peak = |mean: f64, width: f64| -> Vec<f64> {
            centers
                .iter()
                .map(|x| (1000.0 * (-0.5 * ((x - mean) / width).powi(2)).exp()).round())
                .collect()
        };
        let falling = |slope: f64| -> Vec<f64> {
            centers
                .iter()
                .map(|x| (1000.0 * (-x / slope).exp()).round().max(1.0))
                .collect()
        };
        let flat = vec![100.0; n_bins];
        let tilt: Vec<f64> = centers.iter().map(|x| 0.1 * (x - 100.0) / 100.0).collect();

        let channel = |name: &str, signal_eff: f64| ChannelConfig {
            name: name.to_string(),
            binning: Binning::Uniform {
                n: n_bins,
                lo: 0.0,
                hi: 200.0,
            },
            data: Vec::new(),
            templates: vec![
                TemplateConfig {
                    process: "signal".into(),
                    counts: peak(100.0, 12.0),
                    efficiency: signal_eff,
                },
                TemplateConfig {
                    process: "background".into(),
                    counts: falling(80.0),
                    efficiency: 1.0,
                },
                TemplateConfig {
                    process: "flat".into(),
                    counts: flat.clone(),
                    efficiency: 1.0,
                },
            ],
            variations: vec![VariationConfig {
                systematic: "energy_scale".into(),
                process: "background".into(),
                up: tilt.clone(),
                down: tilt.iter().map(|v| -v).collect(),
            }],
        };

        Self {
            name: "example".into(),
            processes: vec![
                ProcessConfig {
                    name: "signal".into(),
                    min: 0.0,
                    max: 1000.0,
                    nominal: Some(200.0),
                },
                ProcessConfig {
                    name: "background".into(),
                    min: 0.0,
                    max: 5000.0,
                    nominal: Some(1000.0),
                },
                ProcessConfig {
                    name: "flat".into(),
                    min: 0.0,
                    max: 2000.0,
                    nominal: Some(300.0),
                },
            ],
            systematics: vec![SystematicConfig {
                name: "energy_scale".into(),
                min: -5.0,
                max: 5.0,
            }],
            channels: vec![channel("ee", 0.6), channel("mumu", 0.8)],
            fit: FitSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_roundtrip_of_example() {
        let config = ModelConfig::example();
        let yaml = config.to_yaml().unwrap();
        let parsed = ModelConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_yaml_defaults() {
        let yaml = r#"
name: minimal
processes:
  - name: signal
    max: 100
channels:
  - name: ch
    binning: [0.0, 1.0, 2.0]
    templates:
      - process: signal
        counts: [1, 3]
"#;
        let config = ModelConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.processes[0].min, 0.0);
        assert_eq!(config.processes[0].nominal_value(), 50.0);
        assert_eq!(config.channels[0].templates[0].efficiency, 1.0);
        assert!(config.channels[0].data.is_empty());
        assert_eq!(config.fit.max_iterations, 200);
        assert_eq!(config.channels[0].binning.edges().unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_uniform_binning() {
        let binning = Binning::Uniform {
            n: 4,
            lo: 0.0,
            hi: 1.0,
        };
        assert_eq!(binning.edges().unwrap(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }
}
