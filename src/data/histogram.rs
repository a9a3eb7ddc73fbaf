//! One-dimensional binned histograms and per-channel datasets.

use crate::error::{EnsembleError, Result};
use serde::{Deserialize, Serialize};

/// A one-dimensional histogram with explicit bin edges.
///
/// Contents are stored as `f64` so that expectations and sampled counts share
/// one representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Bin edges, `n_bins + 1` strictly increasing values.
    edges: Vec<f64>,
    /// Bin contents.
    contents: Vec<f64>,
}

impl Histogram {
    /// Create a histogram from edges and contents.
    pub fn new(edges: Vec<f64>, contents: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        if contents.len() + 1 != edges.len() {
            return Err(EnsembleError::InvalidParameter(format!(
                "histogram has {} edges but {} bin contents",
                edges.len(),
                contents.len()
            )));
        }
        Ok(Self { edges, contents })
    }

    /// Create an empty histogram with the given edges.
    pub fn zeros(edges: Vec<f64>) -> Result<Self> {
        let n_bins = edges.len().saturating_sub(1);
        Self::new(edges, vec![0.0; n_bins])
    }

    /// Create an empty histogram with `n_bins` equal-width bins on `[lo, hi)`.
    pub fn uniform(n_bins: usize, lo: f64, hi: f64) -> Result<Self> {
        Self::zeros(uniform_edges(n_bins, lo, hi)?)
    }

    /// Copy of this histogram with new contents on the same binning.
    pub fn with_contents(&self, contents: Vec<f64>) -> Result<Self> {
        Self::new(self.edges.clone(), contents)
    }

    /// Number of bins.
    #[inline]
    pub fn n_bins(&self) -> usize {
        self.contents.len()
    }

    /// Bin edges.
    #[inline]
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin contents.
    #[inline]
    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    /// Content of one bin, `None` when out of range.
    #[inline]
    pub fn get(&self, bin: usize) -> Option<f64> {
        self.contents.get(bin).copied()
    }

    /// Centre of one bin.
    pub fn bin_center(&self, bin: usize) -> Option<f64> {
        if bin >= self.n_bins() {
            return None;
        }
        Some(0.5 * (self.edges[bin] + self.edges[bin + 1]))
    }

    /// Sum of all bin contents.
    pub fn total(&self) -> f64 {
        self.contents.iter().sum()
    }

    /// Whether another histogram uses identical binning.
    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.edges == other.edges
    }
}

/// Edges for `n_bins` equal-width bins on `[lo, hi)`.
pub fn uniform_edges(n_bins: usize, lo: f64, hi: f64) -> Result<Vec<f64>> {
    if n_bins == 0 {
        return Err(EnsembleError::InvalidParameter(
            "histogram needs at least one bin".to_string(),
        ));
    }
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
        return Err(EnsembleError::InvalidParameter(format!(
            "invalid histogram range [{}, {})",
            lo, hi
        )));
    }
    let width = (hi - lo) / n_bins as f64;
    Ok((0..=n_bins).map(|i| lo + width * i as f64).collect())
}

fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(EnsembleError::InvalidParameter(
            "histogram needs at least two edges".to_string(),
        ));
    }
    if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(EnsembleError::InvalidParameter(
            "histogram edges must be finite and strictly increasing".to_string(),
        ));
    }
    Ok(())
}

/// One histogram per channel, in channel order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    histograms: Vec<Histogram>,
}

impl Dataset {
    /// Create a dataset from per-channel histograms.
    pub fn new(histograms: Vec<Histogram>) -> Self {
        Self { histograms }
    }

    /// Number of channels.
    #[inline]
    pub fn n_channels(&self) -> usize {
        self.histograms.len()
    }

    /// Histogram of one channel.
    #[inline]
    pub fn histogram(&self, channel: usize) -> Option<&Histogram> {
        self.histograms.get(channel)
    }

    /// All histograms in channel order.
    #[inline]
    pub fn histograms(&self) -> &[Histogram] {
        &self.histograms
    }

    /// Iterate over channel histograms.
    pub fn iter(&self) -> impl Iterator<Item = &Histogram> {
        self.histograms.iter()
    }

    /// Total number of bins over all channels.
    pub fn total_bins(&self) -> usize {
        self.histograms.iter().map(Histogram::n_bins).sum()
    }

    /// All bin contents flattened in channel order.
    pub fn flat_contents(&self) -> Vec<f64> {
        self.histograms
            .iter()
            .flat_map(|h| h.contents().iter().copied())
            .collect()
    }

    /// Whether another dataset has the same channel count and binning.
    pub fn same_shape(&self, other: &Dataset) -> bool {
        self.n_channels() == other.n_channels()
            && self
                .histograms
                .iter()
                .zip(other.histograms.iter())
                .all(|(a, b)| a.same_binning(b))
    }
}
