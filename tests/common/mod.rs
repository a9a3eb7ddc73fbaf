//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use mtf_ensemble::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Raw template count of every parameter in its own bin.
pub const TEMPLATE_COUNT: f64 = 1000.0;

/// Constant background in every bin.
pub const BACKGROUND: f64 = 100.0;

/// One channel with one bin per parameter. Bin `i` expects `p_i * t_i + 100`,
/// where `t_i` is the raw template count of parameter `i` (1000 unless
/// fluctuated). The fit inverts this bin by bin.
///
/// Every call to `expected` and `fit` is counted; clones share the counters.
#[derive(Debug, Clone)]
pub struct LinearFitter {
    n: usize,
    channels: Vec<Channel>,
    observed: Dataset,
    active: Dataset,
    templates: TemplateSet,
    pub expected_calls: Arc<AtomicUsize>,
    pub fit_calls: Arc<AtomicUsize>,
}

impl LinearFitter {
    pub fn new(n: usize) -> Self {
        let edges: Vec<f64> = (0..=n).map(|i| i as f64).collect();
        let observed_counts: Vec<f64> = (0..n).map(|i| 1000.0 * (i + 1) as f64 + BACKGROUND).collect();
        let observed = Dataset::new(vec![Histogram::new(edges.clone(), observed_counts).unwrap()]);
        let templates = TemplateSet::new(vec![(0..n)
            .map(|p| {
                let mut counts = vec![0.0; n];
                counts[p] = TEMPLATE_COUNT;
                Some(counts)
            })
            .collect()]);
        Self {
            n,
            channels: vec![Channel::new("bins", edges)],
            active: observed.clone(),
            observed,
            templates,
            expected_calls: Arc::new(AtomicUsize::new(0)),
            fit_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fits(&self) -> usize {
        self.fit_calls.load(Ordering::SeqCst)
    }

    pub fn expectations(&self) -> usize {
        self.expected_calls.load(Ordering::SeqCst)
    }

    fn scale(&self, p: usize) -> f64 {
        self.templates.get(0, p).map(|t| t[p]).unwrap_or(TEMPLATE_COUNT)
    }
}

impl Fitter for LinearFitter {
    fn parameter_names(&self) -> Vec<String> {
        (0..self.n).map(|i| format!("p{}", i)).collect()
    }

    fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn expected(&self, channel: usize, parameters: &[f64]) -> Result<Vec<f64>> {
        self.expected_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(channel, 0);
        assert_eq!(parameters.len(), self.n, "engine passed a wrong-length vector");
        Ok((0..self.n)
            .map(|i| parameters[i] * self.scale(i) + BACKGROUND)
            .collect())
    }

    fn observed(&self) -> &Dataset {
        &self.observed
    }

    fn active_dataset(&self) -> &Dataset {
        &self.active
    }

    fn set_active_dataset(&mut self, dataset: Dataset) -> Result<Dataset> {
        Ok(std::mem::replace(&mut self.active, dataset))
    }

    fn templates(&self) -> Option<&TemplateSet> {
        Some(&self.templates)
    }

    fn replace_templates(&mut self, templates: TemplateSet) -> Result<TemplateSet> {
        Ok(std::mem::replace(&mut self.templates, templates))
    }

    fn fit(&mut self, _mode: FitMode) -> Result<FitOutcome> {
        self.fit_calls.fetch_add(1, Ordering::SeqCst);
        let counts = self.active.flat_contents();
        let estimates = (0..self.n)
            .map(|i| (counts[i] - BACKGROUND) / self.scale(i))
            .collect();
        let uncertainties = (0..self.n)
            .map(|i| counts[i].max(1.0).sqrt() / self.scale(i))
            .collect();
        Ok(FitOutcome {
            estimates,
            uncertainties,
            status: FitStatus::Ok,
            nll: None,
            message: None,
        })
    }
}

/// Random source that counts draws by kind.
#[derive(Debug)]
pub struct CountingRandom {
    inner: SeededRandom,
    pub poisson: usize,
    pub other: usize,
}

impl CountingRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: SeededRandom::new(seed),
            poisson: 0,
            other: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.poisson + self.other
    }
}

impl RandomSource for CountingRandom {
    fn draw(&mut self, draw: Draw) -> Result<f64> {
        match draw {
            Draw::Poisson { .. } => self.poisson += 1,
            _ => self.other += 1,
        }
        self.inner.draw(draw)
    }

    fn draws(&self) -> u64 {
        self.inner.draws()
    }
}

/// The example model with observed data at the rounded nominal expectation.
pub fn template_fitter_with_data() -> TemplateFitter {
    let mut fitter = TemplateFitter::from_config(&ModelConfig::example()).unwrap();
    let nominal = fitter.nominal_parameters();
    let histograms = (0..fitter.channels().len())
        .map(|c| {
            let nu = fitter.expected(c, &nominal).unwrap();
            Histogram::new(
                fitter.channels()[c].edges.clone(),
                nu.iter().map(|v| v.round()).collect(),
            )
            .unwrap()
        })
        .collect();
    fitter.set_observed(Dataset::new(histograms)).unwrap();
    fitter
}
