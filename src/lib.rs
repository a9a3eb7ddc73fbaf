//! Ensemble testing and calibration for binned multi-template fits.
//!
//! The library generates pseudo-data from a fit model, refits every
//! pseudo-dataset and collects the estimates into result tables for bias,
//! pull and coverage studies.
//!
//! # Overview
//!
//! - **data**: histograms, datasets, parameter and result tables
//! - **random**: seeded random variate source
//! - **model**: the `Fitter` interface and a multi-template implementation
//! - **ensemble**: ensemble builder, test runner, calibration sweeps, summaries
//! - **batch**: single-channel and single-systematic fits on the measured data
//!
//! # Example
//!
//! ```no_run
//! use mtf_ensemble::prelude::*;
//!
//! let mut fitter = TemplateFitter::from_yaml_file("model.yaml").unwrap();
//! let truth = fitter.nominal_parameters();
//! let mut rng = SeededRandom::new(42);
//!
//! let table = EnsembleTestRunner::new(&mut fitter, &mut rng)
//!     .run(ParameterSource::Fixed(&truth), 1000, &EnsembleOptions::default())
//!     .unwrap();
//! println!("{}", summarize(&table, 0.6827).unwrap());
//! ```

pub mod batch;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod model;
pub mod random;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::batch::{BatchAnalysisController, BatchReport, BatchUnit};
    pub use crate::data::{
        Dataset, DatasetOrigin, EnsembleCollection, Histogram, ParameterTable, ResultRow,
        ResultTable, SyntheticDataset,
    };
    pub use crate::ensemble::{
        build_many, build_many_from_table, build_one, fluctuate_templates, summarize, sweep,
        sweep_parallel, CalibrationPoint, CalibrationRun, CancelFlag, EnsembleOptions,
        EnsembleSummary, EnsembleTestRunner, ParameterSource, ParameterSummary, RunnerConfig,
        SweepPoint,
    };
    pub use crate::error::{EnsembleError, Result};
    pub use crate::model::{
        Channel, FitMode, FitOutcome, FitStatus, Fitter, ModelConfig, RestrictableFitter,
        TemplateFitter, TemplateSet,
    };
    pub use crate::random::{Draw, RandomSource, SeededRandom};
}
