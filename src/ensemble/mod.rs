//! Ensemble generation, ensemble testing and calibration sweeps.
//!
//! - [`builder`]: pseudo-data from a parameter vector or a parameter table
//! - [`runner`]: one fit per pseudo-dataset, collected into a [`ResultTable`](crate::data::ResultTable)
//! - [`calibration`]: the runner repeated over a grid of true values
//! - [`summary`]: bias, pull and coverage statistics over a table

pub mod builder;
pub mod calibration;
pub mod options;
pub mod runner;
pub mod summary;

pub use builder::{build_many, build_many_from_table, build_one, fluctuate_templates};
pub use calibration::{sweep, sweep_parallel, CalibrationPoint, CalibrationRun, SweepPoint};
pub use options::EnsembleOptions;
pub use runner::{CancelFlag, EnsembleTestRunner, ParameterSource, RunnerConfig};
pub use summary::{summarize, EnsembleSummary, ParameterSummary};
