//! Data structures for ensemble testing.

mod ensemble;
mod histogram;
mod table;

pub use ensemble::{DatasetOrigin, EnsembleCollection, SyntheticDataset};
pub use histogram::{uniform_edges, Dataset, Histogram};
pub use table::{ParameterTable, ResultRow, ResultTable};
