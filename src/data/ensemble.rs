//! Synthetic datasets and ensemble collections.

use crate::data::histogram::Dataset;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// How a synthetic dataset was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetOrigin {
    /// Bin contents drawn from Poisson distributions around the expectation.
    Sampled,
    /// Copy of the measured data.
    ActualData,
}

/// One pseudo-data realization together with the parameters behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDataset {
    /// Per-channel histograms.
    pub dataset: Dataset,
    /// Parameter vector the expectation was computed from.
    pub parameters: Vec<f64>,
    /// Row of the input parameter table, if any.
    pub source_row: Option<usize>,
    /// How the contents were produced.
    pub origin: DatasetOrigin,
}

impl SyntheticDataset {
    /// Create a new synthetic dataset.
    pub fn new(
        dataset: Dataset,
        parameters: Vec<f64>,
        source_row: Option<usize>,
        origin: DatasetOrigin,
    ) -> Self {
        Self {
            dataset,
            parameters,
            source_row,
            origin,
        }
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.dataset.n_channels()
    }

    /// Consume and return the histograms.
    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }
}

/// An ordered, fixed-size collection of synthetic datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleCollection {
    parameter_names: Vec<String>,
    channel_names: Vec<String>,
    datasets: Vec<SyntheticDataset>,
}

impl EnsembleCollection {
    /// Create a collection.
    pub fn new(
        parameter_names: Vec<String>,
        channel_names: Vec<String>,
        datasets: Vec<SyntheticDataset>,
    ) -> Self {
        Self {
            parameter_names,
            channel_names,
            datasets,
        }
    }

    /// Number of ensembles.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// One ensemble.
    pub fn get(&self, index: usize) -> Option<&SyntheticDataset> {
        self.datasets.get(index)
    }

    /// Iterate over ensembles in generation order.
    pub fn iter(&self) -> impl Iterator<Item = &SyntheticDataset> {
        self.datasets.iter()
    }

    /// Parameter names.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// Channel names.
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Consume into the datasets.
    pub fn into_datasets(self) -> Vec<SyntheticDataset> {
        self.datasets
    }

    /// Write a row-oriented TSV: one row per ensemble, parameters first, then
    /// every bin of every channel (`<channel>_bin<k>`).
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);

        let mut header = vec!["ensemble".to_string(), "source_row".to_string()];
        header.extend(self.parameter_names.iter().cloned());
        if let Some(first) = self.datasets.first() {
            for (channel, hist) in first.dataset.iter().enumerate() {
                let name = self
                    .channel_names
                    .get(channel)
                    .cloned()
                    .unwrap_or_else(|| format!("channel{}", channel));
                header.extend((0..hist.n_bins()).map(|bin| format!("{}_bin{}", name, bin)));
            }
        }
        writer.write_record(&header)?;

        for (index, ensemble) in self.datasets.iter().enumerate() {
            let mut record = vec![
                index.to_string(),
                ensemble.source_row.map(|r| r.to_string()).unwrap_or_default(),
            ];
            record.extend(ensemble.parameters.iter().map(|v| v.to_string()));
            record.extend(ensemble.dataset.flat_contents().iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the collection to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_tsv(BufWriter::new(File::create(path)?))
    }
}

impl IntoIterator for EnsembleCollection {
    type Item = SyntheticDataset;
    type IntoIter = std::vec::IntoIter<SyntheticDataset>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.into_iter()
    }
}
