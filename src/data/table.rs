//! Tabular inputs and outputs of ensemble runs.
//!
//! [`ParameterTable`] holds parameter vectors row by row (for example posterior
//! samples of an earlier fit). [`ResultTable`] is the append-only per-trial log
//! written by the ensemble test runner.

use crate::ensemble::EnsembleOptions;
use crate::error::{EnsembleError, Result};
use crate::model::{FitOutcome, FitStatus};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Rows of parameter vectors with named columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTable {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ParameterTable {
    /// Create an empty table with the given column names.
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            rows: Vec::new(),
        }
    }

    /// Create a table from column names and rows.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        let mut table = Self::new(names);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Append one row.
    pub fn push_row(&mut self, row: Vec<f64>) -> Result<()> {
        if row.len() != self.names.len() {
            return Err(EnsembleError::InvalidParameter(format!(
                "parameter row has {} values but the table has {} columns",
                row.len(),
                self.names.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.names.len()
    }

    /// Position of a named column.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// One row.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    /// Load a table from a TSV file whose header holds the parameter names.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Load a table from any TSV reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(reader);

        let names: Vec<String> = reader.headers()?.iter().map(|s| s.trim().to_string()).collect();
        if names.is_empty() {
            return Err(EnsembleError::InvalidParameter(
                "parameter table has no columns".to_string(),
            ));
        }

        let mut table = Self::new(names);
        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            let row = record
                .iter()
                .enumerate()
                .map(|(col, field)| {
                    field.trim().parse::<f64>().map_err(|_| {
                        EnsembleError::InvalidParameter(format!(
                            "invalid value '{}' at row {}, column {}",
                            field, row_idx, col
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            table.push_row(row)?;
        }

        Ok(table)
    }

    /// Write the table as TSV.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::new(File::create(path)?));
        writer.write_record(&self.names)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One ensemble trial: what went in, what the fit returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    /// Trial index within its run.
    pub trial: usize,
    /// Row of the input parameter table, if the parameters came from one.
    pub source_row: Option<usize>,
    /// Parameter vector the pseudo-data were generated from.
    pub parameters: Vec<f64>,
    /// Fitted point estimates (posterior means in marginalized mode).
    pub estimates: Vec<f64>,
    /// Fitted uncertainties.
    pub uncertainties: Vec<f64>,
    /// Fit status.
    pub status: FitStatus,
    /// Number of fit attempts, including retries.
    pub attempts: usize,
    /// Negative log-likelihood at the best fit, when available.
    pub nll: Option<f64>,
    /// Options used to generate and fit this trial.
    pub flags: EnsembleOptions,
}

impl ResultRow {
    /// Build a row from a fit outcome.
    pub fn from_outcome(
        trial: usize,
        source_row: Option<usize>,
        parameters: Vec<f64>,
        outcome: FitOutcome,
        attempts: usize,
        flags: EnsembleOptions,
    ) -> Self {
        Self {
            trial,
            source_row,
            parameters,
            estimates: outcome.estimates,
            uncertainties: outcome.uncertainties,
            status: outcome.status,
            attempts,
            nll: outcome.nll,
            flags,
        }
    }

    /// Whether the fit for this trial succeeded.
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Residual `estimate - true value` for one parameter.
    pub fn residual(&self, index: usize) -> Option<f64> {
        Some(self.estimates.get(index)? - self.parameters.get(index)?)
    }

    /// Pull `(estimate - true) / uncertainty` for one parameter.
    pub fn pull(&self, index: usize) -> Option<f64> {
        let err = *self.uncertainties.get(index)?;
        if !(err.is_finite() && err > 0.0) {
            return None;
        }
        Some(self.residual(index)? / err)
    }
}

/// Append-only table of trial results for one analysis unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultTable {
    label: String,
    parameter_names: Vec<String>,
    rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Create an empty table.
    pub fn new(label: impl Into<String>, parameter_names: Vec<String>) -> Self {
        Self {
            label: label.into(),
            parameter_names,
            rows: Vec::new(),
        }
    }

    /// Append a row. Vector lengths must match the table's parameter count.
    pub fn push(&mut self, row: ResultRow) -> Result<()> {
        let expected = self.parameter_names.len();
        for (what, len) in [
            ("parameters", row.parameters.len()),
            ("estimates", row.estimates.len()),
            ("uncertainties", row.uncertainties.len()),
        ] {
            if len != expected {
                return Err(EnsembleError::InvalidParameter(format!(
                    "result row has {} {} but the table has {} parameters",
                    len, what, expected
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Table label (run name, grid point, unit name).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replace the table label.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Parameter names in column order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows in trial order.
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter()
    }

    /// Rows whose fit succeeded.
    pub fn ok_rows(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(|r| r.is_ok())
    }

    /// Number of failed trials.
    pub fn n_failed(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_ok()).count()
    }

    /// Column header used by the TSV writer.
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["trial".to_string(), "source_row".to_string()];
        for prefix in ["true", "est", "err"] {
            header.extend(self.parameter_names.iter().map(|n| format!("{}_{}", prefix, n)));
        }
        header.extend(
            [
                "status",
                "attempts",
                "nll",
                "actual_data",
                "fluctuate_templates",
                "marginalize",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        header
    }

    /// Write the table as TSV to any writer.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);

        writer.write_record(self.header())?;
        for row in &self.rows {
            let mut record = vec![
                row.trial.to_string(),
                row.source_row.map(|r| r.to_string()).unwrap_or_default(),
            ];
            record.extend(row.parameters.iter().map(|v| v.to_string()));
            record.extend(row.estimates.iter().map(|v| v.to_string()));
            record.extend(row.uncertainties.iter().map(|v| v.to_string()));
            record.push(row.status.name().to_string());
            record.push(row.attempts.to_string());
            record.push(row.nll.map(|v| v.to_string()).unwrap_or_default());
            record.push(row.flags.actual_data.to_string());
            record.push(row.flags.fluctuate_templates.to_string());
            record.push(row.flags.marginalize.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the table to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_tsv(BufWriter::new(File::create(path)?))
    }

    /// Convert to JSON format for export.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(trial: usize, status: FitStatus) -> ResultRow {
        ResultRow {
            trial,
            source_row: None,
            parameters: vec![10.0, 1.0],
            estimates: vec![12.0, 0.5],
            uncertainties: vec![2.0, 0.0],
            status,
            attempts: 1,
            nll: Some(3.5),
            flags: EnsembleOptions::default(),
        }
    }

    #[test]
    fn test_parameter_table_roundtrip_from_tsv() {
        let tsv = "signal\tbackground\n1.5\t100\n2.5\t110\n";
        let table = ParameterTable::from_reader(tsv.as_bytes()).unwrap();
        assert_eq!(table.names(), &["signal".to_string(), "background".to_string()]);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.row(1), Some(&[2.5, 110.0][..]));
        assert_eq!(table.column("background"), Some(1));
        assert_eq!(table.column("flat"), None);
    }

    #[test]
    fn test_parameter_table_rejects_bad_values() {
        let tsv = "a\tb\n1.0\tx\n";
        assert!(matches!(
            ParameterTable::from_reader(tsv.as_bytes()),
            Err(EnsembleError::InvalidParameter(_))
        ));

        let mut table = ParameterTable::new(vec!["a".into()]);
        assert!(table.push_row(vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_residual_and_pull() {
        let r = row(0, FitStatus::Ok);
        assert_eq!(r.residual(0), Some(2.0));
        assert_eq!(r.pull(0), Some(1.0));
        // zero uncertainty has no pull
        assert_eq!(r.pull(1), None);
        assert_eq!(r.pull(5), None);
    }

    #[test]
    fn test_result_table_push_validates_lengths() {
        let mut table = ResultTable::new("run", vec!["s".into(), "b".into()]);
        table.push(row(0, FitStatus::Ok)).unwrap();
        table.push(row(1, FitStatus::Failed)).unwrap();

        let mut bad = row(2, FitStatus::Ok);
        bad.estimates.pop();
        assert!(table.push(bad).is_err());

        assert_eq!(table.len(), 2);
        assert_eq!(table.ok_rows().count(), 1);
        assert_eq!(table.n_failed(), 1);
    }

    #[test]
    fn test_result_table_tsv() {
        let mut table = ResultTable::new("run", vec!["s".into(), "b".into()]);
        table.push(row(0, FitStatus::Ok)).unwrap();

        let mut buf = Vec::new();
        table.write_tsv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "trial\tsource_row\ttrue_s\ttrue_b\test_s\test_b\terr_s\terr_b\tstatus\tattempts\tnll\tactual_data\tfluctuate_templates\tmarginalize"
        );
        assert_eq!(
            lines.next().unwrap(),
            "0\t\t10\t1\t12\t0.5\t2\t0\tok\t1\t3.5\tfalse\tfalse\tfalse"
        );
    }
}
