//! Batch analyses on the measured data: one fit per channel, or per
//! systematic configuration, with per-unit output directories.

use crate::ensemble::EnsembleOptions;
use crate::error::{EnsembleError, Result};
use crate::model::{safe_name, Channel, FitOutcome, RestrictableFitter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fit result of one analysis unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUnit {
    /// Unit name, also its output directory name.
    pub name: String,
    /// Fit outcome.
    pub outcome: FitOutcome,
}

/// Results of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Parameter names.
    pub parameter_names: Vec<String>,
    /// Units in run order.
    pub units: Vec<BatchUnit>,
}

impl BatchReport {
    /// Look up a unit by name.
    pub fn unit(&self, name: &str) -> Option<&BatchUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Number of failed units.
    pub fn n_failed(&self) -> usize {
        self.units.iter().filter(|u| !u.outcome.status.is_ok()).count()
    }

    /// Write a TSV with one row per unit.
    pub fn write_summary_tsv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);

        let mut header = vec!["unit".to_string(), "status".to_string(), "nll".to_string()];
        header.extend(self.parameter_names.iter().map(|p| format!("est_{}", p)));
        header.extend(self.parameter_names.iter().map(|p| format!("err_{}", p)));
        writer.write_record(&header)?;

        for unit in &self.units {
            let mut record = vec![
                unit.name.clone(),
                unit.outcome.status.name().to_string(),
                unit.outcome.nll.map(|v| v.to_string()).unwrap_or_default(),
            ];
            record.extend(unit.outcome.estimates.iter().map(|v| v.to_string()));
            record.extend(unit.outcome.uncertainties.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write `<dir>/<unit>/result.json` for every unit and `<dir>/summary.tsv`.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        for unit in &self.units {
            let unit_dir = dir.join(safe_name(&unit.name));
            fs::create_dir_all(&unit_dir)?;
            let file = BufWriter::new(File::create(unit_dir.join("result.json"))?);
            serde_json::to_writer_pretty(file, unit)?;
        }
        fs::create_dir_all(dir)?;
        self.write_summary_tsv(BufWriter::new(File::create(dir.join("summary.tsv"))?))
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Batch Analysis")?;
        writeln!(f, "==============")?;
        for unit in &self.units {
            writeln!(f, "{} [{}]", unit.name, unit.outcome.status.name())?;
            for (i, name) in self.parameter_names.iter().enumerate() {
                let est = unit.outcome.estimates.get(i).copied().unwrap_or(f64::NAN);
                let err = unit.outcome.uncertainties.get(i).copied().unwrap_or(f64::NAN);
                writeln!(f, "  {:<16} {:>12.4} +/- {:<10.4}", name, est, err)?;
            }
        }
        Ok(())
    }
}

/// Runs restricted fits of one fitter on its measured data.
///
/// No randomness is involved; each unit is a single fit.
pub struct BatchAnalysisController<'a, F: RestrictableFitter> {
    fitter: &'a F,
    output_dir: Option<PathBuf>,
}

impl<'a, F: RestrictableFitter> BatchAnalysisController<'a, F> {
    /// Create a controller for a configured fitter.
    pub fn new(fitter: &'a F) -> Self {
        Self {
            fitter,
            output_dir: None,
        }
    }

    /// Write unit outputs below `dir`.
    pub fn with_output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    fn base(&self, options: &EnsembleOptions) -> Result<F> {
        if options.ignore_systematics {
            let n = self.fitter.systematic_names().len();
            self.fitter.with_systematics(&vec![false; n])
        } else {
            Ok(self.fitter.clone())
        }
    }

    fn fit_unit(&self, name: String, mut fitter: F, options: &EnsembleOptions) -> Result<BatchUnit> {
        fitter.set_active_dataset(fitter.observed().clone())?;
        let outcome = match fitter.fit(options.fit_mode()) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(unit = %name, error = %e, "fit failed");
                FitOutcome::failed(fitter.parameter_count(), e.to_string())
            }
        };
        info!(unit = %name, status = outcome.status.name(), "unit finished");
        Ok(BatchUnit { name, outcome })
    }

    fn finish(&self, units: Vec<BatchUnit>) -> Result<BatchReport> {
        let report = BatchReport {
            parameter_names: self.fitter.parameter_names(),
            units,
        };
        if let Some(dir) = &self.output_dir {
            report.write_to(dir)?;
        }
        Ok(report)
    }

    /// Fit every channel alone, then all channels combined.
    pub fn run_single_channel(&self, options: &EnsembleOptions) -> Result<BatchReport> {
        self.fitter
            .initialize()
            .map_err(EnsembleError::into_initialization)?;
        let base = self.base(options)?;
        let channels = base.channels().to_vec();
        info!(channels = channels.len(), "starting single-channel analysis");

        let mut units = Vec::with_capacity(channels.len() + 1);
        for (index, name) in channel_unit_names(&channels).into_iter().enumerate() {
            let restricted = base.restrict_to_channel(index)?;
            units.push(self.fit_unit(name, restricted, options)?);
        }
        units.push(self.fit_unit("combined".to_string(), base, options)?);
        self.finish(units)
    }

    /// Fit without systematics, with each systematic alone, and with all of them.
    ///
    /// With `ignore_systematics` set only the first of these units is run.
    pub fn run_single_systematic(&self, options: &EnsembleOptions) -> Result<BatchReport> {
        self.fitter
            .initialize()
            .map_err(EnsembleError::into_initialization)?;
        let names = self.fitter.systematic_names();
        let n = names.len();
        info!(systematics = n, "starting single-systematic analysis");

        let mut units = vec![self.fit_unit(
            "nosyst".to_string(),
            self.fitter.with_systematics(&vec![false; n])?,
            options,
        )?];
        if !options.ignore_systematics {
            for (index, name) in names.iter().enumerate() {
                let mask: Vec<bool> = (0..n).map(|s| s == index).collect();
                units.push(self.fit_unit(
                    format!("syst_{}", safe_name(name)),
                    self.fitter.with_systematics(&mask)?,
                    options,
                )?);
            }
            units.push(self.fit_unit(
                "all".to_string(),
                self.fitter.with_systematics(&vec![true; n])?,
                options,
            )?);
        }
        self.finish(units)
    }
}

/// Distinct unit names for single-channel fits.
///
/// A name that is already taken (by an earlier channel after sanitizing, or
/// by the `combined` unit) gets the channel index appended.
fn channel_unit_names(channels: &[Channel]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::from(["combined".to_string()]);
    channels
        .iter()
        .enumerate()
        .map(|(index, channel)| {
            let mut name = channel.safe_name();
            if taken.contains(&name) {
                name = format!("{}_{}", name, index);
            }
            while taken.contains(&name) {
                name.push('_');
            }
            taken.insert(name.clone());
            name
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, Histogram};
    use crate::model::{Fitter, ModelConfig, TemplateFitter};

    fn fitter() -> TemplateFitter {
        fitter_from(&ModelConfig::example())
    }

    fn fitter_from(config: &ModelConfig) -> TemplateFitter {
        let mut fitter = TemplateFitter::from_config(config).unwrap();
        let nominal = fitter.nominal_parameters();
        let histograms = (0..2)
            .map(|c| {
                let nu = fitter.expected(c, &nominal).unwrap();
                let counts = nu.iter().map(|v| v.round()).collect();
                Histogram::new(fitter.channels()[c].edges.clone(), counts).unwrap()
            })
            .collect();
        fitter.set_observed(Dataset::new(histograms)).unwrap();
        fitter
    }

    #[test]
    fn test_single_channel_units() {
        let fitter = fitter();
        let report = BatchAnalysisController::new(&fitter)
            .run_single_channel(&EnsembleOptions::default())
            .unwrap();
        let names: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["ee", "mumu", "combined"]);
        assert_eq!(report.n_failed(), 0);
    }

    #[test]
    fn test_single_systematic_units() {
        let fitter = fitter();
        let report = BatchAnalysisController::new(&fitter)
            .run_single_systematic(&EnsembleOptions::default())
            .unwrap();
        let names: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["nosyst", "syst_energy_scale", "all"]);
        let nosyst = report.unit("nosyst").unwrap();
        assert_eq!(nosyst.outcome.estimates[3], 0.0);
        assert_eq!(nosyst.outcome.uncertainties[3], 0.0);

        let only = BatchAnalysisController::new(&fitter)
            .run_single_systematic(&EnsembleOptions::parse("nosyst"))
            .unwrap();
        assert_eq!(only.units.len(), 1);
    }

    #[test]
    fn test_nosyst_in_single_channel() {
        let fitter = fitter();
        let report = BatchAnalysisController::new(&fitter)
            .run_single_channel(&EnsembleOptions::parse("nosyst"))
            .unwrap();
        assert!(report.units.iter().all(|u| u.outcome.estimates[3] == 0.0));
    }

    #[test]
    fn test_output_layout() {
        let fitter = fitter();
        let dir = tempfile::tempdir().unwrap();
        let report = BatchAnalysisController::new(&fitter)
            .with_output_dir(dir.path())
            .run_single_channel(&EnsembleOptions::default())
            .unwrap();
        assert!(dir.path().join("ee").join("result.json").exists());
        assert!(dir.path().join("combined").join("result.json").exists());
        let summary = std::fs::read_to_string(dir.path().join("summary.tsv")).unwrap();
        assert_eq!(summary.lines().count(), report.units.len() + 1);
        assert!(summary.starts_with("unit\tstatus\tnll\test_signal"));
    }

    #[test]
    fn test_clashing_channel_names_get_distinct_units() {
        let mut config = ModelConfig::example();
        config.channels[0].name = "combined".into();
        let dir = tempfile::tempdir().unwrap();
        let report = BatchAnalysisController::new(&fitter_from(&config))
            .with_output_dir(dir.path())
            .run_single_channel(&EnsembleOptions::default())
            .unwrap();
        let names: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["combined_0", "mumu", "combined"]);
        assert!(dir.path().join("combined_0").join("result.json").exists());

        let mut config = ModelConfig::example();
        config.channels[0].name = "e mu".into();
        config.channels[1].name = "e_mu".into();
        let report = BatchAnalysisController::new(&fitter_from(&config))
            .run_single_channel(&EnsembleOptions::default())
            .unwrap();
        let names: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["e_mu", "e_mu_1", "combined"]);
    }

    #[test]
    fn test_initialization_error_not_rewrapped() {
        let mut config = ModelConfig::example();
        config.channels[1].templates[2].counts = vec![0.0; 20];
        let fitter = TemplateFitter::from_config(&config).unwrap();
        for err in [
            BatchAnalysisController::new(&fitter)
                .run_single_channel(&EnsembleOptions::default())
                .unwrap_err(),
            BatchAnalysisController::new(&fitter)
                .run_single_systematic(&EnsembleOptions::default())
                .unwrap_err(),
        ] {
            assert!(matches!(err, EnsembleError::FitterInitialization(_)));
            assert_eq!(err.to_string().matches("initialization failed").count(), 1);
        }
    }
}
