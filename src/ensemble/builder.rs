//! Pseudo-data generation.
//!
//! Datasets are shaped like the fitter's channels. Every bin of every
//! channel is a Poisson draw around the model expectation for a parameter
//! vector, or a verbatim copy of the measured data.

use super::options::EnsembleOptions;
use crate::data::{
    DatasetOrigin, Dataset, EnsembleCollection, Histogram, ParameterTable, SyntheticDataset,
};
use crate::error::{EnsembleError, Result};
use crate::model::{Fitter, TemplateSet};
use crate::random::RandomSource;

/// Fail with `ParameterCountMismatch` unless `parameters` fits the model,
/// and with `InvalidParameter` if any entry is not finite.
pub fn check_parameters<F: Fitter + ?Sized>(fitter: &F, parameters: &[f64]) -> Result<()> {
    let expected = fitter.parameter_count();
    if parameters.len() != expected {
        return Err(EnsembleError::ParameterCountMismatch {
            expected,
            actual: parameters.len(),
        });
    }
    if let Some(index) = parameters.iter().position(|v| !v.is_finite()) {
        let name = fitter
            .parameter_names()
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string());
        return Err(EnsembleError::InvalidParameter(format!(
            "parameter '{}' is {}",
            name, parameters[index]
        )));
    }
    Ok(())
}

fn check_count(nensembles: usize) -> Result<()> {
    if nensembles < 1 {
        return Err(EnsembleError::InvalidEnsembleCount(nensembles));
    }
    Ok(())
}

/// Expected contents of every channel, validated for sampling.
fn expectations<F: Fitter + ?Sized>(fitter: &F, parameters: &[f64]) -> Result<Vec<Vec<f64>>> {
    (0..fitter.channels().len())
        .map(|channel| {
            let mut nu = fitter.expected(channel, parameters)?;
            for value in nu.iter_mut() {
                if !value.is_finite() {
                    return Err(EnsembleError::InvalidDistributionParameter {
                        distribution: "poisson",
                        reason: format!(
                            "non-finite expectation {} in channel '{}'",
                            value,
                            fitter.channels()[channel].name
                        ),
                    });
                }
                *value = value.max(0.0);
            }
            Ok(nu)
        })
        .collect()
}

pub(crate) fn sample<F, R>(
    fitter: &F,
    rng: &mut R,
    parameters: &[f64],
    source_row: Option<usize>,
    options: &EnsembleOptions,
) -> Result<SyntheticDataset>
where
    F: Fitter + ?Sized,
    R: RandomSource + ?Sized,
{
    if options.actual_data {
        return Ok(SyntheticDataset::new(
            fitter.observed().clone(),
            parameters.to_vec(),
            source_row,
            DatasetOrigin::ActualData,
        ));
    }

    // All expectations first, so a bad parameter vector consumes no draws.
    let expected = expectations(fitter, parameters)?;

    let mut histograms = Vec::with_capacity(expected.len());
    for (channel, nu) in fitter.channels().iter().zip(expected) {
        let counts = nu
            .into_iter()
            .map(|mean| rng.poisson(mean))
            .collect::<Result<Vec<f64>>>()?;
        histograms.push(Histogram::new(channel.edges.clone(), counts)?);
    }

    Ok(SyntheticDataset::new(
        Dataset::new(histograms),
        parameters.to_vec(),
        source_row,
        DatasetOrigin::Sampled,
    ))
}

/// Build one synthetic dataset for `parameters`.
///
/// With `actual_data` set the measured histograms are returned unchanged and
/// no random draws are consumed.
pub fn build_one<F, R>(
    fitter: &F,
    rng: &mut R,
    parameters: &[f64],
    options: &EnsembleOptions,
) -> Result<SyntheticDataset>
where
    F: Fitter + ?Sized,
    R: RandomSource + ?Sized,
{
    check_parameters(fitter, parameters)?;
    sample(fitter, rng, parameters, None, options)
}

/// Build `nensembles` independent datasets for one parameter vector.
pub fn build_many<F, R>(
    fitter: &F,
    rng: &mut R,
    parameters: &[f64],
    nensembles: usize,
    options: &EnsembleOptions,
) -> Result<EnsembleCollection>
where
    F: Fitter + ?Sized,
    R: RandomSource + ?Sized,
{
    check_parameters(fitter, parameters)?;
    check_count(nensembles)?;

    let datasets = (0..nensembles)
        .map(|_| sample(fitter, &mut *rng, parameters, None, options))
        .collect::<Result<Vec<_>>>()?;
    Ok(collection(fitter, datasets))
}

/// Build one dataset per table row, for rows `offset..offset + nensembles`.
///
/// Columns are matched to the model's parameters by name; extra columns are
/// ignored.
pub fn build_many_from_table<F, R>(
    fitter: &F,
    rng: &mut R,
    table: &ParameterTable,
    nensembles: usize,
    offset: usize,
    options: &EnsembleOptions,
) -> Result<EnsembleCollection>
where
    F: Fitter + ?Sized,
    R: RandomSource + ?Sized,
{
    let rows = table_parameters(fitter, table, nensembles, offset)?;

    let datasets = rows
        .iter()
        .enumerate()
        .map(|(k, parameters)| sample(fitter, &mut *rng, parameters, Some(offset + k), options))
        .collect::<Result<Vec<_>>>()?;
    Ok(collection(fitter, datasets))
}

/// Validate a parameter table against the model and extract the parameter
/// vectors of rows `offset..offset + nensembles`, in model order.
///
/// Every check runs before any draw or fit.
pub(crate) fn table_parameters<F: Fitter + ?Sized>(
    fitter: &F,
    table: &ParameterTable,
    nensembles: usize,
    offset: usize,
) -> Result<Vec<Vec<f64>>> {
    let names = fitter.parameter_names();
    if table.n_columns() < names.len() {
        return Err(EnsembleError::ParameterCountMismatch {
            expected: names.len(),
            actual: table.n_columns(),
        });
    }
    let columns = names
        .iter()
        .map(|name| {
            table
                .column(name)
                .ok_or_else(|| EnsembleError::MissingColumn(name.clone()))
        })
        .collect::<Result<Vec<usize>>>()?;

    check_count(nensembles)?;
    let required = offset.saturating_add(nensembles);
    if table.n_rows() < required {
        return Err(EnsembleError::InsufficientRows {
            required,
            available: table.n_rows(),
        });
    }

    (offset..required)
        .map(|index| {
            let row = table.row(index).ok_or(EnsembleError::InsufficientRows {
                required,
                available: table.n_rows(),
            })?;
            let parameters: Vec<f64> = columns.iter().map(|&c| row[c]).collect();
            check_parameters(fitter, &parameters).map_err(|e| match e {
                EnsembleError::InvalidParameter(reason) => {
                    EnsembleError::InvalidParameter(format!("table row {}: {}", index, reason))
                }
                other => other,
            })?;
            Ok(parameters)
        })
        .collect()
}

fn collection<F: Fitter + ?Sized>(fitter: &F, datasets: Vec<SyntheticDataset>) -> EnsembleCollection {
    EnsembleCollection::new(
        fitter.parameter_names(),
        fitter.channels().iter().map(|c| c.name.clone()).collect(),
        datasets,
    )
}

/// Poisson-fluctuate every raw template bin, simulating finite template statistics.
pub fn fluctuate_templates<R: RandomSource + ?Sized>(
    templates: &TemplateSet,
    rng: &mut R,
) -> Result<TemplateSet> {
    templates.try_map(|count| rng.poisson(count.max(0.0)))
}
