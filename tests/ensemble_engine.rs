//! Integration tests for ensemble generation and the test runner.

mod common;

use common::{CountingRandom, LinearFitter, BACKGROUND, TEMPLATE_COUNT};
use mtf_ensemble::prelude::*;

#[test]
fn test_actual_data_is_bit_identical() {
    let fitter = LinearFitter::new(3);
    let mut rng = CountingRandom::new(1);
    let options = EnsembleOptions::parse("use-actual-data");

    for parameters in [[0.0, 0.0, 0.0], [1.5, 2.5, 3.5]] {
        let ds = build_one(&fitter, &mut rng, &parameters, &options).unwrap();
        let got: Vec<u64> = ds.dataset.flat_contents().iter().map(|v| v.to_bits()).collect();
        let want: Vec<u64> = fitter.observed().flat_contents().iter().map(|v| v.to_bits()).collect();
        assert_eq!(got, want);
        assert_eq!(ds.origin, DatasetOrigin::ActualData);
    }
    assert_eq!(rng.total(), 0);
}

#[test]
fn test_build_many_is_deterministic() {
    let fitter = LinearFitter::new(3);
    let parameters = [1.0, 2.0, 3.0];

    for nensembles in [1, 7, 50] {
        let mut a = SeededRandom::new(2024);
        let mut b = SeededRandom::new(2024);
        let first = build_many(&fitter, &mut a, &parameters, nensembles, &EnsembleOptions::default())
            .unwrap();
        let second = build_many(&fitter, &mut b, &parameters, nensembles, &EnsembleOptions::default())
            .unwrap();
        assert_eq!(first.len(), nensembles);
        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.dataset, y.dataset);
        }
    }

    // Fresh draws per ensemble.
    let mut rng = SeededRandom::new(7);
    let many = build_many(&fitter, &mut rng, &parameters, 2, &EnsembleOptions::default()).unwrap();
    assert_ne!(many.get(0).unwrap().dataset, many.get(1).unwrap().dataset);
}

#[test]
fn test_run_thousand_trials_converges() {
    let truth = [1.0, 2.0, 3.0];
    let mut fitter = LinearFitter::new(3);
    let mut rng = SeededRandom::new(99);
    let table = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(ParameterSource::Fixed(&truth), 1000, &EnsembleOptions::default())
        .unwrap();

    assert_eq!(table.len(), 1000);
    assert!(table
        .iter()
        .all(|r| r.status == FitStatus::Ok || r.status == FitStatus::Failed));
    assert_eq!(fitter.fits(), 1000);

    let summary = summarize(&table, 0.6827).unwrap();
    for (p, &t) in summary.parameters.iter().zip(&truth) {
        // Per-trial spread is about 0.06; the mean of 1000 trials is far tighter.
        assert!((p.estimate_mean - t).abs() < 0.01, "{} vs {}", p.estimate_mean, t);
        assert!((p.pull_std - 1.0).abs() < 0.1);
        assert!((p.coverage - 0.6827).abs() < 0.05);
    }
}

#[test]
fn test_build_from_table_rows_and_bounds() {
    let fitter = LinearFitter::new(2);
    let names = vec!["p0".to_string(), "p1".to_string()];
    let rows: Vec<Vec<f64>> = (0..59).map(|i| vec![i as f64, 0.5]).collect();
    let short = ParameterTable::from_rows(names.clone(), rows.clone()).unwrap();

    let mut rng = CountingRandom::new(3);
    let err = build_many_from_table(&fitter, &mut rng, &short, 50, 10, &EnsembleOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::InsufficientRows {
            required: 60,
            available: 59
        }
    ));
    assert_eq!(rng.total(), 0);

    let mut rows = rows;
    rows.push(vec![59.0, 0.5]);
    let table = ParameterTable::from_rows(names, rows).unwrap();
    let collection =
        build_many_from_table(&fitter, &mut rng, &table, 50, 10, &EnsembleOptions::default())
            .unwrap();
    assert_eq!(collection.len(), 50);
    for (k, ds) in collection.iter().enumerate() {
        assert_eq!(ds.source_row, Some(10 + k));
        assert_eq!(ds.parameters, vec![(10 + k) as f64, 0.5]);
    }
}

#[test]
fn test_run_from_table_records_source_rows() {
    let mut fitter = LinearFitter::new(1);
    let table = ParameterTable::from_rows(
        vec!["p0".into()],
        (0..10).map(|i| vec![i as f64]).collect(),
    )
    .unwrap();
    let mut rng = SeededRandom::new(4);
    let results = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(
            ParameterSource::Table {
                table: &table,
                offset: 4,
            },
            5,
            &EnsembleOptions::default(),
        )
        .unwrap();
    let rows: Vec<_> = results.iter().map(|r| r.source_row).collect();
    assert_eq!(rows, vec![Some(4), Some(5), Some(6), Some(7), Some(8)]);
    assert_eq!(results.rows()[2].parameters, vec![6.0]);
}

#[test]
fn test_wrong_length_fails_fast_everywhere() {
    let mut fitter = LinearFitter::new(3);
    let mut rng = CountingRandom::new(5);
    let bad = [1.0, 2.0];
    let options = EnsembleOptions::default();

    let is_mismatch = |e: EnsembleError| {
        matches!(
            e,
            EnsembleError::ParameterCountMismatch {
                expected: 3,
                actual: 2
            }
        )
    };

    assert!(is_mismatch(build_one(&fitter, &mut rng, &bad, &options).unwrap_err()));
    assert!(is_mismatch(build_many(&fitter, &mut rng, &bad, 10, &options).unwrap_err()));

    let table = ParameterTable::from_rows(
        vec!["a".into(), "b".into()],
        vec![vec![1.0, 2.0]; 20],
    )
    .unwrap();
    assert!(is_mismatch(
        build_many_from_table(&fitter, &mut rng, &table, 5, 0, &options).unwrap_err()
    ));

    {
        let mut runner = EnsembleTestRunner::new(&mut fitter, &mut rng);
        assert!(is_mismatch(
            runner.run(ParameterSource::Fixed(&bad), 10, &options).unwrap_err()
        ));
        assert!(is_mismatch(
            sweep(&mut runner, &bad, 0, &[1.0, 2.0], 10, &options).unwrap_err()
        ));
    }

    assert_eq!(fitter.fits(), 0);
    assert_eq!(fitter.expectations(), 0);
    assert_eq!(rng.total(), 0);
}

#[test]
fn test_zero_ensembles_rejected_before_fitting() {
    let mut fitter = LinearFitter::new(1);
    let mut rng = CountingRandom::new(5);
    let err = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(ParameterSource::Fixed(&[1.0]), 0, &EnsembleOptions::default())
        .unwrap_err();
    assert!(matches!(err, EnsembleError::InvalidEnsembleCount(0)));
    assert_eq!(fitter.fits(), 0);
    assert_eq!(rng.total(), 0);
}

/// Data sampling and template fluctuation are independent toggles that
/// compose: with both set, data are sampled from the nominal templates and
/// the fit sees fluctuated templates.
#[test]
fn test_fluctuation_toggles_compose() {
    let n = 2;
    let truth = [1.0, 2.0];
    let per_trial_data = n;
    let per_trial_templates = n * n;

    let draws_for = |tokens: &str| {
        let mut fitter = LinearFitter::new(n);
        let mut rng = CountingRandom::new(11);
        let table = EnsembleTestRunner::new(&mut fitter, &mut rng)
            .run(ParameterSource::Fixed(&truth), 4, &EnsembleOptions::parse(tokens))
            .unwrap();
        assert_eq!(table.len(), 4);
        // Templates restored after the run.
        assert_eq!(
            fitter.templates().unwrap().get(0, 0).unwrap()[0],
            TEMPLATE_COUNT
        );
        (rng.poisson, table)
    };

    let (plain, _) = draws_for("");
    let (mc, _) = draws_for("MC");
    let (data_mc, data_mc_table) = draws_for("data MC");
    let (data, data_table) = draws_for("data");

    assert_eq!(plain, 4 * per_trial_data);
    assert_eq!(mc, 4 * (per_trial_data + per_trial_templates));
    assert_eq!(data_mc, 4 * per_trial_templates);
    assert_eq!(data, 0);

    // Actual data alone refits the same dataset every time.
    let first = &data_table.rows()[0].estimates;
    assert!(data_table.iter().all(|r| &r.estimates == first));
    assert!((first[0] - (1100.0 - BACKGROUND) / TEMPLATE_COUNT).abs() < 1e-12);

    // With fluctuated templates the same data give different estimates.
    let a = &data_mc_table.rows()[0].estimates;
    let b = &data_mc_table.rows()[1].estimates;
    assert_ne!(a, b);
    assert!(data_mc_table.iter().all(|r| r.flags.actual_data && r.flags.fluctuate_templates));
}

#[test]
fn test_result_table_tsv_output() {
    let mut fitter = LinearFitter::new(2);
    let mut rng = SeededRandom::new(8);
    let table = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(ParameterSource::Fixed(&[1.0, 1.0]), 5, &EnsembleOptions::default())
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.tsv");
    table.to_tsv(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("trial\tsource_row\ttrue_p0\ttrue_p1\test_p0\test_p1\terr_p0\terr_p1\tstatus"));
    assert_eq!(lines.count(), 5);
}

#[test]
fn test_non_finite_parameters_fail_fast() {
    let mut fitter = LinearFitter::new(3);
    let mut rng = CountingRandom::new(5);
    let options = EnsembleOptions::default();
    let bad = [1.0, f64::NAN, 3.0];
    let is_invalid = |e: EnsembleError| matches!(e, EnsembleError::InvalidParameter(ref m) if m.contains("p1"));

    assert!(is_invalid(build_one(&fitter, &mut rng, &bad, &options).unwrap_err()));
    assert!(is_invalid(build_many(&fitter, &mut rng, &bad, 10, &options).unwrap_err()));
    {
        let mut runner = EnsembleTestRunner::new(&mut fitter, &mut rng);
        assert!(is_invalid(
            runner.run(ParameterSource::Fixed(&bad), 3, &options).unwrap_err()
        ));
        let err = runner
            .run(ParameterSource::Fixed(&[1.0, 2.0, f64::INFINITY]), 3, &options)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::InvalidParameter(ref m) if m.contains("p2")));
    }

    assert_eq!(fitter.fits(), 0);
    assert_eq!(fitter.expectations(), 0);
    assert_eq!(rng.total(), 0);
}

#[test]
fn test_non_finite_table_row_fails_before_any_trial() {
    let mut fitter = LinearFitter::new(2);
    let mut rows: Vec<Vec<f64>> = (0..5).map(|i| vec![i as f64, 1.0]).collect();
    rows[3][0] = f64::NAN;
    let table = ParameterTable::from_rows(vec!["p0".into(), "p1".into()], rows).unwrap();
    let mut rng = CountingRandom::new(6);
    let options = EnsembleOptions::default();

    let err = build_many_from_table(&fitter, &mut rng, &table, 5, 0, &options).unwrap_err();
    assert!(matches!(err, EnsembleError::InvalidParameter(_)));

    let err = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(ParameterSource::Table { table: &table, offset: 0 }, 5, &options)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::InvalidParameter(_)));

    // Rows outside the requested window are not inspected.
    let ok = build_many_from_table(&fitter, &mut rng, &table, 3, 0, &options).unwrap();
    assert_eq!(ok.len(), 3);
    assert_eq!(fitter.fits(), 0);
    assert_eq!(rng.total(), 3 * 2);
}

#[test]
fn test_table_columns_matched_by_name() {
    let mut fitter = LinearFitter::new(2);
    let table = ParameterTable::from_rows(
        vec!["chain".into(), "p1".into(), "p0".into(), "nll".into()],
        vec![vec![0.0, 5.0, 0.0, 12.5], vec![0.0, 6.0, 1.0, 11.0]],
    )
    .unwrap();
    let mut rng = SeededRandom::new(21);

    let collection =
        build_many_from_table(&fitter, &mut rng, &table, 2, 0, &EnsembleOptions::default()).unwrap();
    assert_eq!(collection.get(0).unwrap().parameters, vec![0.0, 5.0]);
    assert_eq!(collection.get(1).unwrap().parameters, vec![1.0, 6.0]);

    let results = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .run(
            ParameterSource::Table {
                table: &table,
                offset: 1,
            },
            1,
            &EnsembleOptions::default(),
        )
        .unwrap();
    assert_eq!(results.rows()[0].parameters, vec![1.0, 6.0]);
    assert_eq!(results.rows()[0].source_row, Some(1));

    let missing = ParameterTable::from_rows(vec!["p0".into(), "q".into()], vec![vec![1.0, 1.0]])
        .unwrap();
    let err = build_many_from_table(&fitter, &mut rng, &missing, 1, 0, &EnsembleOptions::default())
        .unwrap_err();
    assert!(matches!(err, EnsembleError::MissingColumn(ref name) if name == "p1"));
}
