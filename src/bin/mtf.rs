//! MTF - ensemble testing CLI for multi-template fits.

use clap::{Parser, Subcommand};
use mtf_ensemble::batch::BatchAnalysisController;
use mtf_ensemble::data::ParameterTable;
use mtf_ensemble::ensemble::{
    build_many, build_many_from_table, summarize, sweep, sweep_parallel, EnsembleOptions,
    EnsembleTestRunner, ParameterSource, RunnerConfig,
};
use mtf_ensemble::error::{EnsembleError, Result};
use mtf_ensemble::model::{Fitter, ModelConfig, TemplateFitter};
use mtf_ensemble::random::SeededRandom;
use std::path::PathBuf;

/// Ensemble and calibration testing for multi-template fits
#[derive(Parser)]
#[command(name = "mtf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example model YAML
    Example {
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Generate pseudo-datasets and write them as TSV
    Generate {
        /// Model YAML
        #[arg(short, long)]
        model: PathBuf,

        /// Parameter vector (comma-separated, default: nominal values)
        #[arg(short, long, value_delimiter = ',')]
        parameters: Vec<f64>,

        /// Parameter table TSV; one ensemble per row
        #[arg(short, long, conflicts_with = "parameters")]
        table: Option<PathBuf>,

        /// First table row to use
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Number of ensembles
        #[arg(short, long, default_value = "100")]
        nensembles: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ensemble options (e.g. "data")
        #[arg(long, default_value = "")]
        options: String,

        /// Output TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run an ensemble test and print the summary
    Ensemble {
        /// Model YAML
        #[arg(short, long)]
        model: PathBuf,

        /// Parameter vector (comma-separated, default: nominal values)
        #[arg(short, long, value_delimiter = ',')]
        parameters: Vec<f64>,

        /// Parameter table TSV; one trial per row
        #[arg(short, long, conflicts_with = "parameters")]
        table: Option<PathBuf>,

        /// First table row to use
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Number of trials
        #[arg(short, long, default_value = "1000")]
        nensembles: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ensemble options (e.g. "MC mcmc")
        #[arg(long, default_value = "")]
        options: String,

        /// Extra fit attempts for failed trials
        #[arg(long, default_value = "0")]
        retries: usize,

        /// Confidence level for coverage
        #[arg(long, default_value = "0.6827")]
        confidence_level: f64,

        /// Output path for the result table (TSV)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sweep one parameter over a grid of true values
    Calibrate {
        /// Model YAML
        #[arg(short, long)]
        model: PathBuf,

        /// Swept parameter (name or index)
        #[arg(short, long)]
        parameter: String,

        /// Grid values (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        values: Vec<f64>,

        /// Default parameter vector (comma-separated, default: nominal values)
        #[arg(short, long, value_delimiter = ',')]
        defaults: Vec<f64>,

        /// Trials per grid value
        #[arg(short, long, default_value = "100")]
        nensembles: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ensemble options
        #[arg(long, default_value = "")]
        options: String,

        /// Run grid values in parallel
        #[arg(long)]
        parallel: bool,

        /// Confidence level for coverage
        #[arg(long, default_value = "0.6827")]
        confidence_level: f64,

        /// Directory for per-point tables and the calibration curve
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Fit each channel alone and all channels combined
    SingleChannel {
        /// Model YAML
        #[arg(short, long)]
        model: PathBuf,

        /// Options ("nosyst", "mcmc")
        #[arg(long, default_value = "")]
        options: String,

        /// Output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Fit with no systematics, each systematic alone, and all systematics
    SingleSystematic {
        /// Model YAML
        #[arg(short, long)]
        model: PathBuf,

        /// Options ("nosyst", "mcmc")
        #[arg(long, default_value = "")]
        options: String,

        /// Output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Example { output } => cmd_example(&output),

        Commands::Generate {
            model,
            parameters,
            table,
            offset,
            nensembles,
            seed,
            options,
            output,
        } => cmd_generate(
            &model,
            &parameters,
            table.as_ref(),
            offset,
            nensembles,
            seed,
            &options,
            &output,
        ),

        Commands::Ensemble {
            model,
            parameters,
            table,
            offset,
            nensembles,
            seed,
            options,
            retries,
            confidence_level,
            output,
            json,
        } => cmd_ensemble(
            &model,
            &parameters,
            table.as_ref(),
            offset,
            nensembles,
            seed,
            &options,
            retries,
            confidence_level,
            output.as_ref(),
            json,
        ),

        Commands::Calibrate {
            model,
            parameter,
            values,
            defaults,
            nensembles,
            seed,
            options,
            parallel,
            confidence_level,
            output_dir,
        } => cmd_calibrate(
            &model,
            &parameter,
            &values,
            &defaults,
            nensembles,
            seed,
            &options,
            parallel,
            confidence_level,
            output_dir.as_ref(),
        ),

        Commands::SingleChannel {
            model,
            options,
            output_dir,
        } => cmd_batch(&model, &options, output_dir.as_ref(), false),

        Commands::SingleSystematic {
            model,
            options,
            output_dir,
        } => cmd_batch(&model, &options, output_dir.as_ref(), true),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_model(path: &PathBuf) -> Result<TemplateFitter> {
    eprintln!("Loading model from {:?}...", path);
    let fitter = TemplateFitter::from_yaml_file(path)?;
    eprintln!(
        "Model '{}': {} parameters, {} channels",
        fitter.name(),
        fitter.parameter_count(),
        fitter.channels().len()
    );
    Ok(fitter)
}

fn or_nominal(fitter: &TemplateFitter, parameters: &[f64]) -> Vec<f64> {
    if parameters.is_empty() {
        fitter.nominal_parameters()
    } else {
        parameters.to_vec()
    }
}

/// Write an example model
fn cmd_example(output: &PathBuf) -> Result<()> {
    std::fs::write(output, ModelConfig::example().to_yaml()?)?;
    eprintln!("Example model written to {:?}", output);
    Ok(())
}

/// Generate pseudo-data
#[allow(clippy::too_many_arguments)]
fn cmd_generate(
    model: &PathBuf,
    parameters: &[f64],
    table: Option<&PathBuf>,
    offset: usize,
    nensembles: usize,
    seed: u64,
    options: &str,
    output: &PathBuf,
) -> Result<()> {
    let fitter = load_model(model)?;
    let options = EnsembleOptions::parse(options);
    let mut rng = SeededRandom::new(seed);

    let collection = match table {
        Some(path) => {
            let table = ParameterTable::from_tsv(path)?;
            build_many_from_table(&fitter, &mut rng, &table, nensembles, offset, &options)?
        }
        None => {
            let parameters = or_nominal(&fitter, parameters);
            build_many(&fitter, &mut rng, &parameters, nensembles, &options)?
        }
    };

    collection.to_tsv(output)?;
    eprintln!("Wrote {} ensembles to {:?}", collection.len(), output);
    Ok(())
}

/// Run an ensemble test
#[allow(clippy::too_many_arguments)]
fn cmd_ensemble(
    model: &PathBuf,
    parameters: &[f64],
    table: Option<&PathBuf>,
    offset: usize,
    nensembles: usize,
    seed: u64,
    options: &str,
    retries: usize,
    confidence_level: f64,
    output: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let mut fitter = load_model(model)?;
    let options = EnsembleOptions::parse(options);
    let mut rng = SeededRandom::new(seed);
    let fixed = or_nominal(&fitter, parameters);
    let input = table.map(ParameterTable::from_tsv).transpose()?;

    let source = match &input {
        Some(table) => ParameterSource::Table { table, offset },
        None => ParameterSource::Fixed(&fixed),
    };

    eprintln!("Running {} trials (seed {})...", nensembles, seed);
    let results = EnsembleTestRunner::new(&mut fitter, &mut rng)
        .with_config(RunnerConfig::default().with_max_retries(retries))
        .run(source, nensembles, &options)?;

    if let Some(path) = output {
        results.to_tsv(path)?;
        eprintln!("Result table written to {:?}", path);
    }

    let summary = summarize(&results, confidence_level)?;
    if json {
        println!("{}", summary.to_json()?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

fn resolve_parameter(fitter: &TemplateFitter, parameter: &str) -> Result<usize> {
    if let Ok(index) = parameter.parse::<usize>() {
        return Ok(index);
    }
    fitter
        .parameter_names()
        .iter()
        .position(|n| n == parameter)
        .ok_or_else(|| EnsembleError::InvalidParameter(format!("unknown parameter '{}'", parameter)))
}

/// Run a calibration sweep
#[allow(clippy::too_many_arguments)]
fn cmd_calibrate(
    model: &PathBuf,
    parameter: &str,
    values: &[f64],
    defaults: &[f64],
    nensembles: usize,
    seed: u64,
    options: &str,
    parallel: bool,
    confidence_level: f64,
    output_dir: Option<&PathBuf>,
) -> Result<()> {
    let mut fitter = load_model(model)?;
    let options = EnsembleOptions::parse(options);
    let index = resolve_parameter(&fitter, parameter)?;
    let defaults = or_nominal(&fitter, defaults);

    eprintln!(
        "Sweeping parameter {} over {} values, {} trials each...",
        parameter,
        values.len(),
        nensembles
    );
    let run = if parallel {
        sweep_parallel(
            &fitter,
            seed,
            &RunnerConfig::default(),
            &defaults,
            index,
            values,
            nensembles,
            &options,
        )?
    } else {
        let mut rng = SeededRandom::new(seed);
        let mut runner = EnsembleTestRunner::new(&mut fitter, &mut rng);
        sweep(&mut runner, &defaults, index, values, nensembles, &options)?
    };

    if let Some(dir) = output_dir {
        run.write_tables(dir)?;
        run.to_tsv(dir.join("calibration.tsv"), confidence_level)?;
        eprintln!("Calibration written to {:?}", dir);
    }

    println!("Calibration of '{}'", run.parameter_name);
    println!(
        "{:>12} {:>6} {:>12} {:>12} {:>12} {:>10} {:>10}",
        "true", "ok", "mean", "std", "bias", "pull", "coverage"
    );
    for p in run.curve(confidence_level)? {
        println!(
            "{:>12.4} {:>6} {:>12.4} {:>12.4} {:>12.4} {:>10.3} {:>9.1}%",
            p.value,
            p.n_ok,
            p.estimate_mean,
            p.estimate_std,
            p.bias,
            p.pull_mean,
            p.coverage * 100.0
        );
    }
    Ok(())
}

/// Run a batch analysis on the measured data
fn cmd_batch(
    model: &PathBuf,
    options: &str,
    output_dir: Option<&PathBuf>,
    per_systematic: bool,
) -> Result<()> {
    let fitter = load_model(model)?;
    let options = EnsembleOptions::parse(options);
    let mut controller = BatchAnalysisController::new(&fitter);
    if let Some(dir) = output_dir {
        controller = controller.with_output_dir(dir);
    }

    let report = if per_systematic {
        controller.run_single_systematic(&options)?
    } else {
        controller.run_single_channel(&options)?
    };

    println!("{}", report);
    if report.n_failed() > 0 {
        eprintln!("{} of {} fits failed", report.n_failed(), report.units.len());
    }
    Ok(())
}
