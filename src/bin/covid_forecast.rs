use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use covid_forecast::app::{App, RunOptions, RunReport};
use covid_forecast::config::{ConfigLoader, ConfigOverrides};
use covid_forecast::error::PipelineError;
use covid_forecast::feeds::FeedHttpClient;
use covid_forecast::forecast::AutoArima;
use covid_forecast::output::{ConsoleProgress, JsonOutput, OutputMode};
use covid_forecast::store::Store;

#[derive(Parser)]
#[command(name = "covid-forecast")]
#[command(about = "Backfill, forecast and assemble COVID-19 case/death series into Parquet")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full pipeline and write the master dataset")]
    Run(RunArgs),
    #[command(about = "Print the resolved configuration")]
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    horizon: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::MissingConfig(_)
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::InvalidConfig(_) => 2,
        PipelineError::FeedHttp { .. }
        | PipelineError::FeedStatus { .. }
        | PipelineError::MalformedFeed { .. }
        | PipelineError::Reference { .. } => 3,
        PipelineError::BackfillCardinality { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, output_mode),
        Commands::Check(args) => {
            let resolved = ConfigLoader::resolve(args.config.as_deref())?;
            JsonOutput::print_config(&resolved).into_diagnostic()
        }
    }
}

fn run_pipeline(args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let mut config = ConfigLoader::resolve(args.config.as_deref())?;
    ConfigOverrides {
        horizon: args.horizon,
        workers: args.workers,
        output_dir: args.output,
    }
    .apply(&mut config)?;

    let store = Store::new(&config.output)?;
    let feeds = FeedHttpClient::new()?;
    let model = AutoArima::new(config.model);
    let app = App::new(store, feeds, model);
    let options = RunOptions {
        dry_run: args.dry_run,
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let report = app.run(&config, options, &JsonOutput)?;
            JsonOutput::print_report(&report).into_diagnostic()
        }
        OutputMode::Interactive => {
            let report = app.run(&config, options, &ConsoleProgress)?;
            print_run_summary(&report);
            Ok(())
        }
    }
}

fn print_run_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}covid-forecast summary{reset}");
    println!(
        "{green}Entities: {} ({} rows, {} to {}, +{} days){reset}",
        report.entities, report.rows, report.start, report.end, report.horizon
    );
    for feed in &report.feeds {
        println!("{cyan}  {} [{}]: {} rows{reset}", feed.name, feed.source, feed.rows);
    }

    let fallback_color = if report.fallbacks.is_empty() { green } else { yellow };
    println!(
        "{fallback_color}Flat-line fallbacks: {}{reset}",
        report.fallbacks.len()
    );
    for notice in report.fallbacks.iter().take(10) {
        println!(
            "{yellow}  {} {}: {}{reset}",
            notice.entity, notice.metric, notice.reason
        );
    }
    let warning_color = if report.warnings.is_empty() { green } else { yellow };
    println!(
        "{warning_color}Resolution warnings: {}{reset}",
        report.warnings.len()
    );

    if report.dry_run {
        println!("{yellow}Dry run: nothing written{reset}");
    } else {
        println!("{green}  master: {}{reset}", report.outputs.master);
        println!("{green}  entities: {}{reset}", report.outputs.entities);
        println!("{green}  report: {}{reset}", report.outputs.report);
        for archive in &report.outputs.archives {
            println!("{green}  archive: {archive}{reset}");
        }
    }
}
