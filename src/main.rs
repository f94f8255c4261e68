// ABOUTME: Main entry point for the slide-illustrator program.
// ABOUTME: Provides the CLI interface and runs the library's slide processor.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use slide_illustrator::{
    utils, Config, FanOut, LogSink, ProgressSink, SlideProcessor, StatusBoard, StopFlag,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add images and a text overlay to every slide of a deck
    Enhance(EnhanceArgs),

    /// Show which search providers and keyword optimizers are configured
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
struct EnhanceArgs {
    /// Path to the input .pptx file
    #[arg(short, long)]
    input: PathBuf,

    /// Path to the output file (defaults to <input>_enhanced.pptx)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Directory for downloaded images (a per-run subdirectory is created)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Serve progress as JSON on this port while running
    #[arg(long)]
    status_port: Option<u16>,
}

#[derive(Args)]
struct CheckConfigArgs {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

fn enhance(args: &EnhanceArgs) -> anyhow::Result<()> {
    utils::validate_pptx_input(&args.input)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| utils::default_output_path(&args.input));

    let config = Config::load(Some(args.config.as_path()))
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    config.log_summary();

    let board = StatusBoard::new();
    let stop = StopFlag::new();
    let sink: Arc<dyn ProgressSink> = Arc::new(
        FanOut::new()
            .with(Arc::new(LogSink))
            .with(Arc::new(board.clone())),
    );

    let mut processor = SlideProcessor::from_config(&config)
        .context("Failed to set up the HTTP client")?
        .with_sink(sink)
        .with_stop_flag(stop.clone());
    if let Some(dir) = &args.scratch_dir {
        processor = processor.with_scratch_root(dir.clone());
    }

    let _server = match args.status_port {
        Some(port) => Some(slide_illustrator::serve(board.clone(), stop, port)?),
        None => None,
    };

    let summary = match processor.run(&args.input, &output) {
        Ok(summary) => summary,
        Err(e) => {
            board.fail(&e.to_string());
            return Err(e).with_context(|| format!("Failed to process {:?}", args.input));
        }
    };

    println!(
        "Saved {:?}: {} of {} slides illustrated",
        summary.output, summary.illustrated, summary.total_slides
    );
    Ok(())
}

fn check_config(args: &CheckConfigArgs) -> anyhow::Result<()> {
    let config = Config::load(Some(args.config.as_path()))
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    for line in config.summary() {
        println!("{}", line);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Some(Commands::Enhance(args)) => enhance(args),
        Some(Commands::CheckConfig(args)) => check_config(args),
        None => {
            println!("No command specified. Use --help for usage information.");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
