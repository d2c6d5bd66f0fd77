use anyhow::Result;
use clap::Parser;
use newsift::runtime::config::{api_key_from_env, EngineConfigBuilder};
use newsift::runtime::telemetry::init_tracing;
use newsift::Runner;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "newsift",
    version,
    about = "Two-stage LLM triage for news listings"
)]
struct Cli {
    /// Path to the TOML run config.
    #[arg(short, long, default_value = "newsift.toml")]
    config: PathBuf,

    /// Override the matching criteria from the config file.
    #[arg(long)]
    criteria: Option<String>,

    /// Override the number of concurrent evaluations.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Skip the cheap screening stage and evaluate full content directly.
    #[arg(long)]
    no_screening: bool,

    /// Override the result log path.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing();

    let mut builder = EngineConfigBuilder::from_file(&cli.config)?.api_key(api_key_from_env()?);
    if let Some(criteria) = cli.criteria {
        builder = builder.criteria(criteria);
    }
    if let Some(concurrency) = cli.concurrency {
        builder = builder.concurrency(concurrency);
    }
    if cli.no_screening {
        builder = builder.screening_enabled(false);
    }
    if let Some(output) = cli.output {
        builder = builder.output_path(output);
    }
    let config = builder.build()?;

    let runner = Runner::new(config);
    let summary = runner.run_until_ctrl_c().await?;

    let counters = summary.counters;
    println!();
    println!(
        "evaluated {} candidates in {:.1?}",
        counters.completed, summary.elapsed
    );
    println!("  matched            {}", counters.matched);
    println!("  not matched        {}", counters.not_matched);
    println!("  summary rejected   {}", counters.summary_rejected);
    println!("  fetch failed       {}", counters.fetch_failed);
    println!("  evaluation failed  {}", counters.evaluation_failed);
    println!("  duplicates skipped {}", counters.duplicates_skipped);
    println!(
        "  tokens             {} in / {} out",
        counters.screening_tokens.input + counters.evaluation_tokens.input,
        counters.screening_tokens.output + counters.evaluation_tokens.output
    );

    if summary.interrupted {
        // Conventional exit status for SIGINT-terminated work.
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}
