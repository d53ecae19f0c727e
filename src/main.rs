mod aggregate;
mod blame;
mod cache;
mod config;
mod coverage;
mod diff;
mod engine;
mod report;
mod source;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use crate::source::bitbucket::BitbucketProvider;
use crate::source::github::GitHubProvider;
use crate::source::mock::MockProvider;
use crate::source::Provider;

/// Review coverage: how much of the code removed by merged pull requests was
/// removed with the approval of the people who wrote it.
#[derive(Parser, Debug)]
#[command(name = "review-coverage", version, about)]
struct Cli {
    /// Hosting provider to query. Not required when --mock is used.
    #[arg(value_enum)]
    provider: Option<ProviderKind>,

    /// Workspace (GitHub organization or Bitbucket workspace) to score; repeatable.
    /// Every accessible workspace is scored when omitted.
    #[arg(short, long = "workspace")]
    workspaces: Vec<String>,

    /// Only score these repositories (`slug` or `workspace/slug`); repeatable
    #[arg(short, long = "repo")]
    repos: Vec<String>,

    /// Where to write the JSON report
    #[arg(short, long, default_value = "report.json")]
    output: PathBuf,

    /// Config file (defaults to .review-coverage.toml in the working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use built-in mock data for demo purposes (no credentials needed)
    #[arg(long)]
    r#mock: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderKind {
    Github,
    Bitbucket,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = config::Config::load(cli.config.as_deref())?;

    let provider: Box<dyn Provider> = if cli.r#mock {
        info!("using mock provider data for demo");
        Box::new(MockProvider::from_json(include_str!(
            "../tests/fixtures/demo.json"
        ))?)
    } else {
        let kind = cli.provider.ok_or(
            "PROVIDER is required unless --mock is used. Usage: review-coverage <github|bitbucket> or review-coverage --mock",
        )?;
        match kind {
            ProviderKind::Github => Box::new(GitHubProvider::new(&config)?),
            ProviderKind::Bitbucket => Box::new(BitbucketProvider::new(&config)?),
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing with partial results");
            on_signal.cancel();
        }
    });

    let span = info_span!("coverage_run", provider = %provider.name());
    let built_report = engine::Engine::new(provider.as_ref(), config.coverage.clone(), cancel)
        .with_repo_filter(cli.repos)
        .run(&cli.workspaces)
        .instrument(span)
        .await;

    report::output(&built_report, Some(cli.output.as_path()))?;
    info!(
        coverage = ?built_report.coverage,
        workspaces = built_report.workspaces_considered,
        cancelled = built_report.cancelled,
        output = %cli.output.display(),
        "done"
    );

    Ok(())
}
