use std::path::PathBuf;

use anyhow::{Context, Result};
use cidchk_checker::{CheckOutcome, CheckService, CheckerConfig};
use cidchk_core::CheckRequest;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cidchk")]
#[command(about = "DataCap allocation compliance checker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check one application issue and print the resulting summary.
    Check {
        #[arg(long)]
        issue: u64,
        /// `owner/name` of the repository holding the issue.
        #[arg(long)]
        repo: String,
        /// Related client address checked together with the applicant.
        #[arg(long = "other-address")]
        other_addresses: Vec<String>,
        /// Read the issue body from a file instead of the tracker.
        #[arg(long)]
        body_file: Option<PathBuf>,
        /// Post the summary back on the issue (ignored when DRY_RUN is set).
        #[arg(long)]
        comment: bool,
        /// Print the full report instead of the summary.
        #[arg(long)]
        full: bool,
    },
    /// Run the HTTP trigger.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let json = std::env::var("CIDCHK_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CheckerConfig::from_env()?;

    match cli.command {
        Commands::Check {
            issue,
            repo,
            other_addresses,
            body_file,
            comment,
            full,
        } => {
            let issue_body = match &body_file {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => String::new(),
            };
            let request = CheckRequest {
                issue_number: issue,
                repository: repo,
                issue_title: String::new(),
                issue_body,
                other_addresses,
            };

            let service = CheckService::from_config(&config).await?;
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                let timeout = config.check_timeout();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => warn!("interrupted, cancelling check"),
                        _ = tokio::time::sleep(timeout) => warn!("check timed out, cancelling"),
                    }
                    cancel.cancel();
                });
            }

            let outcome = service.run(request.clone(), &cancel).await?;
            match &outcome {
                CheckOutcome::Report(report) if full => println!("{}", report.report),
                other => println!("{}", other.comment_body()),
            }
            if comment {
                if let Some(url) = service.post_comment(&request, &outcome).await? {
                    info!(%url, "posted comment");
                }
            }
        }
        Commands::Serve => {
            cidchk_web::serve(&config).await?;
        }
    }

    Ok(())
}
