use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde_json::Value;

use abuse_guard::config::load_config;

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for abuse-guard", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GUARD_ADMIN_KEY", default_value = "admin-secret-key")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service and store status
    Status,
    /// List registered rate-limit policies
    Policies,
    /// Show recent security events for an identifier
    Events {
        identifier: String,
        /// Only events of this type (e.g. auth_failure)
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
        #[arg(short, long)]
        window_secs: Option<u64>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show current window usage for an identifier under a policy
    Usage { scope: String, identifier: String },
    /// Validate a configuration file without starting the service
    Validate { config: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let url = match cli.command {
        Commands::Validate { config } => {
            return match load_config(&config) {
                Ok(parsed) => {
                    println!(
                        "{} is valid ({} alert thresholds, store: {:?})",
                        config.display(),
                        parsed.alerts.len(),
                        parsed.store.backend
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
        }
        Commands::Status => admin_url(&cli.url, &["status"], &[])?,
        Commands::Policies => admin_url(&cli.url, &["policies"], &[])?,
        Commands::Usage { scope, identifier } => {
            admin_url(&cli.url, &["limits", &scope, &identifier], &[])?
        }
        Commands::Events {
            identifier,
            event_type,
            window_secs,
            limit,
        } => {
            let mut params = Vec::new();
            if let Some(t) = event_type {
                params.push(("type", t));
            }
            if let Some(w) = window_secs {
                params.push(("window_secs", w.to_string()));
            }
            if let Some(l) = limit {
                params.push(("limit", l.to_string()));
            }
            admin_url(&cli.url, &["events", &identifier], &params)?
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let res = reqwest::Client::new()
        .get(url)
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

/// `{base}/admin/{segments...}?{query}`, with every segment and query value
/// percent-encoded.
fn admin_url(
    base: &str,
    segments: &[&str],
    query: &[(&str, String)],
) -> Result<Url, Box<dyn std::error::Error>> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| format!("{} cannot be used as a base URL", base))?
        .pop_if_empty()
        .push("admin")
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
