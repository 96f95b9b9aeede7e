use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry::config::Config;
use gantry_common::cr::TriggerRequest;
use gantry_common::intervention::ResumeOverrides;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[derive(Parser)]
#[command(name = "gantry", version, about = "Pipeline orchestration core for AI-driven change requests")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = ".gantry/gantry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller server.
    Serve {
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Trigger a change request against a running controller.
    Trigger {
        #[arg(long, default_value = "http://127.0.0.1:3960")]
        server: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        external_id: Option<String>,
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long)]
        repo_default_branch: Option<String>,
        #[arg(long)]
        test_command: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Resume a paused run, optionally with gate overrides.
    Resume {
        #[arg(long, default_value = "http://127.0.0.1:3960")]
        server: String,
        cr_id: String,
        #[arg(long)]
        review_passed: Option<bool>,
        #[arg(long)]
        rebase_clean: Option<bool>,
        #[arg(long)]
        ci_passed: Option<bool>,
        #[arg(long)]
        approved: Option<bool>,
    },
    /// Send free-text guidance to a running CR.
    Intervene {
        #[arg(long, default_value = "http://127.0.0.1:3960")]
        server: String,
        cr_id: String,
        instructions: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    // The server logs to a daily-rolling file as well as stderr; client
    // subcommands log to stderr only. The guard must outlive main.
    let _log_guard = match &cli.command {
        Command::Serve { .. } => {
            let appender = tracing_appender::rolling::daily(".gantry/logs", "gantry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("gantry=info")),
                )
                .with_writer(writer.and(std::io::stderr))
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("gantry=warn")),
                )
                .init();
            None
        }
    };

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = Some(port);
            }
            gantry::api::server::start_server(config).await
        }
        Command::Trigger {
            server,
            title,
            description,
            source,
            external_id,
            repo_url,
            repo_default_branch,
            test_command,
            model,
        } => {
            let request = TriggerRequest {
                title,
                description,
                source,
                external_id,
                repo_url,
                repo_default_branch,
                test_command,
                model,
                ..Default::default()
            };
            let response = reqwest::Client::new()
                .post(format!("{}/api/pipeline/trigger", server))
                .json(&request)
                .send()
                .await
                .context("Failed to reach the controller")?;
            print_response(response).await
        }
        Command::Resume {
            server,
            cr_id,
            review_passed,
            rebase_clean,
            ci_passed,
            approved,
        } => {
            let overrides = ResumeOverrides {
                verified: None,
                review_passed,
                rebase_clean,
                ci_passed,
                approved,
            };
            let body = if overrides.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::json!({"overrides": overrides})
            };
            let response = reqwest::Client::new()
                .post(format!("{}/api/pipeline/{}/resume", server, cr_id))
                .json(&body)
                .send()
                .await
                .context("Failed to reach the controller")?;
            print_response(response).await
        }
        Command::Intervene {
            server,
            cr_id,
            instructions,
        } => {
            let response = reqwest::Client::new()
                .post(format!("{}/api/pipeline/{}/intervene", server, cr_id))
                .json(&serde_json::json!({"instructions": instructions}))
                .send()
                .await
                .context("Failed to reach the controller")?;
            print_response(response).await
        }
    }
}

async fn print_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if status.is_success() {
        if !text.is_empty() {
            println!("{}", text);
        }
        Ok(())
    } else {
        anyhow::bail!("controller returned {}: {}", status, text)
    }
}
