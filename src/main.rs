mod auth;
mod breaker;
mod coalesce;
mod config;
mod error;
mod health;
mod models;
mod pool;
mod proxy;
mod server;
mod transport;

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use auth::TokenManager;
use config::Config;
use error::{Error, Result};
use models::ModelCatalog;
use transport::HttpClient;

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");
    init_logging();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    let result = match command {
        "auth" => handle_auth().await,
        "run" => handle_run().await,
        "status" => handle_status().await,
        "config" => handle_config(),
        "models" => handle_models().await,
        "refresh" => handle_refresh().await,
        "version" | "-V" | "--version" => {
            println!("github-copilot-svcs {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        unknown => {
            eprintln!("Unknown command: {unknown}");
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(tip) = e.suggestion() {
                eprintln!("  Tip: {tip}");
            }
            ExitCode::FAILURE
        }
    }
}

/// `LOG_LEVEL` selects the level (debug/info/warn/error), defaulting to
/// info. A full filter directive also works.
fn init_logging() {
    let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_usage() {
    println!("Usage: github-copilot-svcs <command>");
    println!("Commands:");
    println!("  auth     Authenticate with GitHub Copilot");
    println!("  run      Start the proxy server");
    println!("  models   List available models");
    println!("  config   Show current configuration");
    println!("  status   Show authentication and token status");
    println!("  refresh  Force refresh of Copilot token");
    println!("  version  Show version information");
    println!("  help     Show this help message");
}

fn load_manager() -> Result<(Config, TokenManager)> {
    let config = Config::load()?;
    let client = Arc::new(HttpClient::new(&config.timeouts));
    let manager = TokenManager::new(client, config.clone(), Config::path()?);
    Ok((config, manager))
}

async fn handle_auth() -> Result<()> {
    let (_, manager) = load_manager()?;
    println!("Starting GitHub Copilot authentication...");
    manager.authenticate().await?;
    println!("Authentication successful!");
    Ok(())
}

async fn handle_run() -> Result<()> {
    let config = Config::load()?;
    let state = Arc::new(server::AppState::new(&config, Config::path()?));

    // Make sure credentials are usable before accepting traffic.
    state.tokens.ensure_valid().await?;

    println!(
        "Starting GitHub Copilot proxy server on port {}...",
        config.port
    );
    println!("Endpoints:");
    println!("  - Models: http://localhost:{}/v1/models", config.port);
    println!(
        "  - Chat:   http://localhost:{}/v1/chat/completions",
        config.port
    );
    println!("  - Health: http://localhost:{}/health", config.port);

    server::run(state, config.port).await
}

async fn handle_status() -> Result<()> {
    let (config, manager) = load_manager()?;
    let status = manager.status().await;

    println!("Configuration file: {}", Config::path()?.display());
    println!("Port: {}", config.port);

    if !status.authenticated {
        println!("Authentication: not authenticated");
        println!("Run 'github-copilot-svcs auth' to authenticate");
        return Ok(());
    }

    println!("Authentication: authenticated");
    if status.seconds_remaining > 0 {
        let minutes = status.seconds_remaining / 60;
        let seconds = status.seconds_remaining % 60;
        println!(
            "Token expires: in {minutes}m {seconds}s ({} seconds)",
            status.seconds_remaining
        );
        if status.seconds_remaining <= status.refresh_threshold {
            println!(
                "Status: token will be refreshed soon (threshold: {} seconds)",
                status.refresh_threshold
            );
        } else {
            println!("Status: token is healthy");
        }
    } else {
        println!(
            "Token expires: EXPIRED ({} seconds ago)",
            -status.seconds_remaining
        );
        println!("Status: token needs refresh");
    }
    println!("Has GitHub token: {}", status.has_github_token);
    if status.refresh_in > 0 {
        println!("Refresh interval: {} seconds", status.refresh_in);
    }

    Ok(())
}

fn handle_config() -> Result<()> {
    let config = Config::load()?;
    println!("Configuration file: {}", Config::path()?.display());
    println!("Port: {}", config.port);
    println!("Has GitHub token: {}", !config.github_token.is_empty());
    println!("Has Copilot token: {}", !config.copilot_token.is_empty());
    if config.expires_at > 0 {
        println!("Token expires at: {}", config.expires_at);
    }
    let t = &config.timeouts;
    println!("Timeouts (seconds):");
    println!(
        "  http_client={} proxy_context={} circuit_breaker={}",
        t.http_client, t.proxy_context, t.circuit_breaker
    );
    println!(
        "  server read={} write={} idle={}",
        t.server_read, t.server_write, t.server_idle
    );
    println!(
        "  dial={} tls_handshake={} keep_alive={} idle_connection={}",
        t.dial, t.tls_handshake, t.keep_alive, t.idle_connection
    );
    Ok(())
}

async fn handle_models() -> Result<()> {
    let config = Config::load()?;
    let client = Arc::new(HttpClient::new(&config.timeouts));
    let catalog = ModelCatalog::new(client);

    let list = catalog.get().await;
    println!("Available models ({} total):", list.data.len());
    for model in &list.data {
        println!("  - {} ({})", model.id, model.owned_by);
    }
    Ok(())
}

async fn handle_refresh() -> Result<()> {
    let (config, manager) = load_manager()?;
    if config.copilot_token.is_empty() {
        return Err(Error::Validation(
            "no token to refresh - run 'auth' first".to_string(),
        ));
    }

    println!("Forcing token refresh...");
    manager.refresh().await?;

    let status = manager.status().await;
    let minutes = status.seconds_remaining / 60;
    let seconds = status.seconds_remaining % 60;
    println!("Token refresh successful!");
    println!("New token expires in: {minutes}m {seconds}s");
    Ok(())
}
