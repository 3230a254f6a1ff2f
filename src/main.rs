use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use testsession::barrier::{DEFAULT_QUIET_MS, DEFAULT_TIMEOUT_MS};
use testsession::web::probe::probe_router;
use testsession::{DriverClient, ProcessEnvironment, SessionCoordinator, TestSessionConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "testsession")]
#[command(about = "Cross-process test sessions for browser-driven test suites")]
struct Cli {
    /// Driver API base URL
    #[arg(long, env = "TESTSESSION_URL", default_value = "http://127.0.0.1:8080", global = true)]
    url: String,

    /// Session id returned by `start`
    #[arg(long, env = "TESTSESSION_ID", global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the driver API and the probe routes
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
    },
    /// Start a session; parameters are `key=value` pairs
    Start {
        #[arg(long)]
        global: bool,
        params: Vec<String>,
    },
    /// Update the running session
    Update { params: Vec<String> },
    End,
    State,
    /// Block until the server has no request of this session in flight
    Wait {
        #[arg(long, default_value_t = DEFAULT_QUIET_MS)]
        quiet_ms: u64,
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
        timeout_ms: u64,
    },
    /// List leftover temp databases, dropping them with `--force`
    PurgeDatabases {
        #[arg(long)]
        force: bool,
    },
    /// List the configured database templates
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let client = match &cli.session {
        Some(id) => DriverClient::new(&cli.url).with_session(id.clone()),
        None => DriverClient::new(&cli.url),
    };

    match cli.command {
        Command::Serve { listen } => serve(listen).await,
        Command::Start { global, params } => {
            let mut params = parse_params(&params)?;
            if global {
                params.insert("globalTestSession".to_string(), Value::Bool(true));
            }
            let mut client = client;
            let state = client.start(Value::Object(params)).await?;
            if let Some(id) = client.session_id() {
                println!("session: {}", id);
            }
            print_json(&state)
        }
        Command::Update { params } => {
            let state = client.update(Value::Object(parse_params(&params)?)).await?;
            print_json(&state)
        }
        Command::End => {
            let mut client = client;
            client.end().await?;
            println!("session ended");
            Ok(())
        }
        Command::State => print_json(&client.state().await?),
        Command::Wait {
            quiet_ms,
            timeout_ms,
        } => {
            if client.wait_for_idle(quiet_ms, timeout_ms).await? {
                println!("idle");
                Ok(())
            } else {
                Err(anyhow!("requests still pending after {} ms", timeout_ms))
            }
        }
        Command::PurgeDatabases { force } => purge_databases(force),
        Command::Templates => {
            let coordinator = local_coordinator()?;
            for template in coordinator.database_templates()? {
                println!("{}\t{}", template.filename, template.path.display());
            }
            Ok(())
        }
    }
}

async fn serve(listen: SocketAddr) -> Result<()> {
    let coordinator = local_coordinator()?;
    if let Some(state) = coordinator.load_from_file()? {
        info!(database = state.database().unwrap_or_default(), "resumed global test session");
    }

    let environment = Arc::new(ProcessEnvironment::new(coordinator.config().environment));
    let app = testsession::web::app(coordinator, environment.clone(), probe_router(environment));

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!(%listen, "testsession driver API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn purge_databases(force: bool) -> Result<()> {
    let coordinator = local_coordinator()?;
    let found = coordinator.database().purge_temp_databases(!force)?;
    for name in &found {
        println!("{}{}", name, if force { " ... deleted" } else { "" });
    }
    if force {
        println!("deleted {} temporary database(s)", found.len());
    } else {
        println!("dry run, {} temporary database(s) found; pass --force to delete", found.len());
    }
    Ok(())
}

fn local_coordinator() -> Result<SessionCoordinator> {
    SessionCoordinator::new(TestSessionConfig::from_env()).context("invalid test session configuration")
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_params(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
