//! tokenline - keep a session with a token-authenticated service alive.
//!
//! Commands:
//!   login [username]                sign in and persist the session
//!   register <username> <email>     create an account and sign in
//!   logout                          forget the stored session
//!   whoami                          show the signed-in user
//!   get <path>                      authenticated GET, prints the JSON body
//!   watch                           keep the session renewed until Ctrl-C

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenline_core::{ApiRequest, Config, LogoutReason, SessionController, SessionEvent};

// ============================================================================
// Constants
// ============================================================================

const ENV_BASE_URL: &str = "TOKENLINE_BASE_URL";
const ENV_USERNAME: &str = "TOKENLINE_USERNAME";
const ENV_PASSWORD: &str = "TOKENLINE_PASSWORD";

/// Log file name inside the cache directory (rotated daily)
const LOG_FILE: &str = "tokenline.log";

const USAGE: &str = "usage: tokenline <login [username] | register <username> <email> | logout | whoami | get <path> | watch>";

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets whatever `RUST_LOG` asks for (default `warn`); the file in
/// the cache directory gets the same events without ANSI colors. The
/// returned guard flushes the file writer and must outlive `main`.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(base_url) = std::env::var(ENV_BASE_URL) {
        config.base_url = base_url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = load_config()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let controller = SessionController::from_config(&config)?;
    info!(base_url = %config.base_url, command = %command, "tokenline starting");

    match command.as_str() {
        "login" => login(&controller, &mut config, args.get(1).cloned()).await,
        "register" => match (args.get(1), args.get(2)) {
            (Some(username), Some(email)) => register(&controller, &mut config, username, email).await,
            _ => bail!(USAGE),
        },
        "logout" => {
            controller.logout();
            println!("Logged out");
            Ok(())
        }
        "whoami" => whoami(&controller).await,
        "get" => match args.get(1) {
            Some(path) => get(&controller, path).await,
            None => bail!(USAGE),
        },
        "watch" => watch(&controller).await,
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn login(controller: &SessionController, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username
        .or_else(|| std::env::var(ENV_USERNAME).ok())
        .or_else(|| config.last_username.clone())
    {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    let password = password()?;

    controller
        .login(&username, &password)
        .await
        .context("Login failed")?;

    remember_username(config, &username);
    println!("Logged in as {}", username);
    Ok(())
}

async fn register(controller: &SessionController, config: &mut Config, username: &str, email: &str) -> Result<()> {
    let password = password()?;

    controller
        .register(username, email, &password)
        .await
        .context("Registration failed")?;

    remember_username(config, username);
    println!("Registered and logged in as {}", username);
    Ok(())
}

async fn whoami(controller: &SessionController) -> Result<()> {
    if !controller.is_authenticated() {
        println!("Not logged in");
        return Ok(());
    }

    let profile = controller.fetch_profile().await.context("Failed to fetch profile")?;
    println!("{} <{}>", profile.username, profile.email);
    if let Some(expires_at) = controller.session().expires_at {
        println!("access token expires {}", expires_at);
    }
    Ok(())
}

async fn get(controller: &SessionController, path: &str) -> Result<()> {
    let response = controller.execute(ApiRequest::get(path)).await?;
    let body: serde_json::Value = response.json()?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Stay up, letting the scheduler renew the session, until Ctrl-C or until
/// the session ends.
async fn watch(controller: &Arc<SessionController>) -> Result<()> {
    if !controller.is_authenticated() {
        bail!("Not logged in - run `tokenline login` first");
    }

    let mut events = controller.subscribe();
    println!("Keeping session for {} alive, Ctrl-C to stop", controller.current_principal().unwrap_or_default());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Renewed) => {
                    let expires = controller
                        .session()
                        .expires_at
                        .map(|at| at.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("Session renewed, expires {}", expires);
                }
                Ok(SessionEvent::LoggedIn { principal }) => println!("Logged in as {}", principal),
                Ok(SessionEvent::LoggedOut { reason }) => {
                    match reason {
                        LogoutReason::RenewalFailed => println!("Session expired - run `tokenline login` again"),
                        LogoutReason::UserRequested => println!("Logged out"),
                    }
                    return Ok(());
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("No input given");
    }
    Ok(line)
}

fn password() -> Result<String> {
    match std::env::var(ENV_PASSWORD) {
        Ok(password) => Ok(password),
        Err(_) => rpassword::prompt_password("Password: ").context("Failed to read password"),
    }
}

fn remember_username(config: &mut Config, username: &str) {
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}
