//! toji-session - terminal front-end for bot-issued toji sessions.
//!
//! Takes the link the bot hands out (or a bare token, or whatever was saved
//! last time), validates it, and shows the remaining session time until it
//! runs out.

mod notifier;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Url;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toji_core::auth::{decode, take_session_param};
use toji_core::utils::format_remaining;
use toji_core::{ApiClient, Config, SessionGuard, SessionState, TokenStore};

use notifier::ConsoleNotifier;

/// Prefix for daily log files when `log_dir` is configured
const LOG_FILE_PREFIX: &str = "toji-session.log";

const USAGE: &str = "\
Usage: toji-session [OPTIONS] [LINK_OR_TOKEN]

Validates a session and shows the time remaining until it expires.
Without an argument the last saved session is used.

Options:
  --inspect [TOKEN]  Decode a token (or the saved one) and print its claims
  --logout           Forget the saved session
  -h, --help         Show this help

Environment:
  TOJI_API_URL       Backend base URL (default http://localhost:8000)
  RUST_LOG           Log filter (default warn)";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Watch(Option<String>),
    Inspect(Option<String>),
    Logout,
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args.first().map(String::as_str) {
            None => Ok(Command::Watch(None)),
            Some("-h") | Some("--help") => Ok(Command::Help),
            Some("--logout") => Ok(Command::Logout),
            Some("--inspect") => Ok(Command::Inspect(args.get(1).cloned())),
            Some(flag) if flag.starts_with("--") => {
                Err(anyhow::anyhow!("Unknown option: {}\n\n{}", flag, USAGE))
            }
            Some(arg) => Ok(Command::Watch(Some(arg.to_string()))),
        }
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so file logs are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!(api_url = %config.api_url, store = ?config.store, "toji-session starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match Command::parse(&args)? {
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
        Command::Logout => logout(&config),
        Command::Inspect(token) => inspect(&config, token),
        Command::Watch(arg) => watch(&config, arg).await,
    }
}

fn build_guard(config: &Config) -> Result<SessionGuard> {
    let client = ApiClient::new(&config.api_url).context("Invalid API URL")?;
    debug!(api_base = %client.base_url(), "Using session backend");
    let store = config.token_store().context("Failed to open session store")?;
    Ok(SessionGuard::new(
        Arc::new(client),
        store,
        Arc::new(ConsoleNotifier),
        config.guard_options(),
    ))
}

/// Split a command-line argument into a token, accepting either a bot link
/// carrying `?session=` or the bare token.
fn token_from_arg(arg: String) -> Option<String> {
    match Url::parse(&arg) {
        Ok(url) if url.has_host() => {
            let (token, cleaned) = take_session_param(&url);
            if token.is_none() {
                warn!(url = %cleaned, "Link has no session parameter");
            }
            token
        }
        _ => Some(arg),
    }
}

async fn watch(config: &Config, arg: Option<String>) -> Result<()> {
    let guard = build_guard(config)?;

    if !guard.acquire(arg.and_then(token_from_arg)) {
        eprintln!("No session found. Create a new session from the bot and open its link.");
        return Ok(());
    }

    eprintln!("Validating session...");
    if let Err(e) = guard.check().await {
        // Expiry and rejection were already announced by the notifier
        if !e.is_terminal() {
            eprintln!("Session not validated: {}", e);
        }
        return Ok(());
    }

    run_countdown(&guard).await
}

/// Redraw the remaining time until the session ends or Ctrl+C.
/// Interrupting leaves the saved session in place.
async fn run_countdown(guard: &SessionGuard) -> Result<()> {
    let mut rx = guard.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        {
            let state = rx.borrow_and_update();
            if !state.is_valid() {
                break;
            }
            render(&state)?;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                eprintln!();
                info!("Interrupted, keeping saved session");
                return Ok(());
            }
        }
    }

    info!("Session ended");
    Ok(())
}

fn render(state: &SessionState) -> Result<()> {
    let who = match &state.user {
        Some(user) if !user.username.is_empty() => format!("@{}", user.username),
        Some(user) => format!("user {}", user.user_id),
        None => "session".to_string(),
    };
    let mut stderr = io::stderr();
    write!(
        stderr,
        "\r{} - {} remaining   ",
        who,
        format_remaining(state.remaining_secs)
    )?;
    stderr.flush()?;
    Ok(())
}

fn inspect(config: &Config, token: Option<String>) -> Result<()> {
    let token = match token.and_then(token_from_arg) {
        Some(token) => token,
        None => config
            .token_store()?
            .load()
            .context("Failed to read saved session")?
            .ok_or_else(|| anyhow::anyhow!("No saved session to inspect"))?,
    };

    let payload = decode(&token).context("Token cannot be decoded locally")?;
    println!("{}", serde_json::to_string_pretty(&payload)?);

    match payload.expiry() {
        Some(expiry) => {
            let remaining = (expiry - Utc::now()).num_seconds();
            if remaining > 0 {
                eprintln!("Expires {} ({} remaining)", expiry, format_remaining(remaining as u64));
            } else {
                eprintln!("Expired {}", expiry);
            }
        }
        None => eprintln!("No usable expires_at; only the backend can validate this token"),
    }
    Ok(())
}

fn logout(config: &Config) -> Result<()> {
    build_guard(config)?.logout();
    Ok(())
}
