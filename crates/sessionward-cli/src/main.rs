//! Sessionward CLI - log in to a token-based API and use the persisted session.
//!
//! Commands:
//!   sessionward login [email]   prompt for credentials and store the session
//!   sessionward logout          end the session on the server and locally
//!   sessionward status          show the stored session
//!   sessionward get <path>      authenticated GET, prints the response body

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionward_core::login::user_message;
use sessionward_core::{
    AuthClient, Config, LoginAction, SessionEvent, SubmitOutcome, UserDataValidator,
};

/// Directory for daily log files; stderr only when unset
const ENV_LOG_DIR: &str = "SESSIONWARD_LOG_DIR";

const USAGE: &str = "Usage: sessionward <login [email] | logout | status | get <path>>";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(ENV_LOG_DIR).map(PathBuf::from) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sessionward.log");
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
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let config = Config::load()?;
    let client = AuthClient::from_config(&config)?;
    watch_for_forced_logout(&client);

    match (command.as_str(), args.get(1)) {
        ("login", email) => login(&client, email.cloned()).await,
        ("logout", None) => logout(&client).await,
        ("status", None) => status(&client),
        ("get", Some(path)) => get(&client, path).await,
        _ => bail!(USAGE),
    }
}

/// Print a notice when a refresh is rejected and the session is dropped.
fn watch_for_forced_logout(client: &AuthClient) {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Expired) => {
                    eprintln!("Session expired. Run `sessionward login` to sign in again.");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn login(client: &AuthClient, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_email()?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let controller = client.login_controller(UserDataValidator::default());
    controller.edit_email(|buf| *buf = email);
    controller.edit_password(|buf| *buf = password);

    let state = controller.state();
    if !state.is_email_valid {
        bail!("Invalid email address");
    }
    if !state.password_requirements.is_valid() {
        let rules = state.password_requirements;
        let mut missing = Vec::new();
        if !rules.has_min_length {
            missing.push("at least 9 characters");
        }
        if !rules.has_number {
            missing.push("a number");
        }
        if !rules.has_lower_case {
            missing.push("a lowercase letter");
        }
        if !rules.has_upper_case {
            missing.push("an uppercase letter");
        }
        bail!("Password must contain {}", missing.join(", "));
    }

    match controller.on_action(LoginAction::Submit).await {
        SubmitOutcome::LoggedIn(session) => {
            info!(user_id = %session.user_id(), "Logged in");
            println!("Logged in as {}", session.user_id());
            Ok(())
        }
        SubmitOutcome::Failed(e) => bail!(user_message(&e)),
        SubmitOutcome::Ignored => bail!("Login was not submitted"),
    }
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}

async fn logout(client: &AuthClient) -> Result<()> {
    if client.session().is_none() {
        println!("Not logged in");
        return Ok(());
    }
    client.logout().await?;
    println!("Logged out");
    Ok(())
}

fn status(client: &AuthClient) -> Result<()> {
    match client.store().snapshot() {
        Some(persisted) => println!(
            "Logged in as {} (saved {})",
            persisted.session.user_id(),
            persisted.age_display()
        ),
        None => println!("Not logged in"),
    }
    Ok(())
}

async fn get(client: &AuthClient, path: &str) -> Result<()> {
    let response = client.get(path).await?;
    let body = match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => response.text(),
    };
    println!("{}", body);

    if !response.is_success() {
        warn!(status = response.status.as_u16(), path, "Request failed");
        bail!("Request failed with status {}", response.status);
    }
    Ok(())
}
