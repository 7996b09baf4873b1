//! marketdesk - a command line front end for the marketplace API.
//!
//! Log in once; the session is persisted and its access token is refreshed
//! transparently on later runs.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketdesk_core::routes::{self, RouteDecision};
use marketdesk_core::{
    open_store, ApiClient, ApiError, Config, EmailConfirmation, LoginCredentials, ResourceKind,
    SessionManager,
};

/// Log file name prefix inside `log_dir`
const LOG_FILE_PREFIX: &str = "marketdesk.log";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API base URL (overrides the config file)
    #[arg(long, env = "MARKETDESK_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and remember the session
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(long, env = "MARKETDESK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Create an account
    Register {
        #[arg(short, long)]
        email: String,
        #[arg(long, env = "MARKETDESK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Finish registration with the second-step payload (JSON)
    CompleteRegistration {
        #[arg(long)]
        data: String,
    },
    /// Confirm an email address
    ConfirmEmail {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        code: String,
    },
    /// Refresh the access token now
    Refresh,
    /// Log out and forget the session
    Logout,
    /// Show the current session
    Status,
    /// Check whether a front end route would be shown or redirected
    Route { path: String },
    /// List a collection (listings, cards, products, product-details, media)
    List { resource: ResourceKind },
    /// Fetch one item
    Get { resource: ResourceKind, id: String },
    /// Create an item from a JSON payload
    Create {
        resource: ResourceKind,
        #[arg(long)]
        data: String,
    },
    /// Replace an item with a JSON payload
    Update {
        resource: ResourceKind,
        id: String,
        #[arg(long)]
        data: String,
    },
    /// Delete an item
    Delete { resource: ResourceKind, id: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
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

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).context("--data must be valid JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prefer the message the server gave over the generic error text.
fn explain(session: &SessionManager, error: ApiError) -> anyhow::Error {
    match session.last_error() {
        Some(message) => anyhow::Error::new(error).context(message),
        None => error.into(),
    }
}

/// Use the password given on the command line, or read one line from stdin.
fn read_password(given: Option<String>, prompt: &str) -> Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let mut config = Config::load()?;
    if let Some(url) = args.base_url {
        config.base_url = url;
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!(base_url = %config.base_url, "marketdesk starting");

    let store = open_store(&config)?;
    let client = ApiClient::from_config(&config, store)?;
    let session = client.session();

    match args.command {
        Command::Login { email, password } => {
            let password = read_password(password, "Password: ")?;
            let user = session
                .login(&LoginCredentials::new(email, password))
                .await
                .map_err(|e| explain(session, e))?;
            match user.id {
                Some(id) => eprintln!("Logged in as {} (user {})", user.email.unwrap_or_default(), id),
                None => eprintln!("Logged in as {}", user.email.unwrap_or_default()),
            }
        }
        Command::Register { email, password } => {
            let password = read_password(password, "Choose a password: ")?;
            let data = serde_json::json!({ "email": email, "password": password });
            let response = session
                .register(&data)
                .await
                .map_err(|e| explain(session, e))?;
            print_json(&response)?;
            eprintln!("Registered. Check your inbox for the confirmation link.");
        }
        Command::CompleteRegistration { data } => {
            let response = session
                .complete_registration(&parse_json(&data)?)
                .await
                .map_err(|e| explain(session, e))?;
            print_json(&response)?;
        }
        Command::ConfirmEmail { user_id, code } => {
            let response = session
                .confirm_email(&EmailConfirmation { user_id, code })
                .await
                .map_err(|e| explain(session, e))?;
            print_json(&response)?;
            eprintln!("Email confirmed.");
        }
        Command::Refresh => match session.refresh().await? {
            Some(_) => eprintln!("Access token refreshed."),
            None => eprintln!("No refresh token held; nothing to do."),
        },
        Command::Logout => {
            session.logout().await;
            eprintln!("Logged out.");
        }
        Command::Status => {
            print_json(&serde_json::to_value(session.snapshot())?)?;
        }
        Command::Route { path } => match routes::guard(&path, client.is_authenticated()) {
            RouteDecision::Allow => println!("allow"),
            RouteDecision::Redirect(target) => println!("redirect {}", target),
        },
        Command::List { resource } => {
            print_json(&client.resource(resource).list().await?)?;
        }
        Command::Get { resource, id } => {
            print_json(&client.resource(resource).get(&id).await?)?;
        }
        Command::Create { resource, data } => {
            print_json(&client.resource(resource).create(&parse_json(&data)?).await?)?;
        }
        Command::Update { resource, id, data } => {
            print_json(&client.resource(resource).update(&id, &parse_json(&data)?).await?)?;
        }
        Command::Delete { resource, id } => {
            print_json(&client.resource(resource).delete(&id).await?)?;
        }
    }

    info!("marketdesk finished");
    Ok(())
}
