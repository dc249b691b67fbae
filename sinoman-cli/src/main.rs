//! Developer CLI for `sinoman-core`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use sinoman_core::{
    is_reachable, probe_address, NetworkMonitor, TcpProbeConnectivity, ENV_SIGNING_KEY,
};

mod context;
mod queue;
mod tools;

use context::Context;
use queue::QueueCommand;

/// Sinoman developer tools.
#[derive(Parser, Debug)]
#[command(name = "sinoman", version, about)]
struct Cli {
    /// Directory holding the session and the offline queue.
    #[arg(long, global = true, env = "SINOMAN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print machine readable JSON where supported.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the signature header value for a request.
    Sign {
        /// HTTP method.
        #[arg(long, default_value = "GET")]
        method: String,
        /// Full request URL, including the query string.
        #[arg(long)]
        url: String,
        /// Request body.
        #[arg(long)]
        body: Option<String>,
        /// Shared signing key.
        #[arg(long, env = ENV_SIGNING_KEY, hide_env_values = true)]
        key: String,
    },
    /// Print the `sha256/...` pin of a DER or PEM certificate.
    Fingerprint {
        /// Certificate file.
        path: PathBuf,
    },
    /// Sign in and store the session.
    Login {
        /// Account email.
        #[arg(long)]
        email: String,
        /// Account password.
        #[arg(long, env = "SINOMAN_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Manage the offline payment queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Check once whether the backend is reachable.
    Status {
        /// Probe timeout in seconds.
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },
    /// Watch connectivity and sync the offline queue on reconnect, until Ctrl-C.
    Watch {
        /// Seconds between probes.
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
        /// Probe timeout in seconds.
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,sinoman=info,sinoman_core=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Sign {
            method,
            url,
            body,
            key,
        } => {
            let signature = tools::sign(&key, &method, &url, body.as_deref())?;
            tools::print_signature(&signature, cli.json);
        }
        Command::Fingerprint { path } => println!("{}", tools::fingerprint(&path)?),
        Command::Login { email, password } => {
            let context = Context::open(cli.data_dir, cli.json)?;
            let session = context
                .client()?
                .sign_in_with_password(&email, &password)
                .await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "user": session.user, "expires_at": session.expires_at })
                );
            } else {
                println!(
                    "signed in as {} (session stored in {})",
                    session.user.email.as_deref().unwrap_or(&session.user.id),
                    context.data_dir().display()
                );
            }
        }
        Command::Logout => {
            let context = Context::open(cli.data_dir, cli.json)?;
            context.client()?.sign_out().await?;
            println!("signed out");
        }
        Command::Queue(command) => {
            let context = Context::open(cli.data_dir, cli.json)?;
            queue::run(&context, command).await?;
        }
        Command::Status { timeout_secs } => {
            let context = Context::open(cli.data_dir, cli.json)?;
            status(&context, Duration::from_secs(timeout_secs)).await?;
        }
        Command::Watch {
            interval_secs,
            timeout_secs,
        } => {
            let context = Context::open(cli.data_dir, cli.json)?;
            watch(
                &context,
                Duration::from_secs(interval_secs),
                Duration::from_secs(timeout_secs),
            )
            .await?;
        }
    }

    Ok(())
}

async fn status(context: &Context, timeout: Duration) -> eyre::Result<()> {
    let config = Context::config()?;
    let address = probe_address(config.backend_url())?;
    let reachable = is_reachable(&address, timeout).await;
    let queued = context.queue()?.queued_transactions_count();

    if context.json {
        println!(
            "{}",
            serde_json::json!({ "backend": address, "reachable": reachable, "queued": queued })
        );
    } else {
        let state = if reachable { "connected" } else { "offline" };
        println!("{address}: {state}, {queued} queued payment(s)");
    }
    Ok(())
}

async fn watch(context: &Context, interval: Duration, timeout: Duration) -> eyre::Result<()> {
    let config = Context::config()?;
    let queue = context.queue()?;
    let provider = Arc::new(TcpProbeConnectivity::for_url(
        config.backend_url(),
        interval,
        timeout,
    )?);
    tracing::info!(
        address = provider.address(),
        queued = queue.queued_transactions_count(),
        "watching connectivity"
    );

    let monitor = NetworkMonitor::start(provider, queue);
    let mut status = monitor.subscribe();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("{current}");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.wrap_err("failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    monitor.stop();
    Ok(())
}
