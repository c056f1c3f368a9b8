use std::sync::Arc;

use clap::Parser;
use pod_guard::config::{Cli, Commands};
use pod_guard::identity::IdentityTable;
use pod_guard::{Error, Result, agent, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(agent_args) => {
            setup_subscriber();

            let identities = IdentityTable::new();
            let ready = CancellationToken::new();
            let cancel = CancellationToken::new();
            let http_state = Arc::new(http::State::new(ready.clone(), identities.clone()));

            let mut http_handle = tokio::spawn(http::serve(
                agent_args.metrics_address,
                http_state,
                cancel.child_token(),
            ));
            let mut agent_handle = tokio::spawn(agent::start(
                agent_args,
                ready,
                identities,
                cancel.child_token(),
            ));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            let outcome = tokio::select! {
                h = &mut http_handle => {
                    cancel.cancel();
                    let agent = agent_handle.await;
                    exit("http", h).and(exit("agent", agent))
                },
                h = &mut agent_handle => {
                    cancel.cancel();
                    let http = http_handle.await;
                    exit("agent", h).and(exit("http", http))
                },
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (http, agent) = tokio::join!(http_handle, agent_handle);
                    exit("http", http).and(exit("agent", agent))
                },
            };
            info!("Exiting...");
            outcome
        }
    }
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pod_guard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e)
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(Error::Task(e.to_string()))
        }
    }
}
