//! Switchboard server binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`SWITCHBOARD_CONFIG`, default `switchboard.yaml`)
//! 2. Initialize JSON logging through the fan-out, standard error attached
//! 3. Open the persisted document (fatal if it cannot be loaded) and trim
//!    its sightings to the configured capacity
//! 4. Bind the operator listener and start the supervisor
//! 5. Run until Ctrl-C or a fatal listener error; reload state on SIGHUP
//! 6. Say goodbye to every operator, wait for them, flush the document

use std::sync::Arc;

use anyhow::Context as _;
use switchboard_fanout::Fanout;
use switchboard_server::supervisor::{DEFAULT_GOODBYE, fatal_goodbye};
use switchboard_server::{ServerConfig, ServerError, Supervisor, implant, logging};
use switchboard_store::{ErrorCallback, Manager, StoreError};
use switchboard_types::Document;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Application entry point.
///
/// # Errors
///
/// Returns an error if startup fails or the final state flush fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = ServerConfig::path_from_env();
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let fanout = Fanout::new();
    logging::add_stderr(&fanout);
    logging::init(fanout.clone(), &config.logging.level).context("installing logger")?;

    info!(
        config = %config_path.display(),
        listen = %config.listen,
        state = %config.state.path,
        write_delay_ms = config.state.write_delay_ms,
        "switchboard starting"
    );

    let on_error: ErrorCallback = Arc::new(|e: &StoreError| error!(error = %e, "state persistence failed"));
    let store: Arc<Manager<Document>> = Manager::open(config.state.store_options(), Some(on_error))
        .await
        .context("opening state")?;
    implant::trim_sightings(&store, config.state.last_seen_capacity)
        .await
        .context("trimming sightings")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        })?;

    let supervisor = Supervisor::new(Arc::clone(&store), fanout, config.operators.clone());
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<ServerError>(1);
    let server = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            if let Err(e) = supervisor.serve(listener).await {
                let _ = fatal_tx.send(e).await;
            }
        }
    });

    let message = wait_for_shutdown(&store, &mut fatal_rx).await;
    supervisor.shutdown(Some(&message)).await;
    if let Err(e) = server.await {
        warn!(error = %e, "accept loop task failed");
    }

    store
        .write()
        .await
        .release_and_write_now()
        .await
        .context("flushing state")?;
    info!("switchboard stopped");
    Ok(())
}

/// Block until the server should stop, reloading state on every SIGHUP.
///
/// Returns the goodbye message for operators.
async fn wait_for_shutdown(
    store: &Manager<Document>,
    fatal: &mut mpsc::Receiver<ServerError>,
) -> String {
    let mut hangups = hangup::listen();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "cannot listen for Ctrl-C");
                }
                return DEFAULT_GOODBYE.to_owned();
            }
            Some(e) = fatal.recv() => {
                error!(error = %e, "fatal server error");
                return fatal_goodbye(&e);
            }
            () = hangup::next(&mut hangups) => {
                match store.reload().await {
                    Ok(()) => info!("State reloaded"),
                    Err(e) => warn!(error = %e, "state reload failed"),
                }
            }
        }
    }
}

#[cfg(unix)]
mod hangup {
    use tokio::signal::unix::{Signal, SignalKind, signal};
    use tracing::warn;

    pub fn listen() -> Option<Signal> {
        match signal(SignalKind::hangup()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
                None
            }
        }
    }

    pub async fn next(signal: &mut Option<Signal>) {
        if let Some(s) = signal {
            if s.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
mod hangup {
    pub const fn listen() -> Option<()> {
        None
    }

    pub async fn next(_: &mut Option<()>) {
        std::future::pending::<()>().await;
    }
}
