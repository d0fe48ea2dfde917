mod caller;
mod manager;
mod operation;

pub use caller::CallerResolver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zbus::object_server::SignalContext;
use zbus::zvariant::OwnedObjectPath;
use zbus::{connection, Connection};

use crate::config::KapsuleConfig;
use crate::incus::IncusClient;
use crate::operation::{
    Engine, EventSink, OperationEvent, OperationPublisher, OperationState,
};
use crate::service::ContainerService;

use manager::ManagerIface;
use operation::OperationIface;

pub const BUS_NAME: &str = "org.frostyard.Kapsule";
pub const MANAGER_PATH: &str = "/org/frostyard/Kapsule";
pub const OPERATIONS_PREFIX: &str = "/org/frostyard/Kapsule/operations";

pub fn operation_path(id: u64) -> zbus::Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(format!("{OPERATIONS_PREFIX}/{id}")).map_err(Into::into)
}

/// Signal-emitting sink for one operation. Events go through a channel and
/// a dedicated drain task so emission keeps the per-operation total order
/// while the reporter stays non-blocking.
struct DbusSink {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl EventSink for DbusSink {
    fn emit(&self, event: OperationEvent) {
        let _ = self.tx.send(event);
    }
}

/// Exports Operation objects for the engine and streams their events as
/// D-Bus signals.
pub struct DbusPublisher {
    connection: Connection,
}

impl DbusPublisher {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl OperationPublisher for DbusPublisher {
    async fn publish(&self, state: Arc<OperationState>) -> anyhow::Result<Arc<dyn EventSink>> {
        let path = operation_path(state.id)?;
        self.connection
            .object_server()
            .at(path.as_str(), OperationIface::new(Arc::clone(&state)))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(emit_signals(self.connection.clone(), path, rx));
        Ok(Arc::new(DbusSink { tx }))
    }

    async fn unpublish(&self, id: u64) {
        let Ok(path) = operation_path(id) else {
            return;
        };
        match self
            .connection
            .object_server()
            .remove::<OperationIface, _>(path.as_str())
            .await
        {
            Ok(_) => debug!("unexported {}", path.as_str()),
            Err(e) => debug!("unexport of {} failed: {}", path.as_str(), e),
        }
    }
}

async fn emit_signals(
    connection: Connection,
    path: OwnedObjectPath,
    mut rx: mpsc::UnboundedReceiver<OperationEvent>,
) {
    let ctxt = match SignalContext::new(&connection, path.as_str()) {
        Ok(ctxt) => ctxt,
        Err(e) => {
            error!("no signal context for {}: {}", path.as_str(), e);
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        let result = match event {
            OperationEvent::Message { kind, text, indent } => {
                OperationIface::message(&ctxt, kind.code(), &text, indent).await
            }
            OperationEvent::ProgressStarted {
                id,
                description,
                total,
                indent,
            } => OperationIface::progress_started(&ctxt, &id, &description, total, indent).await,
            OperationEvent::ProgressUpdate { id, current, rate } => {
                OperationIface::progress_update(&ctxt, &id, current, rate).await
            }
            OperationEvent::ProgressCompleted {
                id,
                success,
                message,
            } => OperationIface::progress_completed(&ctxt, &id, success, &message).await,
            OperationEvent::Completed { success, error } => {
                OperationIface::completed(&ctxt, success, &error).await
            }
        };
        if let Err(e) = result {
            debug!("signal emission on {} failed: {}", path.as_str(), e);
        }
    }
}

/// Run the daemon: acquire the bus name, serve until SIGINT/SIGTERM, then
/// cancel live operations, release the name, and drop the backend client.
pub async fn run(session_bus: bool) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let config = KapsuleConfig::load();
    let incus = Arc::new(IncusClient::new());
    if !incus.is_available().await {
        warn!("Incus is not reachable; requests will fail until its socket is up");
    }
    let service = Arc::new(ContainerService::new(incus, config));

    let builder = if session_bus {
        connection::Builder::session()?
    } else {
        connection::Builder::system()?
    };
    let conn = builder.build().await?;

    let publisher = Arc::new(DbusPublisher::new(conn.clone()));
    let engine = Engine::new(Arc::clone(&service), publisher);
    let resolver = CallerResolver::new(conn.clone());
    let manager = ManagerIface::new(Arc::clone(&service), engine.clone(), resolver);

    // Export before requesting the name so the object exists the moment the
    // name becomes visible.
    conn.object_server().at(MANAGER_PATH, manager).await?;
    conn.request_name(BUS_NAME).await?;

    info!(
        "kapsule daemon v{} on the {} bus as {}",
        env!("CARGO_PKG_VERSION"),
        if session_bus { "session" } else { "system" },
        BUS_NAME
    );

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    info!("Shutting down");
    let cancelled = engine.cancel_all();
    if cancelled > 0 {
        info!("Cancelling {} live operation(s)", cancelled);
        if !engine.await_terminal(Duration::from_secs(3)).await {
            warn!("Some operations did not settle before shutdown");
        }
    }
    let _ = conn.release_name(BUS_NAME).await;

    Ok(())
}
