use std::collections::HashMap;
use std::sync::Arc;

use zbus::fdo;
use zbus::interface;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::zvariant::OwnedObjectPath;

use crate::operation::{Engine, Work};
use crate::service::{ContainerRow, ContainerService};

use super::caller::CallerResolver;
use super::operation_path;

/// The org.frostyard.Kapsule.Manager object at /org/frostyard/Kapsule.
///
/// Lifecycle methods wrap their work in a new Operation and return its
/// object path immediately; queries and PrepareEnter answer synchronously.
pub struct ManagerIface {
    service: Arc<ContainerService>,
    engine: Engine,
    resolver: CallerResolver,
}

impl ManagerIface {
    pub fn new(service: Arc<ContainerService>, engine: Engine, resolver: CallerResolver) -> Self {
        Self {
            service,
            engine,
            resolver,
        }
    }

    async fn submit(&self, work: Work) -> fdo::Result<OwnedObjectPath> {
        let id = self.engine.submit(work).await?;
        operation_path(id).map_err(|e| fdo::Error::Failed(e.to_string()))
    }
}

#[interface(name = "org.frostyard.Kapsule.Manager")]
impl ManagerIface {
    #[zbus(property)]
    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    async fn create_container(
        &self,
        name: String,
        image: String,
        session_mode: bool,
        dbus_mux: bool,
    ) -> fdo::Result<OwnedObjectPath> {
        self.submit(Work::Create {
            name,
            image,
            session_mode,
            dbus_mux,
        })
        .await
    }

    async fn delete_container(&self, name: String, force: bool) -> fdo::Result<OwnedObjectPath> {
        self.submit(Work::Delete { name, force }).await
    }

    async fn start_container(&self, name: String) -> fdo::Result<OwnedObjectPath> {
        self.submit(Work::Start { name }).await
    }

    async fn stop_container(&self, name: String, force: bool) -> fdo::Result<OwnedObjectPath> {
        self.submit(Work::Stop { name, force }).await
    }

    /// Resolve the caller, materialize their environment in the container,
    /// and hand back the exec vector. Step failures come back in the triple
    /// so the client can print the reason; only an unidentifiable caller is
    /// a method error.
    async fn prepare_enter(
        &self,
        #[zbus(header)] header: Header<'_>,
        container: String,
        command: Vec<String>,
    ) -> fdo::Result<(bool, String, Vec<String>)> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed("message carries no sender".to_string()))?;
        let caller = self
            .resolver
            .resolve(BusName::Unique(sender.to_owned()))
            .await?;

        match self
            .service
            .prepare_enter(&caller, &container, &command)
            .await
        {
            Ok(exec_args) => Ok((true, String::new(), exec_args)),
            Err(e) => Ok((false, e.to_string(), Vec::new())),
        }
    }

    async fn list_containers(&self) -> fdo::Result<Vec<ContainerRow>> {
        Ok(self.service.list_containers().await?)
    }

    async fn get_container_info(&self, name: String) -> fdo::Result<ContainerRow> {
        Ok(self.service.get_container_info(&name).await?)
    }

    async fn get_config(&self) -> HashMap<String, String> {
        self.service.config().as_map()
    }
}
