use std::sync::Arc;

use tracing::{debug, info};
use zbus::interface;
use zbus::object_server::SignalContext;

use crate::operation::OperationState;

/// The per-operation D-Bus object, exported at
/// `/org/frostyard/Kapsule/operations/{id}` for the life of the operation
/// plus a short linger.
pub struct OperationIface {
    state: Arc<OperationState>,
}

impl OperationIface {
    pub fn new(state: Arc<OperationState>) -> Self {
        Self { state }
    }
}

#[interface(name = "org.frostyard.Kapsule.Operation")]
impl OperationIface {
    #[zbus(property)]
    fn id(&self) -> String {
        self.state.id.to_string()
    }

    #[zbus(property, name = "Type")]
    fn operation_type(&self) -> String {
        self.state.kind.to_string()
    }

    #[zbus(property)]
    fn target(&self) -> String {
        self.state.target.clone()
    }

    #[zbus(property)]
    fn status(&self) -> String {
        self.state.status().as_str().to_string()
    }

    /// Request cancellation. The work item observes the armed token at its
    /// next suspension point; after a terminal state this does nothing.
    fn cancel(&self) {
        if self.state.request_cancel() {
            info!(operation = self.state.id, "cancellation requested");
        } else {
            debug!(
                operation = self.state.id,
                "cancel ignored, operation already finished"
            );
        }
    }

    #[zbus(signal)]
    pub async fn message(
        ctxt: &SignalContext<'_>,
        message_type: i32,
        message: &str,
        indent: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_started(
        ctxt: &SignalContext<'_>,
        id: &str,
        description: &str,
        total: u64,
        indent: i32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_update(
        ctxt: &SignalContext<'_>,
        id: &str,
        current: u64,
        rate: f64,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn progress_completed(
        ctxt: &SignalContext<'_>,
        id: &str,
        success: bool,
        message: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn completed(
        ctxt: &SignalContext<'_>,
        success: bool,
        error: &str,
    ) -> zbus::Result<()>;
}
