use std::sync::Arc;

use steward_events::Bus;
use steward_kernel::Kernel;

use crate::approval::ApprovalService;
use crate::autopilot::IntentDispatcher;
use crate::governance::Governance;
use crate::handlers::TaskHandlers;
use crate::snapshot::SnapshotService;

/// Shared state handed to every loop and service. Cheap to clone.
#[derive(Clone)]
pub(crate) struct AppState {
    kernel: Kernel,
    bus: Bus,
    governance: Governance,
    approvals: Arc<ApprovalService>,
    snapshots: Arc<SnapshotService>,
    handlers: Arc<TaskHandlers>,
    dispatcher: Arc<IntentDispatcher>,
    worker_id: String,
}

impl AppState {
    pub fn new(
        kernel: Kernel,
        bus: Bus,
        handlers: TaskHandlers,
        dispatcher: IntentDispatcher,
        snapshots: SnapshotService,
    ) -> Self {
        let governance = Governance::new(kernel.clone(), bus.clone());
        let approvals = Arc::new(ApprovalService::new(kernel.clone(), bus.clone()));
        Self {
            kernel,
            bus,
            governance,
            approvals,
            snapshots: Arc::new(snapshots),
            handlers: Arc::new(handlers),
            dispatcher: Arc::new(dispatcher),
            worker_id: steward_core::identity::worker_id(),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn governance(&self) -> &Governance {
        &self.governance
    }

    pub fn approvals(&self) -> Arc<ApprovalService> {
        self.approvals.clone()
    }

    #[allow(dead_code)]
    pub fn snapshots(&self) -> Arc<SnapshotService> {
        self.snapshots.clone()
    }

    pub fn handlers(&self) -> Arc<TaskHandlers> {
        self.handlers.clone()
    }

    pub fn dispatcher(&self) -> Arc<IntentDispatcher> {
        self.dispatcher.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}
