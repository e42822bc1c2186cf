//! Master Action Coordinator - single-flight workflow orchestration
//!
//! At most one master action runs process-wide. Initiation takes the
//! single-flight permit without waiting, journals the new run and spawns its
//! background execution; status and cancellation queries read the live run
//! or fall back to the action journal's archive.

use crate::config::CoordinatorConfig;
use crate::context::WorkflowContext;
use crate::error::{ControlError, Result};
use crate::handler::Handler;
use crate::logging::RunLogger;
use crate::registry::HandlerRegistry;
use fleet_journal::Journal;
use fleet_types::{
    CancelOutcome, CancelResponse, InitiateRequest, MasterAction, MasterActionId, MasterActionStatus,
    MasterActionView,
};
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

/// Finished runs kept in memory when their terminal record could not be journaled
const UNJOURNALED_CAPACITY: usize = 16;

/// The one run currently in progress
struct LiveRun {
    id: MasterActionId,
    action: Arc<Mutex<MasterAction>>,
    cancellation: CancellationToken,
    logger: Arc<RunLogger>,
    supports_cancellation: bool,
}

struct Inner {
    registry: HandlerRegistry,
    journal: Journal,
    config: CoordinatorConfig,
    single_flight: Arc<Semaphore>,
    live: parking_lot::Mutex<Option<LiveRun>>,
    /// Terminal runs whose archive still holds a stale snapshot, newest last
    unjournaled: parking_lot::Mutex<VecDeque<MasterAction>>,
    /// Run between initiation and the end of its finalization
    in_flight: watch::Sender<Option<MasterActionId>>,
}

/// Orchestrates master actions. Cheap to clone; clones share one live slot.
#[derive(Clone)]
pub struct MasterActionCoordinator {
    inner: Arc<Inner>,
}

impl MasterActionCoordinator {
    pub fn new(registry: HandlerRegistry, journal: Journal, config: CoordinatorConfig) -> Self {
        let (in_flight, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                registry,
                journal,
                config,
                single_flight: Arc::new(Semaphore::new(1)),
                live: parking_lot::Mutex::new(None),
                unjournaled: parking_lot::Mutex::new(VecDeque::new()),
                in_flight,
            }),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Id of the live run, if any
    pub fn current(&self) -> Option<MasterActionId> {
        self.inner.live.lock().as_ref().map(|run| run.id.clone())
    }

    /// Start a master action.
    ///
    /// Fails immediately with `ConcurrencyConflict` while another run holds
    /// the single-flight permit. Returns once the run is journaled; execution
    /// continues in the background.
    #[instrument(skip(self, request, user), fields(operation = %request.operation_type, user = %user))]
    pub async fn initiate(&self, request: InitiateRequest, user: &str) -> Result<MasterAction> {
        // 1. Single-flight, no queuing
        let permit = Arc::clone(&self.inner.single_flight)
            .try_acquire_owned()
            .map_err(|_| ControlError::ConcurrencyConflict {
                running: self.current(),
            })?;

        // 2. Build the aggregate
        let mut action = MasterAction::new(
            MasterActionId::generate(),
            request.operation_type,
            request.description,
            user,
            request.parameters,
        );

        // 3. Durable before returning; the permit drops with us on failure
        self.inner.journal.actions().record_initiated(&action).await?;
        action.transition_to(MasterActionStatus::Running)?;

        // 4. Publish the live run
        let cancellation = CancellationToken::new();
        let logger = Arc::new(RunLogger::new(
            action.id.clone(),
            self.inner.journal.clone(),
            &self.inner.config,
        ));
        let shared = Arc::new(Mutex::new(action.clone()));
        // An unknown operation type fails in the background run
        let handler = self.inner.registry.create(&action.operation_type);
        let supports_cancellation = handler
            .as_ref()
            .map(|h| h.supports_cancellation())
            .unwrap_or(false);

        *self.inner.live.lock() = Some(LiveRun {
            id: action.id.clone(),
            action: Arc::clone(&shared),
            cancellation: cancellation.clone(),
            logger: Arc::clone(&logger),
            supports_cancellation,
        });
        self.inner.in_flight.send_replace(Some(action.id.clone()));

        // 5. Spawn the background run
        let ctx = WorkflowContext::new(
            shared,
            &action,
            cancellation,
            self.inner.journal.clone(),
            logger,
        );
        let span = info_span!(
            "master_action",
            master_action_id = %action.id,
            operation = %action.operation_type
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(ctx, handler, permit).await }.instrument(span));

        info!(master_action_id = %action.id, "Master action initiated");
        Ok(action)
    }

    /// Status of a live or archived run; `None` when the id is unknown
    pub async fn status(&self, id: &MasterActionId) -> Result<Option<MasterActionView>> {
        let live = self.live_handles(id);
        if let Some((action, logger)) = live {
            // One lock for history and current node actions together
            let view = {
                let action = action.lock().await;
                MasterActionView::from_snapshot(&action, true, logger.recent_lines())
            };
            return Ok(Some(view));
        }

        let journal = self.inner.journal.actions();
        if let Some(finished) = self.inner.unjournaled(id) {
            let recent = journal
                .tail_master_log(id, self.inner.config.recent_log_lines)
                .await
                .unwrap_or_else(|e| {
                    warn!(master_action_id = %id, error = %e, "Failed to read run log");
                    Vec::new()
                });
            return Ok(Some(MasterActionView::from_snapshot(&finished, false, recent)));
        }

        match journal.get_archived_master_action(id).await? {
            Some(archived) => {
                let recent = journal
                    .tail_master_log(id, self.inner.config.recent_log_lines)
                    .await?;
                Ok(Some(MasterActionView::from_snapshot(&archived, false, recent)))
            }
            None => Ok(None),
        }
    }

    /// Ask a run to stop
    #[instrument(skip(self), fields(master_action_id = %id))]
    pub async fn request_cancellation(&self, id: &MasterActionId, requested_by: &str) -> Result<CancelResponse> {
        let live = {
            let slot = self.inner.live.lock();
            slot.as_ref().filter(|run| &run.id == id).map(|run| {
                (
                    Arc::clone(&run.action),
                    run.cancellation.clone(),
                    Arc::clone(&run.logger),
                    run.supports_cancellation,
                )
            })
        };

        let Some((action, cancellation, logger, supports_cancellation)) = live else {
            if let Some(finished) = self.inner.unjournaled(id) {
                return Ok(CancelResponse::new(
                    id.clone(),
                    CancelOutcome::AlreadyCompleted,
                    format!("Master action already {}", finished.overall_status),
                ));
            }
            return match self.inner.journal.actions().get_archived_master_action(id).await? {
                Some(_) => Ok(CancelResponse::new(
                    id.clone(),
                    CancelOutcome::AlreadyCompleted,
                    "Master action already completed",
                )),
                None => Ok(CancelResponse::new(
                    id.clone(),
                    CancelOutcome::NotFound,
                    "Master action not found",
                )),
            };
        };

        let mut action = action.lock().await;
        if action.is_complete() {
            return Ok(CancelResponse::new(
                id.clone(),
                CancelOutcome::AlreadyCompleted,
                format!("Master action already {}", action.overall_status),
            ));
        }
        if !supports_cancellation {
            return Ok(CancelResponse::new(
                id.clone(),
                CancelOutcome::CancellationNotSupported,
                format!("Operation {} cannot be cancelled", action.operation_type),
            ));
        }
        if let Some(ref by) = action.cancellation_requested_by {
            return Ok(CancelResponse::new(
                id.clone(),
                CancelOutcome::CancellationPending,
                format!("Cancellation already requested by {}", by),
            ));
        }

        cancellation.cancel();
        action.cancellation_requested_by = Some(requested_by.to_string());
        if action.overall_status == MasterActionStatus::Running {
            action.transition_to(MasterActionStatus::Cancelling)?;
        }
        drop(action);

        logger
            .warn(format!("Cancellation requested by {}", requested_by))
            .await;

        Ok(CancelResponse::new(
            id.clone(),
            CancelOutcome::CancellationPending,
            "Cancellation requested",
        ))
    }

    /// Wait until the run `id` is fully finalized and return its archived copy
    pub async fn wait_for_completion(&self, id: &MasterActionId) -> Result<Option<MasterAction>> {
        let mut in_flight = self.inner.in_flight.subscribe();
        if in_flight
            .wait_for(|current| current.as_ref() != Some(id))
            .await
            .is_err()
        {
            warn!(master_action_id = %id, "Completion channel closed");
        }
        if let Some(finished) = self.inner.unjournaled(id) {
            return Ok(Some(finished));
        }
        Ok(self
            .inner
            .journal
            .actions()
            .get_archived_master_action(id)
            .await?)
    }

    fn live_handles(&self, id: &MasterActionId) -> Option<(Arc<Mutex<MasterAction>>, Arc<RunLogger>)> {
        self.inner
            .live
            .lock()
            .as_ref()
            .filter(|run| &run.id == id)
            .map(|run| (Arc::clone(&run.action), Arc::clone(&run.logger)))
    }
}

impl Inner {
    fn unjournaled(&self, id: &MasterActionId) -> Option<MasterAction> {
        self.unjournaled
            .lock()
            .iter()
            .rev()
            .find(|action| &action.id == id)
            .cloned()
    }

    /// Background execution of one run, always ending in finalization
    async fn run(
        self: Arc<Self>,
        ctx: WorkflowContext,
        handler: Result<Box<dyn Handler>>,
        permit: OwnedSemaphorePermit,
    ) {
        let id = ctx.id().clone();

        let outcome = match handler {
            Ok(handler) => AssertUnwindSafe(handler.execute(&ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ControlError::handler(panic_message(panic.as_ref())))),
            Err(e) => Err(e),
        };

        let (status, message) = match outcome {
            Ok(outcome) => (outcome.terminal_status(), outcome.message().map(str::to_string)),
            Err(ControlError::Cancelled(reason)) => (MasterActionStatus::Cancelled, Some(reason)),
            Err(e) => (MasterActionStatus::Failed, Some(e.to_string())),
        };

        self.finalize(ctx, status, message, permit).await;
        info!(master_action_id = %id, status = %status, "Master action finished");
    }

    async fn finalize(
        &self,
        ctx: WorkflowContext,
        status: MasterActionStatus,
        message: Option<String>,
        permit: OwnedSemaphorePermit,
    ) {
        let id = ctx.id().clone();

        let final_action = {
            let shared = self.live.lock().as_ref().map(|run| Arc::clone(&run.action));
            match shared {
                Some(shared) => {
                    let mut action = shared.lock().await;
                    let message = match (status, &action.cancellation_requested_by) {
                        (MasterActionStatus::Cancelled, Some(by)) => Some(format!(
                            "{} (requested by {})",
                            message.unwrap_or_else(|| "cancelled".to_string()),
                            by
                        )),
                        _ => message,
                    };
                    if !action.finish(status, message) {
                        warn!(master_action_id = %id, "Run was already terminal");
                    }
                    Some(action.clone())
                }
                None => None,
            }
        };

        match status {
            MasterActionStatus::Completed => ctx.logger().info("Master action completed").await,
            _ => {
                let reason = final_action
                    .as_ref()
                    .and_then(|a| a.status_message.clone())
                    .unwrap_or_default();
                ctx.logger()
                    .warn(format!("Master action {}: {}", status, reason))
                    .await
            }
        }

        // 1. Every buffered line is durable before the terminal record
        if let Err(e) = ctx.flush_logs().await {
            error!(master_action_id = %id, error = %e, "Failed to flush run logs");
        }

        // 2. Terminal record
        match final_action {
            Some(ref action) => {
                if let Err(e) = self.journal.actions().record_completed(action).await {
                    error!(master_action_id = %id, error = %e, "Failed to journal run completion");
                    // Status must not fall back to the stale archived snapshot
                    let mut unjournaled = self.unjournaled.lock();
                    if unjournaled.len() == UNJOURNALED_CAPACITY {
                        unjournaled.pop_front();
                    }
                    unjournaled.push_back(action.clone());
                }
            }
            None => error!(master_action_id = %id, "Live run vanished before finalization"),
        }

        // 3. Clear the live slot, 4. drop the token with the context
        self.live.lock().take();
        drop(ctx);

        // 5. Purge translator and journal mappings
        self.journal.purge_run(&id);

        // 6. Release single-flight, then wake waiters
        drop(permit);
        self.in_flight.send_if_modified(|current| {
            if current.as_ref() == Some(&id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

impl std::fmt::Debug for MasterActionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterActionCoordinator")
            .field("current", &self.current())
            .field("registry", &self.inner.registry)
            .finish()
    }
}
