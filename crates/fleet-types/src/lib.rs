//! Fleet Types - Core types for the master control plane
//!
//! The master process coordinates long-running, multi-stage operations
//! (environment updates, backups, restores, diagnostics, package changes)
//! across a fleet of managed nodes. This crate holds the shared data model.
//!
//! ## Key Concepts
//!
//! - **MasterAction**: One orchestrated workflow instance, tracked end-to-end
//! - **StageRecord**: A completed, immutable stage of a MasterAction
//! - **NodeAction / NodeTask**: Work dispatched to, and tracked per, managed nodes
//! - **ChangeRecord**: Audit-level, two-phase record of a state-changing event
//! - **Views**: Boundary shapes returned to status and cancellation callers

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod action;
pub mod change;
pub mod ids;
pub mod view;

// Re-export main types
pub use action::{
    InvalidTransition, MasterAction, MasterActionStatus, NodeAction, NodeTask, NodeTaskStatus, OperationType,
    Parameters, StageRecord, WorkflowOutcome,
};
pub use change::{
    ChangeOutcome, ChangePhase, ChangeQuery, ChangeQueryBuilder, ChangeRecord, ChangeSortField,
    ChangeSummary, ChangeType, Page, StateChangeFinalization, StateChangeHandle,
    StateChangeRequest,
};
pub use ids::{ChangeId, MasterActionId, NodeActionId, TaskId};
pub use view::{CancelOutcome, CancelResponse, InitiateRequest, MasterActionView, StageView};
