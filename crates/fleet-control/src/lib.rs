//! Fleet Control - Workflow orchestration for the master control plane
//!
//! The [`MasterActionCoordinator`] runs at most one master action at a time.
//! Each run is executed by the [`Handler`] registered for its operation type,
//! which drives stages through a [`WorkflowContext`]:
//!
//! ```text
//! initiate ─▶ permit ─▶ journal Initiated ─▶ spawn ─▶ Handler::execute(ctx)
//!                                                        │
//!        release ◀─ purge ◀─ clear slot ◀─ journal Completed ◀─ flush logs
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod logging;
pub mod registry;

pub use config::CoordinatorConfig;
pub use context::WorkflowContext;
pub use coordinator::MasterActionCoordinator;
pub use error::{ControlError, Result};
pub use handler::Handler;
pub use logging::{LogFlushFn, RunLogger};
pub use registry::{HandlerFactory, HandlerRegistry, HandlerRegistryBuilder};
