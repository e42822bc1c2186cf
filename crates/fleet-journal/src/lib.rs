//! Fleet Journal - Durable records of the master control plane
//!
//! Two independent logs share one storage root:
//!
//! - **Change journal**: audit-level, two-phase (Initiated / Completed) records
//!   of state-changing events, with backup artifact directories and stored results
//! - **Action journal**: per-run debug trail of stage inputs, results and
//!   interleaved master and agent log lines
//!
//! The [`ActionIdTranslator`] attributes agent output, which only carries a
//! node action id, to the owning master action.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod action;
pub mod change;
pub mod config;
pub mod error;
pub mod journal;
pub mod layout;
pub mod translator;

pub use action::{
    ActionJournal, ActionRunDetails, FileActionJournal, LogLevel, LogLine, RunSummary, StageDetails,
    StageInputEnvelope, StageResultEnvelope, INTERRUPTED_MESSAGE,
};
pub use change::{ChangeJournal, FileChangeJournal};
pub use config::JournalConfig;
pub use error::{JournalError, Result};
pub use journal::{Journal, RecoveryReport};
pub use layout::JournalLayout;
pub use translator::ActionIdTranslator;
