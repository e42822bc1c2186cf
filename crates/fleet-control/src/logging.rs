//! Run-scoped logger
//!
//! Lines are emitted to `tracing` immediately, buffered for the action
//! journal, and kept in a bounded ring for status responses.

use crate::config::CoordinatorConfig;
use crate::error::Result;
use fleet_journal::{Journal, LogLevel, LogLine};
use fleet_types::MasterActionId;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// No-argument async operation draining a run's buffered log lines
pub type LogFlushFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Logger bound to one master action
pub struct RunLogger {
    master_action_id: MasterActionId,
    journal: Journal,
    stage: Mutex<Option<usize>>,
    buffer: Mutex<Vec<LogLine>>,
    recent: Mutex<VecDeque<String>>,
    recent_capacity: usize,
    flush_threshold: usize,
    /// Keeps concurrent flushes from reordering lines on disk
    flush_lock: tokio::sync::Mutex<()>,
}

impl RunLogger {
    pub fn new(master_action_id: MasterActionId, journal: Journal, config: &CoordinatorConfig) -> Self {
        Self {
            master_action_id,
            journal,
            stage: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_log_lines)),
            recent_capacity: config.recent_log_lines,
            flush_threshold: config.log_flush_threshold.max(1),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn master_action_id(&self) -> &MasterActionId {
        &self.master_action_id
    }

    /// Stage subsequent lines are filed under
    pub fn set_stage(&self, stage_index: Option<usize>) {
        *self.stage.lock() = stage_index;
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into()).await
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into()).await
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into()).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into()).await
    }

    /// Record one line, flushing once the buffer reaches its threshold.
    ///
    /// A failed threshold flush keeps the lines buffered for the next attempt.
    pub async fn log(&self, level: LogLevel, message: String) {
        let stage = *self.stage.lock();
        let id = &self.master_action_id;
        match level {
            LogLevel::Debug => debug!(master_action_id = %id, stage = ?stage, "{}", message),
            LogLevel::Info => info!(master_action_id = %id, stage = ?stage, "{}", message),
            LogLevel::Warn => warn!(master_action_id = %id, stage = ?stage, "{}", message),
            LogLevel::Error => error!(master_action_id = %id, stage = ?stage, "{}", message),
        }

        let line = LogLine::new(level, message, stage);
        {
            let mut recent = self.recent.lock();
            if self.recent_capacity > 0 {
                if recent.len() == self.recent_capacity {
                    recent.pop_front();
                }
                recent.push_back(line.render());
            }
        }

        let buffered = {
            let mut buffer = self.buffer.lock();
            buffer.push(line);
            buffer.len()
        };

        if buffered >= self.flush_threshold {
            if let Err(e) = self.flush().await {
                warn!(master_action_id = %id, error = %e, "Log flush failed, keeping lines buffered");
            }
        }
    }

    /// Write every buffered line to the action journal.
    ///
    /// Lines go out one stage file at a time; on failure only the groups not
    /// yet written return to the buffer.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let lines = std::mem::take(&mut *self.buffer.lock());
        if lines.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<Option<usize>, Vec<LogLine>> = BTreeMap::new();
        for line in lines {
            groups.entry(line.stage_index).or_default().push(line);
        }

        let mut pending = groups.into_values();
        while let Some(group) = pending.next() {
            if let Err(e) = self
                .journal
                .actions()
                .append_master_log(&self.master_action_id, &group)
                .await
            {
                let mut unwritten: Vec<LogLine> = group.into_iter().chain(pending.flatten()).collect();
                unwritten.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                // Put them back ahead of anything logged meanwhile
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, unwritten);
                buffer.extend(newer);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Lines not yet written to the journal
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Most recent rendered lines, oldest first
    pub fn recent_lines(&self) -> Vec<String> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Flush callback handed to the workflow context
    pub fn flush_callback(self: &Arc<Self>) -> LogFlushFn {
        let logger = Arc::clone(self);
        Arc::new(move || {
            let logger = Arc::clone(&logger);
            Box::pin(async move { logger.flush().await })
        })
    }
}
