//! Query hooks: observe every statement the client runs.

use crate::error::{ChError, ChResult};
use std::time::Duration;
use tokio::time::Instant;

/// One statement as seen by hooks.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub query: String,
    /// Leading keyword, upper-cased (`SELECT`, `INSERT`, ...).
    pub operation: String,
    pub started_at: Instant,
    /// Set once the statement has finished.
    pub duration: Option<Duration>,
    /// Rows read, or written for inserts.
    pub rows: u64,
}

impl QueryEvent {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            operation: query_operation(query),
            started_at: Instant::now(),
            duration: None,
            rows: 0,
        }
    }

    pub(crate) fn finish(&mut self, rows: u64) {
        self.rows = rows;
        self.duration = Some(self.started_at.elapsed());
    }
}

/// Observer for client statements.
///
/// Hooks run in registration order before a statement and in reverse order
/// after it. An error from `before_query` aborts the statement; hooks that
/// already ran still see `after_query` with that error.
pub trait QueryHook: Send + Sync {
    fn before_query(&self, _event: &QueryEvent) -> ChResult<()> {
        Ok(())
    }

    fn after_query(&self, event: &QueryEvent, error: Option<&ChError>);
}

/// Logs each statement through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHook {
    /// Statements slower than this are logged at `warn`.
    pub slow_threshold: Option<Duration>,
}

impl QueryHook for TracingHook {
    fn after_query(&self, event: &QueryEvent, error: Option<&ChError>) {
        let elapsed_ms = event.duration.unwrap_or_default().as_millis() as u64;
        if let Some(err) = error {
            tracing::error!(
                operation = %event.operation,
                elapsed_ms,
                error = %err,
                query = %event.query,
                "query failed"
            );
            return;
        }
        let slow = self
            .slow_threshold
            .zip(event.duration)
            .is_some_and(|(limit, took)| took >= limit);
        if slow {
            tracing::warn!(operation = %event.operation, elapsed_ms, rows = event.rows, query = %event.query, "slow query");
        } else {
            tracing::debug!(operation = %event.operation, elapsed_ms, rows = event.rows, "query");
        }
    }
}

/// Ordered hook list.
#[derive(Default)]
pub(crate) struct Hooks {
    hooks: Vec<Box<dyn QueryHook>>,
}

impl Hooks {
    pub(crate) fn push(&mut self, hook: Box<dyn QueryHook>) {
        self.hooks.push(hook);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `before_query` in order. On a veto, unwind the hooks that ran
    /// and return the veto error.
    pub(crate) fn before(&self, event: &QueryEvent) -> ChResult<()> {
        for (i, hook) in self.hooks.iter().enumerate() {
            if let Err(err) = hook.before_query(event) {
                for ran in self.hooks[..i].iter().rev() {
                    ran.after_query(event, Some(&err));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn after(&self, event: &QueryEvent, error: Option<&ChError>) {
        for hook in self.hooks.iter().rev() {
            hook.after_query(event, error);
        }
    }
}

/// Upper-cased first keyword of `query`, skipping leading comments.
pub fn query_operation(query: &str) -> String {
    let mut rest = query.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, r)| r).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, r)| r).trim_start();
        } else {
            break;
        }
    }
    rest.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}
