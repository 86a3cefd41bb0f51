use std::collections::VecDeque;
use std::sync::Arc;

use automation_center_domain::{recompute_log_entry_hash, LogEntry, RunError, RunId};
use automation_center_store_core::RunStore;
use serde::Serialize;

use crate::run_blocking;

/// Lazy, page-by-page reader over one run's log in `(timestamp, counter)` order.
///
/// The sequence ends when a page comes back empty; [`LogEntries::restart`]
/// rewinds to the first entry.
pub struct LogEntries {
    store: Arc<dyn RunStore>,
    run_id: RunId,
    page_size: usize,
    after_counter: u64,
    buffer: VecDeque<LogEntry>,
    exhausted: bool,
}

impl LogEntries {
    pub(crate) fn new(store: Arc<dyn RunStore>, run_id: RunId, page_size: usize) -> Self {
        Self {
            store,
            run_id,
            page_size,
            after_counter: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next entry, fetching another page when the buffer runs dry.
    ///
    /// # Errors
    /// Returns [`RunError::Storage`] when a page cannot be read.
    pub async fn next_entry(&mut self) -> Result<Option<LogEntry>, RunError> {
        if self.buffer.is_empty() && !self.exhausted {
            let (run_id, after, limit) = (self.run_id, self.after_counter, self.page_size);
            let page =
                run_blocking(&self.store, move |store| store.list_logs(run_id, after, limit))
                    .await?;
            if page.len() < limit {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }

        let entry = self.buffer.pop_front();
        if let Some(entry) = &entry {
            self.after_counter = entry.counter;
        }
        Ok(entry)
    }

    /// Rewind to the first entry of the run.
    pub fn restart(&mut self) {
        self.after_counter = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    /// Read every remaining entry.
    ///
    /// # Errors
    /// Returns [`RunError::Storage`] when a page cannot be read.
    pub async fn collect_remaining(&mut self) -> Result<Vec<LogEntry>, RunError> {
        let mut out = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            out.push(entry);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub run_id: RunId,
    pub entries: usize,
    pub chain_valid: bool,
    /// Counter of the first entry that breaks the chain, when invalid.
    pub first_invalid_counter: Option<u64>,
}

/// Walk entries in log order and check counters, ordering, and hash links.
pub(crate) fn audit_entries(run_id: RunId, entries: &[LogEntry]) -> AuditReport {
    let mut prev: Option<&LogEntry> = None;
    let mut expected_counter = 0u64;
    let mut first_invalid_counter = None;

    for entry in entries {
        expected_counter += 1;
        let linked = entry.prev_entry_hash.as_deref() == prev.map(|p| p.entry_hash.as_str());
        let ordered = match prev {
            Some(p) => p.order_key() < entry.order_key(),
            None => true,
        };
        let hash_matches = recompute_log_entry_hash(entry)
            .map(|hash| hash == entry.entry_hash)
            .unwrap_or(false);

        if entry.run_id != run_id
            || entry.counter != expected_counter
            || !linked
            || !ordered
            || !hash_matches
        {
            first_invalid_counter = Some(entry.counter);
            break;
        }
        prev = Some(entry);
    }

    AuditReport {
        run_id,
        entries: entries.len(),
        chain_valid: first_invalid_counter.is_none(),
        first_invalid_counter,
    }
}
