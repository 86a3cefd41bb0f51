use std::time::Duration;

/// Tunables for an [`crate::Orchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound for a single executor call. `None` waits indefinitely.
    pub step_timeout: Option<Duration>,
    /// Log entries fetched per page when reading a run's log.
    pub log_page_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: None,
            log_page_size: 256,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Clamp values the runtime cannot accept.
    #[must_use]
    pub(crate) fn sanitized(mut self) -> Self {
        self.log_page_size = self.log_page_size.max(1);
        if self.step_timeout == Some(Duration::ZERO) {
            self.step_timeout = None;
        }
        self
    }
}
