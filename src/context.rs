//! Call context: metadata, deadline and cancellation.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

/// Carried by every client call and handed to every handler.
///
/// Cancelling a context cancels every context derived from it with
/// [`CallContext::child`].
#[derive(Debug, Clone)]
pub struct CallContext {
    metadata: Metadata,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context cancelled whenever `parent` is.
    pub fn child_of(parent: &CancellationToken, metadata: Metadata) -> Self {
        Self {
            metadata,
            deadline: None,
            cancel: parent.child_token(),
        }
    }

    pub fn background() -> Self {
        Self::new(Metadata::new())
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Derived context: same metadata and deadline, child cancellation.
    pub fn child(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}
