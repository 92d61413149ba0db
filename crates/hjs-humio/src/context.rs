//! Request context: cancellation and deadline carried through every call

use crate::error::{HumioError, HumioResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation and deadline for one logical operation
///
/// Cheap to clone; clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<Option<String>>>,
}

/// Cancels the [`Context`] it was created with
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<String>>,
}

impl CancelHandle {
    /// Cancel with a cause reported to the caller instead of the transport error
    pub fn cancel(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        });
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a cancellable context
    ///
    /// The derived context is cancelled by the returned handle. It does not
    /// observe cancellation of `self`.
    pub fn with_cancel(self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(None);
        let ctx = Self {
            deadline: self.deadline,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancellation cause, if cancelled
    pub fn cancel_cause(&self) -> Option<String> {
        self.cancel.as_ref().and_then(|rx| rx.borrow().clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_cause().is_some()
    }

    /// Resolves with the cause once cancelled; pending forever otherwise
    pub async fn cancelled(&self) -> String {
        if let Some(rx) = &self.cancel {
            let mut rx = rx.clone();
            let cause = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|cause| cause.clone());
            if let Some(cause) = cause {
                return cause;
            }
        }
        std::future::pending().await
    }

    /// Run `fut` until it completes, the context is cancelled, or the
    /// deadline passes
    pub async fn run<T, F>(&self, fut: F) -> HumioResult<T>
    where
        F: Future<Output = HumioResult<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            cause = self.cancelled() => Err(HumioError::Cancelled(cause)),
            _ = deadline => Err(HumioError::DeadlineExceeded),
            result = fut => result.map_err(|e| self.prefer_cancel_cause(e)),
        }
    }

    /// If the context was cancelled, its cause is more useful than the
    /// transport error it caused
    pub fn prefer_cancel_cause(&self, err: HumioError) -> HumioError {
        match (&err, self.cancel_cause()) {
            (HumioError::Network(_), Some(cause)) => HumioError::Cancelled(cause),
            _ => err,
        }
    }
}
