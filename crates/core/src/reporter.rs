//! Error channel: the only place delivery failures become visible.
//!
//! Failures are normalized into [`TrackerError`], logged when debug mode is on,
//! and handed to the caller's callback. A panicking callback is caught so it
//! can never take the host application down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::{ErrorKind, TrackerError};

pub type ErrorCallback = Arc<dyn Fn(&TrackerError) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ErrorReporter {
    debug: bool,
    callback: Option<ErrorCallback>,
}

impl ErrorReporter {
    pub fn new(debug: bool, callback: Option<ErrorCallback>) -> Self {
        Self { debug, callback }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn report(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
        cause: Option<String>,
    ) {
        let error = TrackerError {
            kind,
            message: message.into(),
            status_code,
            cause,
        };

        metrics::counter!("pulse.transport.errors", "kind" => kind.as_str()).increment(1);

        if self.debug {
            warn!(
                kind = %error.kind,
                message = %error.message,
                status_code = ?error.status_code,
                cause = ?error.cause,
                "pulse delivery error"
            );
        }

        let Some(callback) = &self.callback else {
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| callback(&error)));
        if outcome.is_err() && self.debug {
            warn!(kind = %error.kind, "pulse error callback panicked");
        }
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("debug", &self.debug)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
