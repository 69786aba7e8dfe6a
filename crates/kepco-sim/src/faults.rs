//! Fault injection for resilience tests.
//!
//! Faults are armed on a [`Faults`] value before the simulator starts (or
//! later through [`Simulator::set_faults`](crate::Simulator::set_faults)) and fire
//! deterministically: by command prefix, by query ordinal, or on every
//! echo.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Computes the reply to the n-th point-count query (1-based, counted over
/// the device's lifetime) given the true count. `None` answers truthfully.
pub type PointCountFn = dyn Fn(usize, usize) -> Option<String> + Send + Sync;

/// An error queued when a matching command arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InjectedError {
    prefix: String,
    code: i32,
    message: String,
    remaining: usize,
}

/// Replies withheld for a matching query.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DroppedReply {
    prefix: String,
    remaining: usize,
}

/// Armed faults.
#[derive(Clone, Default)]
pub struct Faults {
    point_count: Option<Arc<PointCountFn>>,
    errors: Vec<InjectedError>,
    dropped: Vec<DroppedReply>,
    /// Telnet port does not echo commands.
    pub suppress_echo: bool,
    /// Telnet echoes are preceded by an `IAC WILL ECHO` sequence, split
    /// across two writes.
    pub iac_in_echo: bool,
    /// Telnet echoes (and the replies behind them) are held back this long.
    pub echo_delay: Option<Duration>,
}

impl fmt::Debug for Faults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Faults")
            .field("point_count", &self.point_count.is_some())
            .field("errors", &self.errors)
            .field("dropped", &self.dropped)
            .field("suppress_echo", &self.suppress_echo)
            .field("iac_in_echo", &self.iac_in_echo)
            .field("echo_delay", &self.echo_delay)
            .finish()
    }
}

impl Faults {
    /// No faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Override point-count replies.
    #[must_use]
    pub fn with_point_count<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) -> Option<String> + Send + Sync + 'static,
    {
        self.point_count = Some(Arc::new(f));
        self
    }

    /// Report `actual - 1` points from the `from`-th point-count query on.
    #[must_use]
    pub fn short_count_from(self, from: usize) -> Self {
        self.with_point_count(move |n, actual| {
            (n >= from).then(|| actual.saturating_sub(1).to_string())
        })
    }

    /// Queue `code,"message"` the next `times` times a command starting
    /// with `prefix` (case-insensitive) is received.
    #[must_use]
    pub fn with_error_on(
        mut self,
        prefix: &str,
        code: i32,
        message: &str,
        times: usize,
    ) -> Self {
        self.errors.push(InjectedError {
            prefix: prefix.to_uppercase(),
            code,
            message: message.to_string(),
            remaining: times,
        });
        self
    }

    /// Withhold the reply to the next `times` queries starting with
    /// `prefix` (case-insensitive).
    #[must_use]
    pub fn with_dropped_replies(mut self, prefix: &str, times: usize) -> Self {
        self.dropped.push(DroppedReply {
            prefix: prefix.to_uppercase(),
            remaining: times,
        });
        self
    }

    /// Disable the Telnet echo.
    #[must_use]
    pub fn without_echo(mut self) -> Self {
        self.suppress_echo = true;
        self
    }

    /// Put Telnet control sequences in the echo stream.
    #[must_use]
    pub fn with_iac_in_echo(mut self) -> Self {
        self.iac_in_echo = true;
        self
    }

    /// Echo each Telnet line `delay` after it arrives.
    #[must_use]
    pub fn with_echo_delay(mut self, delay: Duration) -> Self {
        self.echo_delay = Some(delay);
        self
    }

    pub(crate) fn point_count_reply(&self, ordinal: usize, actual: usize) -> Option<String> {
        self.point_count.as_ref().and_then(|f| f(ordinal, actual))
    }

    pub(crate) fn take_injected_error(&mut self, upper: &str) -> Option<(i32, String)> {
        let hit = self
            .errors
            .iter_mut()
            .find(|e| e.remaining > 0 && upper.starts_with(&e.prefix))?;
        hit.remaining -= 1;
        tracing::debug!(command = %upper, code = hit.code, "Injecting device error");
        Some((hit.code, hit.message.clone()))
    }

    pub(crate) fn take_dropped_reply(&mut self, upper: &str) -> bool {
        match self
            .dropped
            .iter_mut()
            .find(|d| d.remaining > 0 && upper.starts_with(&d.prefix))
        {
            Some(hit) => {
                hit.remaining -= 1;
                true
            }
            None => false,
        }
    }
}
