//! Pluggable line filters intercepting in- and outbound traffic.

/// Maps one line to one line. Invoked on every outbound line before
/// transmission and every inbound line before classification; returning
/// [`crate::protocol::MESSAGE_DISCARDED`] vetoes the line.
pub trait Filter: Send + Sync {
    fn filter(&self, line: &str) -> String;
}

/// Passes every line through untouched.
#[derive(Debug, Default)]
pub struct DefaultFilter;

impl Filter for DefaultFilter {
    fn filter(&self, line: &str) -> String {
        line.to_owned()
    }
}

/// Pass-through filter that logs each intercepted line. Useful for
/// inspecting wire traffic during debugging.
#[derive(Debug)]
pub struct LoggingFilter {
    prefix: String,
}

impl LoggingFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Filter for LoggingFilter {
    fn filter(&self, line: &str) -> String {
        tracing::debug!(prefix = %self.prefix, line = %line, "intercepted line");
        line.to_owned()
    }
}
