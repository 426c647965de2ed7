pub mod browser;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tabwright_core::Result;
use tokio_util::sync::CancellationToken;

pub use registry::ToolRegistry;

/// Truncate a string to at most `max_bytes` bytes, respecting UTF-8 char
/// boundaries, and append a marker when anything was cut.
pub fn truncate_text(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    /// Fired when the caller abandons the request.
    pub cancel: CancellationToken,
    /// Overrides the configured per-call deadline when set.
    pub deadline: Option<Duration>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value>;
}
