//! Protocol driver boundary.
//!
//! The session never speaks a wire protocol itself; it issues page-level
//! commands against an opaque driver. A CDP client, a WebDriver client, or a
//! test fake all fit behind this trait.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tabwright_core::{BrowserConfig, Result};
use tokio::sync::broadcast;

/// Opaque target (tab) identity assigned by the browser process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry from the browser's live-target listing.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub id: TargetId,
    /// Target kind as reported by the browser ("page", "iframe", ...).
    pub kind: String,
    pub url: String,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }

    /// Page targets with a real URL are the only recovery candidates;
    /// about:blank targets are helper windows the browser spins up.
    pub fn has_page_url(&self) -> bool {
        self.is_page() && !self.url.is_empty() && self.url != "about:blank"
    }
}

/// Page-level command surface the session drives the browser through.
///
/// A `Handle` is one live connection bound to one target; every per-page
/// command takes the handle it should run against. `list_targets` and
/// `watch_new_targets` must be issued on the control handle, the only
/// connection guaranteed to outlive target destruction.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Start the browser process. Called at most once per session.
    async fn launch(&self, config: &BrowserConfig) -> Result<()>;

    /// Open a connection. `Some(id)` attaches to an existing target,
    /// `None` creates a fresh tab.
    async fn connect(&self, target: Option<&TargetId>) -> Result<(TargetId, Self::Handle)>;

    /// Tear down a target connection and close its tab.
    async fn release(&self, handle: &Self::Handle) -> Result<()>;

    async fn navigate(&self, handle: &Self::Handle, url: &str) -> Result<()>;

    /// Wait until the page body is present and loaded.
    async fn wait_ready(&self, handle: &Self::Handle) -> Result<()>;

    /// Evaluate a JS expression in the page, returning its JSON value.
    async fn evaluate(&self, handle: &Self::Handle, js: &str) -> Result<Value>;

    /// Current page URL.
    async fn location(&self, handle: &Self::Handle) -> Result<String>;

    /// Click the element bound to a snapshot ref.
    async fn click_ref(&self, handle: &Self::Handle, ref_no: u32) -> Result<()>;

    /// Clear and type into the element bound to a snapshot ref.
    async fn type_ref(&self, handle: &Self::Handle, ref_no: u32, text: &str) -> Result<()>;

    /// List all live targets in the browser.
    async fn list_targets(&self, control: &Self::Handle) -> Result<Vec<TargetInfo>>;

    /// Subscribe to target-creation events (e.g. a click opening a tab).
    fn watch_new_targets(&self, control: &Self::Handle) -> broadcast::Receiver<TargetInfo>;

    /// Give the page time to settle after an interaction.
    async fn settle(&self, handle: &Self::Handle, duration: Duration) -> Result<()>;
}
