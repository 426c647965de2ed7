//! Browser actuator for an LLM agent.
//!
//! Architecture:
//! - Daemon model: the browser persists between tool calls via BrowserSession
//! - Driver boundary: protocol specifics live behind the `Driver` trait
//! - Snapshot + Ref system: AI-friendly element targeting with numbered refs
//! - Target recovery: cross-origin navigations can silently destroy the
//!   active target; the session detects this and rebinds to the replacement

pub mod driver;
pub mod session;
pub mod snapshot;
pub mod tabs;
pub mod tool;

#[cfg(test)]
pub(crate) mod fixtures;

pub use driver::{Driver, TargetId, TargetInfo};
pub use session::BrowserSession;
pub use snapshot::{Snapshot, Snapshotter};
pub use tool::{BrowseTool, ContentExtractor};
