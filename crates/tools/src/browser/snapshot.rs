//! Page snapshots and the ref system.
//!
//! A snapshot is a compact text rendering of the page with numbered refs
//! (`[ref=N]`) on interactive elements. Refs are positional: they are only
//! meaningful against the snapshot they came from, so the session keeps
//! exactly one snapshot and every ref argument is validated against it.

use std::collections::HashMap;

use async_trait::async_trait;
use tabwright_core::{Error, Result};

/// A textual page snapshot with numbered refs for interactive elements.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub text: String,
    /// Whether the snapshot carries any refs at all.
    pub has_refs: bool,
    /// Highest ref number present; refs are 1-based and contiguous.
    pub max_ref: u32,
    /// Refs that are plain hyperlinks, mapped to their absolute targets.
    pub ref_hrefs: HashMap<u32, String>,
}

/// Produces snapshots from a live page. The extraction algorithm (DOM walk,
/// accessibility tree, etc.) is a collaborator concern.
#[async_trait]
pub trait Snapshotter<H: Send + Sync>: Send + Sync {
    async fn take_snapshot(&self, handle: &H) -> Result<Snapshot>;
}

/// Single-slot cache for the most recent snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    last: Option<Snapshot>,
}

impl SnapshotCache {
    /// Replace the cached snapshot; all refs from the previous one die here.
    pub fn record(&mut self, snapshot: Snapshot) {
        self.last = Some(snapshot);
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.last.as_ref()
    }

    /// Validate a ref against the current snapshot. Returns the href when the
    /// ref is a plain link, so the caller can navigate instead of clicking.
    /// Takes the ref as supplied so an out-of-range value is echoed verbatim
    /// in the error.
    pub fn resolve_ref(&self, ref_no: i64) -> Result<Option<String>> {
        let snap = match &self.last {
            Some(s) if s.has_refs => s,
            _ => {
                return Err(Error::Validation(
                    "no snapshot available; take a snapshot first".into(),
                ))
            }
        };
        if ref_no < 1 || ref_no > i64::from(snap.max_ref) {
            return Err(Error::Validation(format!(
                "ref {} not found in current snapshot (valid range: 1-{})",
                ref_no, snap.max_ref
            )));
        }
        Ok(snap
            .ref_hrefs
            .get(&(ref_no as u32))
            .filter(|h| !h.is_empty())
            .cloned())
    }
}
