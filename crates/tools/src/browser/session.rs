//! Browser session: startup gate, tab bookkeeping, operation serialization,
//! and recovery of silently destroyed targets.
//!
//! One session owns one browser process for its whole lifetime (daemon
//! model). The first tab's connection doubles as the control handle: it is
//! the session's channel to the browser itself and is never released, even
//! when that tab stops being the active one.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use tabwright_core::{BrowserConfig, Error, Result};

use super::driver::{Driver, TargetId, TargetInfo};
use super::snapshot::{SnapshotCache, Snapshotter};
use super::tabs::{TabEntry, TabRegistry};
use crate::ToolContext;

struct SessionState<D: Driver> {
    tabs: TabRegistry<D::Handle>,
    /// Connection of the first tab, kept for the session's lifetime.
    control: Option<Arc<D::Handle>>,
    snapshots: SnapshotCache,
}

pub struct BrowserSession<D: Driver> {
    driver: Arc<D>,
    snapshotter: Arc<dyn Snapshotter<D::Handle>>,
    config: BrowserConfig,
    /// Run-once startup gate. Caches failure as well as success, so a
    /// browser that refused to start fails every later call the same way.
    started: OnceCell<std::result::Result<(), String>>,
    /// Serializes every driver-facing operation. The browser connection is
    /// a shared stateful resource; overlapping commands corrupt each other.
    op_lock: Mutex<()>,
    state: Mutex<SessionState<D>>,
}

impl<D: Driver> BrowserSession<D> {
    pub fn new(
        driver: Arc<D>,
        snapshotter: Arc<dyn Snapshotter<D::Handle>>,
        config: BrowserConfig,
    ) -> Self {
        Self {
            driver,
            snapshotter,
            config,
            started: OnceCell::new(),
            op_lock: Mutex::new(()),
            state: Mutex::new(SessionState {
                tabs: TabRegistry::new(),
                control: None,
                snapshots: SnapshotCache::default(),
            }),
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Idempotent startup. The first caller launches the browser and opens
    /// the first tab; everyone else observes the cached outcome.
    pub async fn ensure_started(&self) -> Result<()> {
        let outcome = self
            .started
            .get_or_init(|| async { self.launch().await.map_err(|e| e.to_string()) })
            .await;
        outcome.clone().map_err(Error::Startup)
    }

    async fn launch(&self) -> Result<()> {
        info!(headless = self.config.headless, "launching browser");
        self.driver.launch(&self.config).await?;
        let (id, handle) = self.driver.connect(None).await?;
        debug!(target = %id, "first tab attached");
        let handle = Arc::new(handle);
        let mut state = self.state.lock().await;
        state.control = Some(handle.clone());
        state.tabs.register(id.clone(), TabEntry::new(handle, true));
        state.tabs.set_active(&id);
        Ok(())
    }

    /// Run one operation under the session-wide lock, bounded by the
    /// caller's cancellation signal and the per-call deadline. The deadline
    /// clock starts after the lock is acquired, so a queued call is not
    /// charged for its predecessor's work.
    pub async fn run_op<T>(
        &self,
        ctx: &ToolContext,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Timeout("request cancelled before dispatch".into()));
        }
        let _ops = self.op_lock.lock().await;
        let deadline = ctx
            .deadline
            .unwrap_or(Duration::from_secs(self.config.call_timeout_secs));
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(Error::Timeout("request cancelled".into())),
            res = tokio::time::timeout(deadline, fut) => match res {
                Ok(out) => out,
                Err(_) => Err(Error::Timeout(format!(
                    "operation exceeded {}s",
                    deadline.as_secs()
                ))),
            },
        }
    }

    /// Run a per-tab future racing the tab's lifetime, so an operation
    /// against a tab that gets closed or replaced fails fast instead of
    /// hanging on a dead connection.
    pub async fn on_tab<T>(
        &self,
        entry: &TabEntry<D::Handle>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = entry.lifetime.cancelled() => Err(Error::TargetLost(
                "tab was closed or replaced during the operation".into(),
            )),
            res = fut => res,
        }
    }

    pub async fn control_handle(&self) -> Result<Arc<D::Handle>> {
        self.state
            .lock()
            .await
            .control
            .clone()
            .ok_or_else(|| Error::Startup("browser not started".into()))
    }

    pub async fn active_tab(&self) -> Result<(TargetId, TabEntry<D::Handle>)> {
        self.state
            .lock()
            .await
            .tabs
            .active()
            .ok_or_else(|| Error::Session("no active tab".into()))
    }

    pub async fn tab_count(&self) -> usize {
        self.state.lock().await.tabs.len()
    }

    pub async fn tab_at(&self, index: usize) -> Option<TargetId> {
        self.state.lock().await.tabs.at_index(index)
    }

    /// Make the tab at `index` active.
    pub async fn switch_to(&self, index: usize) -> Result<(TargetId, TabEntry<D::Handle>)> {
        let mut state = self.state.lock().await;
        let count = state.tabs.len();
        let id = state
            .tabs
            .at_index(index)
            .ok_or_else(|| {
                Error::Validation(format!("tab index {} out of range (have {} tabs)", index, count))
            })?;
        state.tabs.set_active(&id);
        let entry = state
            .tabs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Session("tab vanished during switch".into()))?;
        Ok((id, entry))
    }

    /// Register a tab the browser created on its own (a click that opened a
    /// window) and make it active.
    pub async fn adopt_tab(
        &self,
        id: TargetId,
        handle: D::Handle,
    ) -> (TargetId, TabEntry<D::Handle>) {
        let entry = TabEntry::new(Arc::new(handle), false);
        let mut state = self.state.lock().await;
        state.tabs.register(id.clone(), entry.clone());
        state.tabs.set_active(&id);
        (id, entry)
    }

    /// Open a fresh tab and make it active.
    pub async fn open_tab(&self) -> Result<(TargetId, TabEntry<D::Handle>)> {
        let (id, handle) = self.driver.connect(None).await?;
        debug!(target = %id, "opened new tab");
        Ok(self.adopt_tab(id, handle).await)
    }

    /// Roll back a tab whose initial navigation failed: drop it from the
    /// registry, release its connection, and fall back to the first tab.
    pub async fn discard_tab(&self, id: &TargetId) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.tabs.remove(id);
            if state.tabs.active_id().is_none() {
                if let Some(first) = state.tabs.at_index(0) {
                    state.tabs.set_active(&first);
                }
            }
            removed
        };
        if let Some(entry) = removed {
            if !entry.is_control {
                if let Err(e) = self.driver.release(&entry.handle).await {
                    debug!(target = %id, "release of discarded tab failed: {}", e);
                }
            }
        }
    }

    /// Close the active tab and activate its predecessor in creation order
    /// (the first tab when the closed one was first). Refuses to close the
    /// last remaining tab.
    pub async fn close_active_tab(&self) -> Result<(TargetId, TabEntry<D::Handle>)> {
        let closed = {
            let mut state = self.state.lock().await;
            if state.tabs.len() <= 1 {
                return Err(Error::Validation("cannot close the last tab".into()));
            }
            let closing_id = state
                .tabs
                .active_id()
                .cloned()
                .ok_or_else(|| Error::Session("no active tab".into()))?;
            let closing_idx = state.tabs.index_of(&closing_id).unwrap_or(0);
            let entry = state
                .tabs
                .remove(&closing_id)
                .ok_or_else(|| Error::Session("active tab not in registry".into()))?;

            let next_idx = closing_idx.saturating_sub(1);
            let next_id = state
                .tabs
                .at_index(next_idx)
                .or_else(|| state.tabs.at_index(0))
                .ok_or_else(|| Error::Session("no tab left to activate".into()))?;
            state.tabs.set_active(&next_id);
            debug!(closed = %closing_id, now_active = %next_id, "closed tab");
            (closing_id, entry)
        };

        if !closed.1.is_control {
            if let Err(e) = self.driver.release(&closed.1.handle).await {
                debug!(target = %closed.0, "release of closed tab failed: {}", e);
            }
        }

        self.active_tab().await
    }

    /// Rebind the active slot after the browser silently destroyed the
    /// active target (typically a cross-origin navigation swapping the
    /// renderer process).
    ///
    /// Protocol: list live targets over the control handle, pick a
    /// replacement, attach to it, and splice it into the registry at the
    /// dead tab's position. Displaced connections are released unless they
    /// are the control handle.
    pub async fn recover_active_target(&self) -> Result<(TargetId, TabEntry<D::Handle>)> {
        let control = self.control_handle().await?;

        let (dead, known) = {
            let state = self.state.lock().await;
            let dead = state
                .tabs
                .active_id()
                .cloned()
                .ok_or_else(|| Error::Session("no active tab".into()))?;
            (dead, state.tabs.known_ids())
        };

        let targets = self
            .driver
            .list_targets(&control)
            .await
            .map_err(|e| Error::RecoveryFailed(format!("failed to list targets: {}", e)))?;

        let replacement = select_replacement(&targets, &known, &dead).ok_or_else(|| {
            Error::RecoveryFailed(format!(
                "no suitable page target found (saw {} targets)",
                targets.len()
            ))
        })?;

        info!(old = %dead, new = %replacement, "recovering active target");

        let (new_id, handle) = self
            .driver
            .connect(Some(&replacement))
            .await
            .map_err(|e| {
                Error::RecoveryFailed(format!("failed to attach to replacement target: {}", e))
            })?;

        let displaced = {
            let mut state = self.state.lock().await;
            state
                .tabs
                .replace(&dead, new_id.clone(), TabEntry::new(Arc::new(handle), false))
        };
        for entry in displaced {
            if entry.is_control {
                continue;
            }
            if let Err(e) = self.driver.release(&entry.handle).await {
                debug!("release of displaced target failed: {}", e);
            }
        }

        self.active_tab().await
    }

    /// Take a snapshot of the given tab and cache it, invalidating all
    /// previous refs.
    pub async fn capture_snapshot(&self, entry: &TabEntry<D::Handle>) -> Result<()> {
        let snap = self
            .on_tab(entry, self.snapshotter.take_snapshot(&entry.handle))
            .await?;
        self.state.lock().await.snapshots.record(snap);
        Ok(())
    }

    pub async fn resolve_ref(&self, ref_no: i64) -> Result<Option<String>> {
        self.state.lock().await.snapshots.resolve_ref(ref_no)
    }

    pub async fn last_snapshot_text(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .snapshots
            .last()
            .map(|s| s.text.clone())
    }
}

/// Pick a replacement for a destroyed target.
///
/// Two passes: prefer a page target the registry has never seen (almost
/// certainly the browser-created successor), else any page target other
/// than the dead one. The successor is not directly observable through the
/// target list, so this stays a heuristic; keeping it in one place lets a
/// sharper signal replace it later.
fn select_replacement(
    targets: &[TargetInfo],
    known: &HashSet<TargetId>,
    dead: &TargetId,
) -> Option<TargetId> {
    if let Some(t) = targets
        .iter()
        .find(|t| t.has_page_url() && !known.contains(&t.id))
    {
        return Some(t.id.clone());
    }
    targets
        .iter()
        .find(|t| t.has_page_url() && t.id != *dead)
        .map(|t| t.id.clone())
}
