//! Tab registry: which targets the session knows about, their creation
//! order, and which one actions apply to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::driver::TargetId;

/// One registered tab.
#[derive(Debug)]
pub struct TabEntry<H> {
    pub handle: Arc<H>,
    /// Cancelled when the tab leaves the registry; in-flight operations
    /// against the tab race this token.
    pub lifetime: CancellationToken,
    /// The control tab's connection keeps the browser's control channel
    /// alive and is never released.
    pub is_control: bool,
}

impl<H> TabEntry<H> {
    pub fn new(handle: Arc<H>, is_control: bool) -> Self {
        Self {
            handle,
            lifetime: CancellationToken::new(),
            is_control,
        }
    }
}

// Manual impl: H itself need not be Clone, only the Arc is.
impl<H> Clone for TabEntry<H> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            lifetime: self.lifetime.clone(),
            is_control: self.is_control,
        }
    }
}

/// Registry invariants: `order` holds exactly the keys of `entries` with no
/// duplicates, and `active` is either `None` or a key of `entries`.
pub struct TabRegistry<H> {
    entries: HashMap<TargetId, TabEntry<H>>,
    order: Vec<TargetId>,
    active: Option<TargetId>,
}

impl<H> TabRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            active: None,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &TargetId) -> Option<&TabEntry<H>> {
        self.entries.get(id)
    }

    /// Insert a tab at the end of the order. Does not change the active tab.
    pub fn register(&mut self, id: TargetId, entry: TabEntry<H>) {
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.push(id);
        }
    }

    /// Point the active marker at a known tab. Returns false for unknown ids.
    pub fn set_active(&mut self, id: &TargetId) -> bool {
        if self.entries.contains_key(id) {
            self.active = Some(id.clone());
            true
        } else {
            false
        }
    }

    pub fn active_id(&self) -> Option<&TargetId> {
        self.active.as_ref()
    }

    /// Cloned view of the active tab, safe to use outside the registry lock.
    pub fn active(&self) -> Option<(TargetId, TabEntry<H>)> {
        let id = self.active.clone()?;
        let entry = self.entries.get(&id)?.clone();
        Some((id, entry))
    }

    pub fn index_of(&self, id: &TargetId) -> Option<usize> {
        self.order.iter().position(|t| t == id)
    }

    pub fn at_index(&self, index: usize) -> Option<TargetId> {
        self.order.get(index).cloned()
    }

    pub fn known_ids(&self) -> HashSet<TargetId> {
        self.entries.keys().cloned().collect()
    }

    /// Remove a tab, cancelling its lifetime token. The caller must repoint
    /// `active` when it removed the active tab.
    pub fn remove(&mut self, id: &TargetId) -> Option<TabEntry<H>> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|t| t != id);
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
        entry.lifetime.cancel();
        Some(entry)
    }

    /// Swap `old` for a replacement tab at the same order position and make
    /// the replacement active. Used by recovery, where the browser destroyed
    /// `old` and created a successor.
    ///
    /// Returns the displaced entries (the dead one, plus the replacement's
    /// previous entry when it was already registered) so the caller can
    /// release their connections. Lifetimes of displaced entries are
    /// cancelled here.
    pub fn replace(
        &mut self,
        old: &TargetId,
        new_id: TargetId,
        entry: TabEntry<H>,
    ) -> Vec<TabEntry<H>> {
        let mut displaced = Vec::new();

        if new_id != *old {
            if let Some(prev) = self.entries.remove(&new_id) {
                self.order.retain(|t| t != &new_id);
                prev.lifetime.cancel();
                displaced.push(prev);
            }
        }

        if let Some(dead) = self.entries.remove(old) {
            dead.lifetime.cancel();
            displaced.push(dead);
        }

        match self.order.iter().position(|t| t == old) {
            Some(idx) => self.order[idx] = new_id.clone(),
            None => self.order.push(new_id.clone()),
        }
        self.entries.insert(new_id.clone(), entry);
        self.active = Some(new_id);

        displaced
    }
}

impl<H> Default for TabRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
