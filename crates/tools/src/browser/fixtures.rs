//! In-memory driver and snapshotter doubles for engine tests.
//!
//! The fake driver records every command, supports scripted failures, and
//! counts in-flight calls so tests can assert the engine never overlaps
//! driver operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use tabwright_core::{BrowserConfig, Error, Result};

use super::driver::{Driver, TargetId, TargetInfo};
use super::session::BrowserSession;
use super::snapshot::{Snapshot, Snapshotter};

#[derive(Debug)]
pub struct FakeHandle {
    pub id: TargetId,
}

#[derive(Default)]
struct FakeState {
    next_target: u32,
    /// What `list_targets` reports; destroyed targets disappear from here.
    live: Vec<TargetInfo>,
    locations: HashMap<TargetId, String>,
    released: Vec<TargetId>,
    launches: usize,
    navigations: Vec<(TargetId, String)>,
    clicks: Vec<(TargetId, u32)>,
    typed: Vec<(TargetId, u32, String)>,
    evaluated: Vec<String>,
    fail_launch: bool,
    fail_navigate: usize,
    /// One-shot navigate rejection that is the caller's fault, not the
    /// target's (classified as validation, not target loss).
    reject_navigate: Option<String>,
    fail_wait_ready: usize,
    page_text: HashMap<String, String>,
    open_on_click: Option<(TargetId, String)>,
}

pub struct FakeDriver {
    state: Mutex<FakeState>,
    new_targets: broadcast::Sender<TargetInfo>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    op_delay: Duration,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Self::with_op_delay(Duration::ZERO)
    }

    /// A non-zero delay keeps each driver call in flight long enough for
    /// overlap to be observable.
    pub fn with_op_delay(op_delay: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            new_targets: tx,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            op_delay,
        })
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.op_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.op_delay).await;
        }
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    // ─── Scripting ───

    pub fn set_fail_launch(&self, fail: bool) {
        self.state.lock().unwrap().fail_launch = fail;
    }

    /// Fail the next `n` navigate calls.
    pub fn set_fail_navigate(&self, n: usize) {
        self.state.lock().unwrap().fail_navigate = n;
    }

    /// Reject the next navigate call with a validation error.
    pub fn set_reject_navigate(&self, msg: &str) {
        self.state.lock().unwrap().reject_navigate = Some(msg.to_string());
    }

    pub fn set_fail_wait_ready(&self, n: usize) {
        self.state.lock().unwrap().fail_wait_ready = n;
    }

    pub fn set_page_text(&self, url: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .page_text
            .insert(url.to_string(), text.to_string());
    }

    /// Script the next click to open a new page target.
    pub fn set_open_on_click(&self, id: &str, url: &str) {
        self.state.lock().unwrap().open_on_click = Some((TargetId::new(id), url.to_string()));
    }

    /// Simulate the browser silently destroying a target.
    pub fn destroy_target(&self, id: &TargetId) {
        let mut st = self.state.lock().unwrap();
        st.live.retain(|t| &t.id != id);
        st.locations.remove(id);
    }

    /// Simulate the browser creating a target on its own.
    pub fn spawn_target(&self, id: &str, url: &str) -> TargetId {
        let id = TargetId::new(id);
        let mut st = self.state.lock().unwrap();
        st.live.push(TargetInfo {
            id: id.clone(),
            kind: "page".into(),
            url: url.to_string(),
        });
        st.locations.insert(id.clone(), url.to_string());
        id
    }

    // ─── Inspection ───

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }

    pub fn navigations(&self) -> Vec<(TargetId, String)> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn clicks(&self) -> Vec<(TargetId, u32)> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn typed(&self) -> Vec<(TargetId, u32, String)> {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.state.lock().unwrap().evaluated.clone()
    }

    pub fn released(&self) -> Vec<TargetId> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn was_released(&self, id: &TargetId) -> bool {
        self.state.lock().unwrap().released.contains(id)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    type Handle = FakeHandle;

    async fn launch(&self, _config: &BrowserConfig) -> Result<()> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            st.launches += 1;
            if st.fail_launch {
                Err(Error::Driver("browser process refused to start".into()))
            } else {
                Ok(())
            }
        };
        self.exit();
        res
    }

    async fn connect(&self, target: Option<&TargetId>) -> Result<(TargetId, FakeHandle)> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            match target {
                Some(id) => {
                    if st.live.iter().any(|t| &t.id == id) {
                        Ok((id.clone(), FakeHandle { id: id.clone() }))
                    } else {
                        Err(Error::Driver(format!("no such target: {}", id)))
                    }
                }
                None => {
                    st.next_target += 1;
                    let id = TargetId::new(format!("tab-{}", st.next_target));
                    st.live.push(TargetInfo {
                        id: id.clone(),
                        kind: "page".into(),
                        url: "about:blank".into(),
                    });
                    st.locations.insert(id.clone(), "about:blank".into());
                    Ok((id.clone(), FakeHandle { id }))
                }
            }
        };
        self.exit();
        res
    }

    async fn release(&self, handle: &FakeHandle) -> Result<()> {
        self.enter().await;
        {
            let mut st = self.state.lock().unwrap();
            st.live.retain(|t| t.id != handle.id);
            st.locations.remove(&handle.id);
            st.released.push(handle.id.clone());
        }
        self.exit();
        Ok(())
    }

    async fn navigate(&self, handle: &FakeHandle, url: &str) -> Result<()> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            if let Some(msg) = st.reject_navigate.take() {
                Err(Error::Validation(msg))
            } else if st.fail_navigate > 0 {
                st.fail_navigate -= 1;
                Err(Error::Driver("net::ERR_ABORTED".into()))
            } else if !st.locations.contains_key(&handle.id) {
                Err(Error::Driver(format!("target {} closed", handle.id)))
            } else {
                st.navigations.push((handle.id.clone(), url.to_string()));
                st.locations.insert(handle.id.clone(), url.to_string());
                if let Some(t) = st.live.iter_mut().find(|t| t.id == handle.id) {
                    t.url = url.to_string();
                }
                Ok(())
            }
        };
        self.exit();
        res
    }

    async fn wait_ready(&self, handle: &FakeHandle) -> Result<()> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            if st.fail_wait_ready > 0 {
                st.fail_wait_ready -= 1;
                Err(Error::Driver("context canceled".into()))
            } else if !st.locations.contains_key(&handle.id) {
                Err(Error::Driver(format!("target {} closed", handle.id)))
            } else {
                Ok(())
            }
        };
        self.exit();
        res
    }

    async fn evaluate(&self, handle: &FakeHandle, js: &str) -> Result<Value> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            st.evaluated.push(js.to_string());
            match st.locations.get(&handle.id) {
                None => Err(Error::Driver(format!("target {} closed", handle.id))),
                Some(url) if js.contains("innerText") => {
                    let text = st.page_text.get(url).cloned().unwrap_or_default();
                    Ok(Value::String(text))
                }
                Some(_) => Ok(Value::Null),
            }
        };
        self.exit();
        res
    }

    async fn location(&self, handle: &FakeHandle) -> Result<String> {
        self.enter().await;
        let res = {
            let st = self.state.lock().unwrap();
            st.locations
                .get(&handle.id)
                .cloned()
                .ok_or_else(|| Error::Driver(format!("target {} closed", handle.id)))
        };
        self.exit();
        res
    }

    async fn click_ref(&self, handle: &FakeHandle, ref_no: u32) -> Result<()> {
        self.enter().await;
        let opened = {
            let mut st = self.state.lock().unwrap();
            if !st.locations.contains_key(&handle.id) {
                self.exit();
                return Err(Error::Driver(format!("target {} closed", handle.id)));
            }
            st.clicks.push((handle.id.clone(), ref_no));
            if let Some((id, url)) = st.open_on_click.take() {
                st.live.push(TargetInfo {
                    id: id.clone(),
                    kind: "page".into(),
                    url: url.clone(),
                });
                st.locations.insert(id.clone(), url.clone());
                Some(TargetInfo {
                    id,
                    kind: "page".into(),
                    url,
                })
            } else {
                None
            }
        };
        if let Some(info) = opened {
            let _ = self.new_targets.send(info);
        }
        self.exit();
        Ok(())
    }

    async fn type_ref(&self, handle: &FakeHandle, ref_no: u32, text: &str) -> Result<()> {
        self.enter().await;
        let res = {
            let mut st = self.state.lock().unwrap();
            if !st.locations.contains_key(&handle.id) {
                Err(Error::Driver(format!("target {} closed", handle.id)))
            } else {
                st.typed.push((handle.id.clone(), ref_no, text.to_string()));
                Ok(())
            }
        };
        self.exit();
        res
    }

    async fn list_targets(&self, _control: &FakeHandle) -> Result<Vec<TargetInfo>> {
        self.enter().await;
        let res = Ok(self.state.lock().unwrap().live.clone());
        self.exit();
        res
    }

    fn watch_new_targets(&self, _control: &FakeHandle) -> broadcast::Receiver<TargetInfo> {
        self.new_targets.subscribe()
    }

    async fn settle(&self, _handle: &FakeHandle, _duration: Duration) -> Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

pub struct FakeSnapshotter {
    state: Mutex<SnapshotterState>,
}

struct SnapshotterState {
    next: Snapshot,
    fail_next: usize,
}

impl FakeSnapshotter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SnapshotterState {
                next: Snapshot {
                    text: "- document".into(),
                    ..Default::default()
                },
                fail_next: 0,
            }),
        })
    }

    pub fn set_next(&self, snapshot: Snapshot) {
        self.state.lock().unwrap().next = snapshot;
    }

    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }
}

#[async_trait]
impl Snapshotter<FakeHandle> for FakeSnapshotter {
    async fn take_snapshot(&self, _handle: &FakeHandle) -> Result<Snapshot> {
        let mut st = self.state.lock().unwrap();
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(Error::Driver("snapshot capture failed".into()));
        }
        Ok(st.next.clone())
    }
}

pub fn snapshot_with_refs(text: &str, max_ref: u32, hrefs: &[(u32, &str)]) -> Snapshot {
    Snapshot {
        text: text.to_string(),
        has_refs: true,
        max_ref,
        ref_hrefs: hrefs.iter().map(|(r, h)| (*r, h.to_string())).collect(),
    }
}

/// Fresh, not-yet-started session wired to fakes.
pub fn session_fixture() -> (
    Arc<FakeDriver>,
    Arc<FakeSnapshotter>,
    Arc<BrowserSession<FakeDriver>>,
) {
    let driver = FakeDriver::new();
    let snapshotter = FakeSnapshotter::new();
    let session = Arc::new(BrowserSession::new(
        driver.clone(),
        snapshotter.clone(),
        BrowserConfig::default(),
    ));
    (driver, snapshotter, session)
}
