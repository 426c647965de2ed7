//! BrowseTool: the browser action surface exposed to the LLM.
//!
//! Every page-changing action returns a fresh snapshot so the model always
//! acts on current refs. Dispatch runs under the session's operation lock
//! with a per-call deadline; handlers deal with target loss by delegating
//! to the session's recovery protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use tabwright_core::{Error, Result};

use crate::{truncate_text, Tool, ToolContext, ToolSchema};

use super::driver::{Driver, TargetInfo};
use super::session::BrowserSession;
use super::tabs::TabEntry;

const BROWSER_TOOL_DESCRIPTION: &str = "\
Interact with a web browser to perform navigation, element interaction, content extraction, and tab management.

Every action that changes the page automatically returns a page snapshot - a compact, structured text representation of the current page with numbered ref IDs for interactive elements.

Navigation:
- 'go_to_url': Navigate to a URL. Returns page snapshot.
- 'web_search': Search a query via DuckDuckGo. Returns search results page snapshot.
Snapshot:
- 'snapshot': Get the current page snapshot without performing any action.
Element Interaction (use ref number from the snapshot):
- 'click': Click an element by its ref number. Returns updated snapshot.
- 'type': Clear a field and type text into it by ref number. Returns updated snapshot.
- 'scroll_down'/'scroll_up': Scroll the page (optional pixel amount). Returns updated snapshot.
Content Extraction:
- 'extract_content': Extract and summarize page content based on a goal.
Tab Management:
- 'switch_tab': Switch to a tab by index (0-based).
- 'open_tab': Open a new tab with a URL.
- 'close_tab': Close the current tab.
Utility:
- 'wait': Wait for a specified number of seconds.";

const PAGE_TEXT_JS: &str =
    "document.body && document.body.innerText ? document.body.innerText : ''";

const SCROLL_DEFAULT_PX: i64 = 500;
/// Page text cap when handing content to the extractor.
const EXTRACT_INPUT_MAX: usize = 6000;
/// Page text cap for the raw fallback.
const RAW_TEXT_MAX: usize = 4000;

/// Distills page text toward a goal, typically backed by a chat model.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, goal: &str, content: &str) -> Result<String>;
}

pub struct BrowseTool<D: Driver> {
    session: Arc<BrowserSession<D>>,
    extractor: Option<Arc<dyn ContentExtractor>>,
}

impl<D: Driver> BrowseTool<D> {
    pub fn new(session: Arc<BrowserSession<D>>) -> Self {
        Self {
            session,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Run one action end to end: lazy startup, then dispatch under the
    /// session's operation lock, bounded by the caller's deadline.
    pub async fn invoke(&self, action: &str, args: &Value, ctx: &ToolContext) -> Result<String> {
        self.session.ensure_started().await?;
        let action = action.trim().to_lowercase();
        self.session.run_op(ctx, self.dispatch(&action, args)).await
    }

    async fn dispatch(&self, action: &str, args: &Value) -> Result<String> {
        match action {
            "snapshot" => self.action_snapshot().await,
            "go_to_url" => {
                let url = args["url"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        Error::Validation("url is required for go_to_url action".into())
                    })?;
                self.action_go_to_url(url).await
            }
            "click" => self.action_click(ref_arg(args)).await,
            "type" => {
                let text = args["text"].as_str().unwrap_or_default().to_string();
                self.action_type(ref_arg(args), &text).await
            }
            "scroll_down" => self.action_scroll(args["scroll_amount"].as_i64(), true).await,
            "scroll_up" => self.action_scroll(args["scroll_amount"].as_i64(), false).await,
            "web_search" => {
                let query = args["query"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        Error::Validation("query is required for web_search action".into())
                    })?;
                self.action_web_search(query).await
            }
            "wait" => self.action_wait(args["seconds"].as_i64()).await,
            "extract_content" => self.action_extract_content(args["goal"].as_str()).await,
            "switch_tab" => {
                let index = args["tab_index"].as_i64().ok_or_else(|| {
                    Error::Validation("tab_index is required for switch_tab action".into())
                })?;
                self.action_switch_tab(index).await
            }
            "open_tab" => self.action_open_tab(args["url"].as_str()).await,
            "close_tab" => self.action_close_tab().await,
            other => Err(Error::Validation(format!("unknown action: {}", other))),
        }
    }

    // ─── Actions ───

    async fn action_snapshot(&self) -> Result<String> {
        let (_, tab) = self.session.active_tab().await?;
        self.session.capture_snapshot(&tab).await?;
        self.snapshot_with_url(&tab).await
    }

    async fn action_go_to_url(&self, url: &str) -> Result<String> {
        let session = &self.session;
        let (_, mut tab) = session.active_tab().await?;

        // Step 1: the navigate itself. A failure here may be a cross-origin
        // target swap, so recover once and retry. Caller errors (bad URL,
        // cancelled request) are not target loss and propagate as-is.
        if let Err(err) = session
            .on_tab(&tab, session.driver().navigate(&tab.handle, url))
            .await
        {
            if !err.is_target_loss() {
                return Err(err);
            }
            warn!(url, error = %err, "navigate failed, attempting recovery");
            let (_, recovered) = session.recover_active_target().await.map_err(|rec| {
                Error::RecoveryFailed(format!("navigation failed: {} (recovery: {})", err, rec))
            })?;
            tab = recovered;
            session
                .on_tab(&tab, session.driver().navigate(&tab.handle, url))
                .await
                .map_err(|err2| {
                    Error::Driver(format!("navigation failed after recovery: {}", err2))
                })?;
        }

        // Step 2: wait for the page body. One recovery attempt, then take
        // whatever we have.
        if let Err(err) = session
            .on_tab(&tab, session.driver().wait_ready(&tab.handle))
            .await
        {
            if !err.is_target_loss() {
                return Err(err);
            }
            warn!(url, error = %err, "wait_ready after navigate failed, attempting recovery");
            match session.recover_active_target().await {
                Ok((_, recovered)) => {
                    tab = recovered;
                    let _ = session
                        .on_tab(&tab, session.driver().wait_ready(&tab.handle))
                        .await;
                }
                Err(rec) => {
                    warn!(error = %rec, "recovery after navigate wait_ready failed");
                }
            }
        }

        // Step 3: brief extra wait for dynamic content.
        let _ = session
            .driver()
            .settle(&tab.handle, Duration::from_millis(500))
            .await;

        if let Err(err) = session.capture_snapshot(&tab).await {
            return Ok(format!("Navigated to {} but snapshot failed: {}", url, err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_click(&self, ref_no: i64) -> Result<String> {
        let session = &self.session;

        // Link refs resolve as navigations: a same-tab link click can trigger
        // a cross-origin process swap that destroys the target mid-click.
        if let Some(href) = session.resolve_ref(ref_no).await? {
            debug!(ref_no, href = %href, "ref has href, navigating instead of clicking");
            return self.action_go_to_url(&href).await;
        }
        // In range, so it fits the driver's ref type.
        let ref_no = ref_no as u32;

        let (_, tab) = session.active_tab().await?;

        // URL before the click, to size the settle delay afterwards.
        let url_before = session
            .driver()
            .location(&tab.handle)
            .await
            .unwrap_or_default();

        // Subscribe before clicking so a fast popup is not missed.
        let control = session.control_handle().await?;
        let mut new_targets = session.driver().watch_new_targets(&control);

        session
            .on_tab(&tab, session.driver().click_ref(&tab.handle, ref_no))
            .await
            .map_err(|e| Error::Driver(format!("click failed: {}", e)))?;

        // A click may legitimately open a new tab; adopt it when one shows up
        // within the watch window. Distinct from recovery: the original
        // target is still alive here.
        let window = Duration::from_millis(session.config().new_tab_wait_ms);
        let mut tab = match wait_for_new_page(&mut new_targets, window).await {
            Some(info) => {
                debug!(target = %info.id, "click opened a new tab, switching to it");
                match session.driver().connect(Some(&info.id)).await {
                    Ok((id, handle)) => session.adopt_tab(id, handle).await.1,
                    Err(e) => {
                        warn!(target = %info.id, "failed to attach to new tab: {}", e);
                        tab
                    }
                }
            }
            None => tab,
        };

        // The click may have navigated cross-origin and killed the target.
        if let Err(err) = session
            .on_tab(&tab, session.driver().wait_ready(&tab.handle))
            .await
        {
            if !err.is_target_loss() {
                return Err(err);
            }
            warn!(error = %err, "wait_ready after click failed, attempting target recovery");
            match session.recover_active_target().await {
                Ok((_, recovered)) => {
                    tab = recovered;
                    let _ = session
                        .on_tab(&tab, session.driver().wait_ready(&tab.handle))
                        .await;
                }
                Err(rec) => {
                    return Ok(format!(
                        "Clicked ref {} but page navigation caused target loss: {} (recovery: {})",
                        ref_no, err, rec
                    ));
                }
            }
        }

        // If the URL changed, give dynamic content extra time.
        let url_after = session
            .driver()
            .location(&tab.handle)
            .await
            .unwrap_or_default();
        let settle = if !url_after.is_empty() && url_after != url_before {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(200)
        };
        let _ = session.driver().settle(&tab.handle, settle).await;

        if let Err(err) = session.capture_snapshot(&tab).await {
            return Ok(format!("Clicked ref {} but snapshot failed: {}", ref_no, err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_type(&self, ref_no: i64, text: &str) -> Result<String> {
        let session = &self.session;
        // Range validation only; typing into a link ref is still typing.
        session.resolve_ref(ref_no).await?;
        let ref_no = ref_no as u32;

        let (_, tab) = session.active_tab().await?;
        session
            .on_tab(&tab, session.driver().type_ref(&tab.handle, ref_no, text))
            .await
            .map_err(|e| Error::Driver(format!("type failed: {}", e)))?;

        if let Err(err) = session.capture_snapshot(&tab).await {
            return Ok(format!("Typed into ref {} but snapshot failed: {}", ref_no, err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_scroll(&self, amount: Option<i64>, down: bool) -> Result<String> {
        let mut amount = amount.unwrap_or(SCROLL_DEFAULT_PX);
        if amount <= 0 {
            amount = SCROLL_DEFAULT_PX;
        }
        let signed = if down { amount } else { -amount };

        let session = &self.session;
        let (_, tab) = session.active_tab().await?;
        let js = format!("window.scrollBy(0, {})", signed);
        session
            .on_tab(&tab, session.driver().evaluate(&tab.handle, &js))
            .await
            .map_err(|e| Error::Driver(format!("scroll failed: {}", e)))?;

        let _ = session
            .driver()
            .settle(&tab.handle, Duration::from_millis(200))
            .await;

        if let Err(err) = session.capture_snapshot(&tab).await {
            return Ok(format!("Scrolled but snapshot failed: {}", err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_web_search(&self, query: &str) -> Result<String> {
        let search_url = format!("https://duckduckgo.com/?q={}", urlencoding::encode(query));
        self.action_go_to_url(&search_url).await
    }

    async fn action_wait(&self, seconds: Option<i64>) -> Result<String> {
        let seconds = seconds.unwrap_or(1).clamp(1, 30) as u64;
        tokio::time::sleep(Duration::from_secs(seconds)).await;

        let (_, tab) = self.session.active_tab().await?;
        if let Err(err) = self.session.capture_snapshot(&tab).await {
            return Ok(format!("Waited {} seconds but snapshot failed: {}", seconds, err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_extract_content(&self, goal: Option<&str>) -> Result<String> {
        let session = &self.session;
        let (_, tab) = session.active_tab().await?;

        let value = session
            .on_tab(&tab, session.driver().evaluate(&tab.handle, PAGE_TEXT_JS))
            .await
            .map_err(|e| Error::Driver(format!("failed to extract page text: {}", e)))?;
        let text = value.as_str().unwrap_or_default().to_string();

        if let (Some(extractor), Some(goal)) =
            (&self.extractor, goal.filter(|g| !g.trim().is_empty()))
        {
            let content = truncate_text(&text, EXTRACT_INPUT_MAX);
            return extractor
                .extract(goal, &content)
                .await
                .map_err(|e| Error::Tool(format!("extraction model failed: {}", e)));
        }

        Ok(truncate_text(&text, RAW_TEXT_MAX))
    }

    async fn action_switch_tab(&self, index: i64) -> Result<String> {
        if index < 0 {
            let have = self.session.tab_count().await;
            return Err(Error::Validation(format!(
                "tab index {} out of range (have {} tabs)",
                index, have
            )));
        }
        let (_, tab) = self.session.switch_to(index as usize).await?;

        if let Err(err) = self.session.capture_snapshot(&tab).await {
            return Ok(format!("Switched to tab {} but snapshot failed: {}", index, err));
        }
        let url = self
            .session
            .driver()
            .location(&tab.handle)
            .await
            .unwrap_or_default();
        let text = self.session.last_snapshot_text().await.unwrap_or_default();
        Ok(format!("Switched to tab {}\nURL: {}\n\n{}", index, url, text))
    }

    async fn action_open_tab(&self, url: Option<&str>) -> Result<String> {
        let url = url.filter(|u| !u.is_empty()).unwrap_or("about:blank");

        let session = &self.session;
        let (id, tab) = session.open_tab().await?;

        let setup = async {
            session.driver().navigate(&tab.handle, url).await?;
            session.driver().wait_ready(&tab.handle).await
        };
        if let Err(err) = session.on_tab(&tab, setup).await {
            // The tab never became usable; take it back out.
            session.discard_tab(&id).await;
            return Err(Error::Driver(format!("failed to open new tab: {}", err)));
        }

        if let Err(err) = session.capture_snapshot(&tab).await {
            return Ok(format!("Opened new tab with {} but snapshot failed: {}", url, err));
        }
        self.snapshot_with_url(&tab).await
    }

    async fn action_close_tab(&self) -> Result<String> {
        let (_, tab) = self.session.close_active_tab().await?;

        if self.session.capture_snapshot(&tab).await.is_err() {
            return Ok("Closed tab, switched to another tab but snapshot failed".into());
        }
        let url = self
            .session
            .driver()
            .location(&tab.handle)
            .await
            .unwrap_or_default();
        let text = self.session.last_snapshot_text().await.unwrap_or_default();
        Ok(format!("Closed tab. Now on:\nURL: {}\n\n{}", url, text))
    }

    async fn snapshot_with_url(&self, tab: &TabEntry<D::Handle>) -> Result<String> {
        let url = self
            .session
            .driver()
            .location(&tab.handle)
            .await
            .unwrap_or_default();
        match self.session.last_snapshot_text().await {
            Some(text) => Ok(format!("URL: {}\n\n{}", url, text)),
            None => Ok(format!("URL: {}\n\n(no snapshot)", url)),
        }
    }
}

/// The ref as supplied, so range validation can echo it back. A missing or
/// non-numeric ref falls through as 0, which fails range validation with
/// the standard message.
fn ref_arg(args: &Value) -> i64 {
    match &args["ref"] {
        Value::String(s) => s.trim().parse().unwrap_or(0),
        other => other.as_i64().unwrap_or(0),
    }
}

/// Wait up to `window` for a page target to be created.
async fn wait_for_new_page(
    rx: &mut broadcast::Receiver<TargetInfo>,
    window: Duration,
) -> Option<TargetInfo> {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(info)) if info.is_page() => return Some(info),
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

#[async_trait]
impl<D: Driver> Tool for BrowseTool<D> {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "browser",
            description: BROWSER_TOOL_DESCRIPTION,
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "snapshot", "go_to_url", "click", "type",
                            "scroll_down", "scroll_up", "web_search",
                            "wait", "extract_content", "switch_tab",
                            "open_tab", "close_tab"
                        ],
                        "description": "The browser action to perform"
                    },
                    "url": {
                        "type": "string",
                        "description": "URL for 'go_to_url' or 'open_tab' actions"
                    },
                    "ref": {
                        "type": "integer",
                        "description": "Element ref number from the snapshot for 'click' and 'type' actions"
                    },
                    "text": {
                        "type": "string",
                        "description": "Text to type for 'type' action"
                    },
                    "scroll_amount": {
                        "type": "integer",
                        "description": "Pixels to scroll (default 500) for 'scroll_down' or 'scroll_up'"
                    },
                    "tab_index": {
                        "type": "integer",
                        "description": "Tab index (0-based) for 'switch_tab' action"
                    },
                    "query": {
                        "type": "string",
                        "description": "Search query for 'web_search' action"
                    },
                    "goal": {
                        "type": "string",
                        "description": "Extraction goal for 'extract_content' action"
                    },
                    "seconds": {
                        "type": "integer",
                        "description": "Seconds to wait for 'wait' action"
                    }
                },
                "required": ["action"]
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let action = params.get("action").and_then(|v| v.as_str()).unwrap_or("");
        if action.trim().is_empty() {
            return Err(Error::Validation("action is required".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: ToolContext, params: Value) -> Result<Value> {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("action is required".into()))?
            .to_string();
        let text = self.invoke(&action, &params, &ctx).await?;
        Ok(json!({ "text": text }))
    }
}
