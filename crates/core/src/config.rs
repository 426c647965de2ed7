use serde::{Deserialize, Serialize};

/// Settings for a browser session. All knobs have working defaults so an
/// empty `{}` config is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Explicit browser binary; `None` lets the driver pick one.
    #[serde(default)]
    pub browser_path: Option<String>,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// Hard deadline for one tool call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// How long to watch for a click spawning a new tab, in milliseconds.
    #[serde(default = "default_new_tab_wait_ms")]
    pub new_tab_wait_ms: u64,
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    1024
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_new_tab_wait_ms() -> u64 {
    500
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            browser_path: None,
            window_width: default_window_width(),
            window_height: default_window_height(),
            call_timeout_secs: default_call_timeout_secs(),
            new_tab_wait_ms: default_new_tab_wait_ms(),
        }
    }
}
