pub mod config;
pub mod error;

pub use config::BrowserConfig;
pub use error::{Error, Result};
