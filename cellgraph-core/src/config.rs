//! Store Configuration
//!
//! A store can be built from defaults, from code, or from a JSON document
//! (for example a test fixture or an application settings file).

use serde::Deserialize;

/// Settings for a [`Store`](crate::reactive::Store).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Optional name shown in the store's `Display` output and log events.
    pub name: Option<String>,

    /// Keep diagnostic bookkeeping (mounted-cell listing, flushed-cell
    /// reports). Defaults to on in debug builds.
    pub diagnostics: bool,

    /// Drive pending values on the ambient tokio runtime as soon as they are
    /// installed. When off, or when no runtime is present, pending values
    /// are driven by whoever awaits them.
    pub eager_async: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            diagnostics: cfg!(debug_assertions),
            eager_async: true,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    pub fn with_eager_async(mut self, enabled: bool) -> Self {
        self.eager_async = enabled;
        self
    }
}
