//! Runtime configuration.

use std::time::Duration;

/// Default bound on the open handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Connector and worker loop settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connect_timeout: Duration,
    /// Unbound sessions the worker keeps in its idle pool.
    pub accept_backlog: usize,
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_backlog: 4,
            debug: false,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_accept_backlog(mut self, n: usize) -> Self {
        self.accept_backlog = n.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// User-facing scaffolding settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffdogConfig {
    /// Comma-separated candidate project directories, tried in order.
    pub project: String,
    /// Overwrite existing files without asking.
    pub force: bool,
    pub debug: bool,
}

impl Default for ScaffdogConfig {
    fn default() -> Self {
        Self {
            project: ".scaffdog".to_string(),
            force: false,
            debug: false,
        }
    }
}

impl ScaffdogConfig {
    /// Read `SCAFFDOG_PROJECT`, `SCAFFDOG_FORCE` and `SCAFFDOG_DEBUG`.
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            project: lookup("SCAFFDOG_PROJECT")
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults.project),
            force: lookup("SCAFFDOG_FORCE")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.force),
            debug: lookup("SCAFFDOG_DEBUG")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.debug),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
