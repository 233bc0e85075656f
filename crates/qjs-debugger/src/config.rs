use std::env;

use tracing::warn;

pub const ENV_CONNECT_ADDRESS: &str = "QUICKJS_DEBUG_ADDRESS";
pub const ENV_LISTEN_ADDRESS: &str = "QUICKJS_DEBUG_LISTEN_ADDRESS";
pub const ENV_PEEK_INTERVAL: &str = "QUICKJS_DEBUG_PEEK_INTERVAL";
pub const ENV_STOP_ON_EXCEPTION: &str = "QUICKJS_DEBUG_STOP_ON_EXCEPTION";

const DEFAULT_PEEK_INTERVAL: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerConfig {
    /// `host:port` of a debugger client to dial.
    pub connect_address: Option<String>,
    /// `host:port` to wait on for a debugger client.
    pub listen_address: Option<String>,
    /// Number of `cooperate` calls between two non-blocking polls.
    pub peek_interval: u32,
    /// Initial value of the exception-breakpoint flag for new sessions.
    pub stop_on_exception: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            connect_address: None,
            listen_address: None,
            peek_interval: DEFAULT_PEEK_INTERVAL,
            stop_on_exception: false,
        }
    }
}

impl DebuggerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(address) = lookup(ENV_CONNECT_ADDRESS).filter(|s| !s.trim().is_empty()) {
            config.connect_address = Some(address.trim().to_string());
        }

        if let Some(address) = lookup(ENV_LISTEN_ADDRESS).filter(|s| !s.trim().is_empty()) {
            config.listen_address = Some(address.trim().to_string());
        }

        if let Some(interval) = lookup(ENV_PEEK_INTERVAL) {
            match interval.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.peek_interval = n,
                _ => warn!(
                    value = %interval,
                    default = config.peek_interval,
                    "Invalid {ENV_PEEK_INTERVAL} value, using default"
                ),
            }
        }

        if let Some(flag) = lookup(ENV_STOP_ON_EXCEPTION) {
            match flag.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.stop_on_exception = true,
                "0" | "false" | "no" | "off" | "" => config.stop_on_exception = false,
                _ => warn!(
                    value = %flag,
                    "Invalid {ENV_STOP_ON_EXCEPTION} value, exception breakpoints stay off"
                ),
            }
        }

        config
    }

    /// Peek interval clamped to at least one tick.
    pub fn effective_peek_interval(&self) -> u32 {
        self.peek_interval.max(1)
    }
}
