use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_PEERS: usize = 8;
pub const DEFAULT_RECONCILE_DEBOUNCE: Duration = Duration::from_millis(150);
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_BUFFERED_HIGH_WATER: usize = 1024 * 1024;
pub const DEFAULT_BUFFERED_LOW_WATER: usize = 256 * 1024;
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PLAINTEXT_CHARS: usize = 3000;
pub const DEFAULT_MAX_WIRE_CHARS: usize = 5000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 200_000;
pub const DEFAULT_MAX_BULK_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const MIN_CHUNK_BYTES: usize = 1024;
const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Every tunable of a mesh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Upper bound on live plus in-flight peer sessions.
    pub max_peers: usize,
    /// Membership snapshots arriving within this window collapse into one reconcile.
    pub reconcile_debounce: Duration,
    pub chunk_bytes: usize,
    /// Sending pauses while a channel buffers more than this.
    pub buffered_high_water: usize,
    /// Threshold at which a channel signals buffered-amount-low.
    pub buffered_low_water: usize,
    /// Upper bound on a single backpressure wait before sending anyway.
    pub backpressure_timeout: Duration,
    pub max_plaintext_chars: usize,
    pub max_wire_chars: usize,
    pub kdf_iterations: u32,
    /// Accepted MIME prefixes for bulk transfers; empty accepts everything.
    pub bulk_mime_prefixes: Vec<String>,
    pub max_bulk_bytes: usize,
    pub ice_servers: Vec<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            reconcile_debounce: DEFAULT_RECONCILE_DEBOUNCE,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            buffered_high_water: DEFAULT_BUFFERED_HIGH_WATER,
            buffered_low_water: DEFAULT_BUFFERED_LOW_WATER,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            max_plaintext_chars: DEFAULT_MAX_PLAINTEXT_CHARS,
            max_wire_chars: DEFAULT_MAX_WIRE_CHARS,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            bulk_mime_prefixes: vec!["image/".to_string()],
            max_bulk_bytes: DEFAULT_MAX_BULK_BYTES,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl MeshConfig {
    /// Defaults overlaid with `PARLEY_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let chunk_bytes = parse_usize_env("PARLEY_CHUNK_BYTES", defaults.chunk_bytes, MIN_CHUNK_BYTES)
            .min(MAX_CHUNK_BYTES);
        Self {
            max_peers: parse_usize_env("PARLEY_MAX_PEERS", defaults.max_peers, 1),
            reconcile_debounce: Duration::from_millis(parse_usize_env(
                "PARLEY_RECONCILE_DEBOUNCE_MS",
                defaults.reconcile_debounce.as_millis() as usize,
                0,
            ) as u64),
            chunk_bytes,
            buffered_high_water: parse_usize_env(
                "PARLEY_BUFFERED_HIGH_WATER",
                defaults.buffered_high_water,
                chunk_bytes,
            ),
            buffered_low_water: parse_usize_env(
                "PARLEY_BUFFERED_LOW_WATER",
                defaults.buffered_low_water,
                0,
            ),
            backpressure_timeout: Duration::from_millis(parse_usize_env(
                "PARLEY_BACKPRESSURE_TIMEOUT_MS",
                defaults.backpressure_timeout.as_millis() as usize,
                1,
            ) as u64),
            max_plaintext_chars: parse_usize_env(
                "PARLEY_MAX_MESSAGE_CHARS",
                defaults.max_plaintext_chars,
                1,
            ),
            max_wire_chars: parse_usize_env("PARLEY_MAX_WIRE_CHARS", defaults.max_wire_chars, 64),
            kdf_iterations: parse_usize_env(
                "PARLEY_KDF_ITERATIONS",
                defaults.kdf_iterations as usize,
                1,
            )
            .min(u32::MAX as usize) as u32,
            bulk_mime_prefixes: parse_list_env("PARLEY_BULK_MIME_PREFIXES")
                .unwrap_or(defaults.bulk_mime_prefixes),
            max_bulk_bytes: parse_usize_env("PARLEY_MAX_BULK_BYTES", defaults.max_bulk_bytes, 1),
            ice_servers: parse_list_env("PARLEY_ICE_SERVERS").unwrap_or(defaults.ice_servers),
        }
    }

    pub fn accepts_mime(&self, mime: &str) -> bool {
        self.bulk_mime_prefixes.is_empty()
            || self
                .bulk_mime_prefixes
                .iter()
                .any(|prefix| mime.starts_with(prefix.as_str()))
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target: "parley::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target: "parley::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Comma separated list; an explicitly empty variable yields an empty list.
fn parse_list_env(var: &str) -> Option<Vec<String>> {
    let value = env::var(var).ok()?;
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_documented_limits() {
        let config = MeshConfig::default();
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.max_wire_chars, 5000);
        assert_eq!(config.kdf_iterations, 200_000);
        assert!(config.accepts_mime("image/png"));
        assert!(!config.accepts_mime("application/pdf"));
    }

    #[test]
    fn empty_prefix_list_accepts_everything() {
        let config = MeshConfig {
            bulk_mime_prefixes: Vec::new(),
            ..MeshConfig::default()
        };
        assert!(config.accepts_mime("application/pdf"));
    }

    #[test]
    fn env_overrides_and_rejects_bad_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("PARLEY_MAX_PEERS", "3");
            env::set_var("PARLEY_CHUNK_BYTES", "12");
            env::set_var("PARLEY_BULK_MIME_PREFIXES", "image/, video/");
        }
        let config = MeshConfig::from_env();
        assert_eq!(config.max_peers, 3);
        assert_eq!(config.chunk_bytes, DEFAULT_CHUNK_BYTES);
        assert_eq!(config.bulk_mime_prefixes, vec!["image/", "video/"]);
        unsafe {
            env::remove_var("PARLEY_MAX_PEERS");
            env::remove_var("PARLEY_CHUNK_BYTES");
            env::remove_var("PARLEY_BULK_MIME_PREFIXES");
        }
    }
}
