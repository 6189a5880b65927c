use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [relay]
//                    persist_dir = "received_files"
//
//   env var:         RELAY_RELAY__PERSIST_DIR=received_files   (double underscore = nesting)
//
//   CLI flag:        --persist-dir received_files
//
// The bare `PORT` env var is also honoured, as hosting platforms set it.

/// Default listen port when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8000;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Relay behaviour (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Per-connection outbound queue length before a recipient is dropped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Largest binary unit emitted when relaying a file body.
    #[serde(default = "default_relay_chunk_bytes")]
    pub relay_chunk_bytes: usize,
    /// Largest accepted declared file size (0 = unlimited).
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Forward completed files to the other clients.
    #[serde(default = "default_relay_files")]
    pub relay_files: bool,
    /// Store completed files here. Unset disables persistence.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
    /// Tell the other clients `Received file: <name>` after a file is stored.
    #[serde(default)]
    pub announce_files: bool,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            relay_chunk_bytes: default_relay_chunk_bytes(),
            max_file_bytes: default_max_file_bytes(),
            relay_files: default_relay_files(),
            persist_dir: None,
            announce_files: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_relay_chunk_bytes() -> usize {
    64 * 1024
}
fn default_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_relay_files() -> bool {
    true
}

/// Defaults layered under an optional TOML file. No environment.
fn file_layers(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Format, Serialized, Toml},
    };

    let figment = Figment::from(Serialized::defaults(FileConfig::default()));
    match config_path {
        Some(path) => figment.merge(Toml::file(path)),
        None => figment,
    }
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars → PORT.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_RELAY__RELAY_FILES=false`  →  `relay.relay_files = false`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::providers::Env;

    file_layers(config_path)
        .merge(Env::prefixed("RELAY_").split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the relay)
// =============================================================================

/// Resolved relay configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    pub outbound_queue_capacity: usize,
    pub relay_chunk_bytes: usize,
    /// `None` = no limit
    pub max_file_bytes: Option<u64>,
    pub relay_files: bool,
    pub persist_dir: Option<PathBuf>,
    pub announce_files: bool,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            // tokio's mpsc rejects a zero capacity
            outbound_queue_capacity: fc.outbound_queue_capacity.max(1),
            relay_chunk_bytes: fc.relay_chunk_bytes.max(1),
            max_file_bytes: if fc.max_file_bytes == 0 {
                None
            } else {
                Some(fc.max_file_bytes)
            },
            relay_files: fc.relay_files,
            persist_dir: fc.persist_dir.clone(),
            announce_files: fc.announce_files,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let sc = ServerFileConfig::default();
        assert_eq!(sc.host, "127.0.0.1");
        assert_eq!(sc.port, 8000);
    }

    #[test]
    fn test_relay_file_config_defaults() {
        let rc = RelayFileConfig::default();
        assert_eq!(rc.outbound_queue_capacity, 256);
        assert_eq!(rc.relay_chunk_bytes, 65536);
        assert_eq!(rc.max_file_bytes, 64 * 1024 * 1024);
        assert!(rc.relay_files);
        assert!(rc.persist_dir.is_none());
        assert!(!rc.announce_files);
    }

    // ── RelayConfig::from_file ──────────────────────────────────────────

    #[test]
    fn test_relay_config_zero_limit_disables() {
        let fc = RelayFileConfig {
            max_file_bytes: 0,
            ..Default::default()
        };
        assert_eq!(RelayConfig::from_file(&fc).max_file_bytes, None);
    }

    #[test]
    fn test_relay_config_clamps_zero_sizes() {
        let fc = RelayFileConfig {
            outbound_queue_capacity: 0,
            relay_chunk_bytes: 0,
            ..Default::default()
        };
        let rc = RelayConfig::from_file(&fc);
        assert_eq!(rc.outbound_queue_capacity, 1);
        assert_eq!(rc.relay_chunk_bytes, 1);
    }

    #[test]
    fn test_relay_config_default_limit() {
        assert_eq!(
            RelayConfig::default().max_file_bytes,
            Some(64 * 1024 * 1024)
        );
    }

    // ── figment layering ────────────────────────────────────────────────

    #[test]
    fn test_file_layers_defaults() {
        let fc: FileConfig = file_layers(None).extract().unwrap();
        assert_eq!(fc.server.port, DEFAULT_PORT);
        assert!(fc.relay.relay_files);
    }

    #[test]
    fn test_file_layers_missing_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = file_layers(Some(&tmp.path().join("nope.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
    }

    #[test]
    fn test_file_layers_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"0.0.0.0\"\nport = 9100\n\n[relay]\nrelay_files = false\npersist_dir = \"inbox\"\nannounce_files = true\n",
        )
        .unwrap();
        let fc: FileConfig = file_layers(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.host, "0.0.0.0");
        assert_eq!(fc.server.port, 9100);
        assert!(!fc.relay.relay_files);
        assert_eq!(fc.relay.persist_dir, Some(PathBuf::from("inbox")));
        assert!(fc.relay.announce_files);
        // untouched keys keep their defaults
        assert_eq!(fc.relay.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_load_config_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("relay.toml", "[server]\nport = 9100\n")?;
            jail.set_env("RELAY_RELAY__OUTBOUND_QUEUE_CAPACITY", "32");
            jail.set_env("RELAY_SERVER__PORT", "9200");

            let fc: FileConfig = load_config(Some(Path::new("relay.toml"))).extract()?;
            assert_eq!(fc.server.port, 9200);
            assert_eq!(fc.relay.outbound_queue_capacity, 32);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_bare_port_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("PORT", "10000");
            let fc: FileConfig = load_config(None).extract()?;
            assert_eq!(fc.server.port, 10000);
            Ok(())
        });
    }
}
