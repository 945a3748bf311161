//! Configuration for an [`crate::OrbitDb`] instance.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use config::{Environment, File, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the optional config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "orbit.config.toml";

/// Prefix of environment variables overriding config fields.
///
/// For example, `ORBIT_MAX_IN_FLIGHT=4` sets [`Config::max_in_flight`].
pub const ENV_PREFIX: &str = "ORBIT";

/// Runtime configuration.
#[derive(PartialEq, Eq, Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Root directory for the local state of every database.
    pub directory: PathBuf,
    /// Fetch at most this many entries when loading or joining. Unbounded if unset.
    pub load_depth: Option<usize>,
    /// Concurrent content store fetches per join.
    pub max_in_flight: usize,
    /// Number of announced heads remembered by each replicator.
    pub seen_capacity: usize,
    /// Milliseconds after which a remembered head is forgotten.
    pub seen_ttl_ms: u64,
    /// Milliseconds between checks of the subscribed peers.
    pub peer_poll_interval_ms: u64,
    /// Capacity of each database's notification channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./orbitdb"),
            load_depth: None,
            max_in_flight: 16,
            seen_capacity: 1024,
            seen_ttl_ms: 60_000,
            peer_poll_interval_ms: 250,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Make a config from [`CONFIG_FILE_NAME`] in the working directory and the default
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(
            &[Some(Path::new(CONFIG_FILE_NAME))],
            ENV_PREFIX,
            HashMap::<String, String>::new(),
        )
    }

    /// Make a config using a default, files, environment variables, and overrides.
    ///
    /// Later items in the *file_paths* slice will have a higher priority than earlier ones.
    /// Environment variables are expected to start with the *env_prefix*, fields are separated
    /// from the prefix by `_`.
    pub fn load<S, V>(
        file_paths: &[Option<&Path>],
        env_prefix: &str,
        overrides: HashMap<S, V>,
    ) -> Result<Config>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = config::Config::builder();

        for path in file_paths.iter().flatten() {
            if path.exists() {
                let p = path.to_str().ok_or_else(|| anyhow::anyhow!("empty path"))?;
                builder = builder.add_source(File::with_name(p));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        for (key, val) in overrides.into_iter() {
            builder = builder.set_override(key, val)?;
        }

        let cfg = builder.build()?;
        debug!("make_config:\n{:#?}\n", cfg);
        let cfg = cfg.try_deserialize()?;
        Ok(cfg)
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_millis(self.seen_ttl_ms)
    }

    pub fn peer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.peer_poll_interval_ms)
    }
}
