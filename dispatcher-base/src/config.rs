//! A small `figment`-backed configuration loader shared by every binary in
//! this workspace, following the `ConfigLoader` / `HasConfigExamples`
//! pattern used throughout this codebase's service configs: a TOML file on
//! disk, overridable by environment variables, with every field defaulted
//! in code so a missing file is never fatal.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The environment-variable nesting separator, e.g. `DISPATCHER__POOL__MAX_CONNECTIONS`
/// sets `pool.max_connections`.
const ENV_NESTING_SEPARATOR: &str = "__";

/// Implemented by every top-level config struct so the loader can fall back
/// to `Default` and, in tests, assert the defaults round-trip through TOML.
pub trait HasConfigExamples: Default + Serialize + DeserializeOwned {
    /// A human-readable label used in log messages when this config is
    /// loaded or dumped, e.g. `"dispatcher"`.
    fn label() -> &'static str;
}

pub struct ConfigLoader<T> {
    config_file_name: PathBuf,
    env_prefix: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T: HasConfigExamples> ConfigLoader<T> {
    pub fn new(config_file_name: impl Into<PathBuf>, env_prefix: impl Into<String>) -> Self {
        Self {
            config_file_name: config_file_name.into(),
            env_prefix: env_prefix.into(),
            _marker: std::marker::PhantomData,
        }
    }

    fn figment(&self) -> Figment {
        Figment::from(figment::providers::Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(&self.env_prefix).split(ENV_NESTING_SEPARATOR))
    }

    /// Loads the config, falling back to code defaults for anything not
    /// present in the file or environment.
    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config unless invoked with `--dump-config`, in which case
    /// the resolved config is printed as TOML to stdout and `None` is
    /// returned so the caller can exit cleanly without starting the
    /// service.
    pub fn load_or_dump_config(&self) -> Option<figment::Result<T>> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            match self.load() {
                Ok(config) => {
                    let toml = toml::to_string_pretty(&config)
                        .unwrap_or_else(|e| format!("# failed to render config: {e}"));
                    println!("{toml}");
                }
                Err(err) => {
                    eprintln!("# failed to load {} config: {err}", T::label());
                }
            }
            None
        } else {
            Some(self.load())
        }
    }
}
