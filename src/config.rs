//! Configuration management for relaunch.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard},
    time::Duration,
};
use tracing::debug;

use crate::{
    constants::{DEFAULT_CONFIG_FILE, DEFAULT_KILL_TIMEOUT},
    error::ControlError,
    reset::Resettable,
    signals::RestartSignal,
};

/// Options controlling how the supervisor reacts to input and signals.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    /// Signal the supervisor itself uses to request restarts. The bridge listens
    /// for the other one.
    pub signal: RestartSignal,
    /// Token that triggers a restart when typed on stdin. `None` selects raw
    /// keystroke mode.
    pub restartable: Option<String>,
    /// Whether stdin is interpreted at all.
    pub stdin: bool,
    /// Whether the child inherits stdout. When false, `start` is followed by
    /// `readable`.
    pub stdout: bool,
    /// Shell commands bound to event names.
    pub events: BTreeMap<String, String>,
    /// Bound on the wait for kill confirmation, e.g. `500ms`, `10s`, `1m`.
    pub kill_timeout: Option<String>,
    /// Command line of the supervised process.
    pub exec: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            signal: RestartSignal::default(),
            restartable: Some("rs".to_string()),
            stdin: true,
            stdout: true,
            events: BTreeMap::new(),
            kill_timeout: None,
            exec: None,
        }
    }
}

impl Options {
    /// Restart token with surrounding whitespace removed; empty tokens count as unset.
    pub fn restart_token(&self) -> Option<&str> {
        self.restartable
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Resolved kill confirmation timeout.
    pub fn kill_timeout(&self) -> Result<Duration, ControlError> {
        match self.kill_timeout.as_deref() {
            Some(raw) => parse_duration(raw),
            None => Ok(DEFAULT_KILL_TIMEOUT),
        }
    }
}

/// Parses a duration in the format `<number>[ms|s|m|h]`; bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ControlError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ControlError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || ControlError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ControlError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ControlError::InvalidConfig(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ControlError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// Without an explicit path, `relaunch.yaml` in the current directory is used if it
/// exists; otherwise defaults apply.
pub fn load_config(config_path: Option<&Path>) -> Result<Options, ControlError> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                debug!("No {DEFAULT_CONFIG_FILE} found; using default options");
                return Ok(Options::default());
            }
            fallback
        }
    };

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ControlError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let options: Options =
        serde_yaml::from_str(&expanded).map_err(ControlError::ConfigParseError)?;
    options.kill_timeout()?;

    debug!("Loaded config from {}", config_path.display());
    Ok(options)
}

/// Caches the options loaded for the current run. Cleared on every reset.
#[derive(Debug, Default)]
pub struct ConfigStore {
    cached: RwLock<Option<Options>>,
}

impl ConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `options` as the active configuration.
    pub fn set(&self, options: Options) {
        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(options);
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Options>> {
        self.cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the active configuration, if one was loaded.
    pub fn get(&self) -> Option<Options> {
        self.read().clone()
    }

    /// Whether options are currently cached.
    pub fn is_loaded(&self) -> bool {
        self.read().is_some()
    }
}

impl Resettable for ConfigStore {
    fn reset(&self) {
        debug!("Clearing cached config");
        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}
