//! Tool configuration stored in `skyloop.toml`.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "skyloop.toml";

/// Locations of the external tools and how to run them.
///
/// Missing fields default to the standard Starlink layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    pub makemap: ToolCommand,

    pub paste: ToolCommand,

    /// Seconds to wait for one task before killing it. `0` waits indefinitely.
    pub timeout_secs: u64,

    /// Captured stdout/stderr per task is truncated beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Name pattern of the cleaned time-series files the first iteration exports.
    pub cleaned_pattern: String,

    /// Name pattern of the exported EXT model files.
    pub ext_pattern: String,
}

/// Program plus leading arguments. `$VAR` and `${VAR}` are expanded at run time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    pub command: Vec<String>,
}

impl ToolCommand {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// Expand environment variables in every word.
    pub fn resolve(&self) -> Result<Vec<String>> {
        self.command.iter().map(|word| expand_env(word)).collect()
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            makemap: ToolCommand::new(["$SMURF_DIR/makemap"]),
            paste: ToolCommand::new(["$KAPPA_DIR/paste"]),
            timeout_secs: 0,
            output_limit_bytes: 1_000_000,
            cleaned_pattern: "s*_con_res_cln.sdf".to_string(),
            ext_pattern: "s*_con_ext.sdf".to_string(),
        }
    }
}

impl ToolConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, tool) in [("makemap", &self.makemap), ("paste", &self.paste)] {
            if tool.command.is_empty() || tool.command[0].trim().is_empty() {
                return Err(anyhow!("{name}.command must be a non-empty array"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.cleaned_pattern.trim().is_empty() {
            return Err(anyhow!("cleaned_pattern must not be empty"));
        }
        if self.ext_pattern.trim().is_empty() {
            return Err(anyhow!("ext_pattern must not be empty"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ToolConfig::default()`.
pub fn load_config(path: &Path) -> Result<ToolConfig> {
    if !path.exists() {
        let cfg = ToolConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ToolConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// `$NAME` or `${NAME}`; the name lands in group 1 or group 2.
static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("valid environment reference regex")
});

/// Expand `$VAR` and `${VAR}` references. Unset variables are an error.
pub fn expand_env(word: &str) -> Result<String> {
    expand_with(word, |name| std::env::var(name).ok())
}

fn expand_with<F: Fn(&str) -> Option<String>>(word: &str, lookup: F) -> Result<String> {
    let mut missing = None;
    let expanded = ENV_REF.replace_all(word, |caps: &Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(anyhow!("environment variable {name} is not set (needed by {word:?})"));
    }
    Ok(expanded.into_owned())
}
