// BPDB - Blueprint Graph Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Debugger configuration
//!
//! Settings are read from TOML (by default `~/.bpdb.toml`). Every field has a
//! default, so a partial or missing file is fine. The debugger never writes
//! this file back.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use tracing::{debug, info};

/// File name looked up in the home directory.
pub const CONFIG_FILE_NAME: &str = ".bpdb.toml";

/// When the variable inspector shows an object's variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WhenToShowVariables {
    /// Only for objects living in a running world.
    #[default]
    OnlyWhenRunning,
    /// Always, including objects of an editor world.
    Always,
}

/// Which properties the variable inspector lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableVisibility {
    /// Public properties only.
    #[default]
    PublicOnly,
    /// Public and protected properties.
    PublicAndProtected,
}

/// Debugger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Minimum interval between two trace digests, in milliseconds.
    pub publish_interval_ms: u64,
    /// How long the most recently exited frame stays readable, in milliseconds.
    pub post_mortem_retention_ms: u64,
    /// When to show variables in the inspector.
    pub when_to_show_variables: WhenToShowVariables,
    /// Highlight inspector rows whose value just changed.
    pub highlight_changed_values: bool,
    /// How long a change highlight lasts, in milliseconds.
    pub highlight_duration_ms: u64,
    /// Show properties without a category.
    pub show_hidden_implementation_variables: bool,
    /// Property visibility filter.
    pub visibility: VariableVisibility,
    /// Maximum nesting level for struct expansion.
    pub max_struct_depth: usize,
    /// Capacity of the session event channel.
    pub event_channel_capacity: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 100,
            post_mortem_retention_ms: 2000,
            when_to_show_variables: WhenToShowVariables::default(),
            highlight_changed_values: true,
            highlight_duration_ms: 2000,
            show_hidden_implementation_variables: false,
            visibility: VariableVisibility::default(),
            max_struct_depth: 5,
            event_channel_capacity: 1024,
        }
    }
}

impl DebuggerConfig {
    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).wrap_err("Failed to parse debugger config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "Loaded debugger config");
        Ok(config)
    }

    /// Load settings from the default location, falling back to defaults if
    /// no file exists there.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `~/.bpdb.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    fn validate(&self) -> Result<()> {
        if self.publish_interval_ms == 0 {
            eyre::bail!("publish_interval_ms must be positive");
        }
        if self.event_channel_capacity == 0 {
            eyre::bail!("event_channel_capacity must be positive");
        }
        Ok(())
    }

    /// Publish interval as a duration.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    /// Post-mortem retention as a duration.
    pub fn post_mortem_retention(&self) -> Duration {
        Duration::from_millis(self.post_mortem_retention_ms)
    }

    /// Highlight duration as a duration.
    pub fn highlight_duration(&self) -> Duration {
        Duration::from_millis(self.highlight_duration_ms)
    }

    /// Set the publish interval.
    pub fn with_publish_interval_ms(mut self, ms: u64) -> Self {
        self.publish_interval_ms = ms;
        self
    }

    /// Set the post-mortem retention.
    pub fn with_post_mortem_retention_ms(mut self, ms: u64) -> Self {
        self.post_mortem_retention_ms = ms;
        self
    }

    /// Set when variables are shown.
    pub fn with_when_to_show_variables(mut self, when: WhenToShowVariables) -> Self {
        self.when_to_show_variables = when;
        self
    }

    /// Show or hide uncategorized properties.
    pub fn with_hidden_implementation_variables(mut self, show: bool) -> Self {
        self.show_hidden_implementation_variables = show;
        self
    }

    /// Set the visibility filter.
    pub fn with_visibility(mut self, visibility: VariableVisibility) -> Self {
        self.visibility = visibility;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DebuggerConfig::default();
        assert_eq!(config.publish_interval(), Duration::from_millis(100));
        assert_eq!(config.max_struct_depth, 5);
        assert!(config.highlight_changed_values);
        assert_eq!(config.when_to_show_variables, WhenToShowVariables::OnlyWhenRunning);
        assert_eq!(config.visibility, VariableVisibility::PublicOnly);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DebuggerConfig::from_toml_str(
            r#"
            publish_interval_ms = 250
            visibility = "public_and_protected"
            when_to_show_variables = "always"
            "#,
        )
        .unwrap();
        assert_eq!(config.publish_interval_ms, 250);
        assert_eq!(config.visibility, VariableVisibility::PublicAndProtected);
        assert_eq!(config.when_to_show_variables, WhenToShowVariables::Always);
        assert_eq!(config.post_mortem_retention_ms, 2000);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(DebuggerConfig::from_toml_str("visibility = \"everyone\"").is_err());
        assert!(DebuggerConfig::from_toml_str("publish_interval_ms = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_struct_depth = 2").unwrap();
        let config = DebuggerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_struct_depth, 2);
        assert!(DebuggerConfig::load_from("/nonexistent/bpdb.toml").is_err());
    }

    #[test]
    fn test_default_path_points_at_home() {
        if let Some(path) = DebuggerConfig::default_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
    }
}
