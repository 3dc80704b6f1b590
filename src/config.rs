//! Translator configuration
//!
//! Two configuration layers feed the engine:
//!
//! - [`ModelConfig`] describes the physics model being translated: how many
//!   fields and parameters it has, the target-language working type, and the
//!   feature flags consulted by conditional directives.
//! - [`TranslatorConfig`] tunes the engine itself: diagnostic strictness,
//!   the pre-macro rescan bound, and whether common-subexpression
//!   elimination is active.
//!
//! Both are plain values constructed once per translation and passed by
//! reference. There is no process-wide configuration state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Description of the model a template is being translated for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, exposed to templates through the `MODEL` macro.
    pub name: String,
    /// Number of fields (Nf). Field-only indices range over `0..num_fields`.
    pub num_fields: usize,
    /// Number of parameters (Np).
    pub num_params: usize,
    /// Default target-language working type, used when no `WORKING_TYPE`
    /// resource has been assigned.
    pub working_type: String,
    /// Named boolean flags consulted by `IF`/`ELSE`/`ENDIF` directives.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "model".to_string(),
            num_fields: 1,
            num_params: 0,
            working_type: "double".to_string(),
            features: BTreeMap::new(),
        }
    }
}

impl ModelConfig {
    /// Size of the phase-space range (fields plus momenta).
    pub fn phase_size(&self) -> usize {
        2 * self.num_fields
    }

    /// Look up a feature flag. Unknown flags read as `false`.
    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    /// Parse a model description from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse model configuration")
    }

    /// Load a model description from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model configuration: {}", path.display()))?;
        Self::from_yaml_str(&text)
    }
}

/// Engine-level settings, independent of any particular model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// When set, querying an unset resource is reported as an error rather
    /// than a warning.
    #[serde(default)]
    pub dev_warn: bool,
    /// Upper bound on pre-macro rescan passes over one line. A line still
    /// changing after this many passes is reported as divergent.
    #[serde(default = "default_max_pre_passes")]
    pub max_pre_passes: usize,
    /// Whether the CSE worker factors repeated subexpressions into
    /// temporaries.
    #[serde(default = "default_true")]
    pub cse: bool,
}

fn default_max_pre_passes() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            dev_warn: false,
            max_pre_passes: default_max_pre_passes(),
            cse: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_from_yaml() {
        let cfg = ModelConfig::from_yaml_str(
            r#"
name: quadratic
num_fields: 2
num_params: 1
working_type: double
features:
  metric: true
"#,
        )
        .unwrap();

        assert_eq!(cfg.name, "quadratic");
        assert_eq!(cfg.num_fields, 2);
        assert_eq!(cfg.phase_size(), 4);
        assert!(cfg.feature("metric"));
        assert!(!cfg.feature("unknown"));
    }

    #[test]
    fn translator_defaults() {
        let cfg = TranslatorConfig::default();
        assert!(!cfg.dev_warn);
        assert_eq!(cfg.max_pre_passes, 64);
        assert!(cfg.cse);
    }

    #[test]
    fn model_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: disk\nnum_fields: 3\nnum_params: 2\nworking_type: float").unwrap();

        let cfg = ModelConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(cfg.name, "disk");
        assert_eq!(cfg.num_fields, 3);
    }
}
