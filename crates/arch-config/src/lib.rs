//! Configuration for the arch pipeline server and the asset-import listener.
//!
//! Values come from (lowest to highest precedence): built-in defaults, an
//! optional JSON config file, `ARCH_*` environment variables, CLI flags
//! (applied by the binaries).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use arch_types::{MeshTarget, ModelKind, Residency};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What `acquire` does when another stage holds the model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Wait until the holder releases (preserves request ordering).
    #[default]
    Serialize,
    /// Fail immediately with `SlotBusy`.
    FailFast,
}

impl FromStr for SlotPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "serialize" | "block" => Ok(SlotPolicy::Serialize),
            "fail_fast" | "fail-fast" => Ok(SlotPolicy::FailFast),
            other => Err(ConfigError::Invalid(format!("unknown slot policy '{other}'"))),
        }
    }
}

/// What happens to an exclusive model once its stage finishes successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterRun {
    /// Stay loaded; swapped out lazily when another model needs the slot.
    #[default]
    KeepLoaded,
    /// Unload after every run.
    Unload,
}

/// How a model is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelBackend {
    /// Deterministic CPU stand-in (demo and tests).
    Mock {
        #[serde(default)]
        step_delay_ms: u64,
    },
    /// Child process speaking JSON Lines on stdin/stdout.
    Process { command: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub residency: Residency,
    pub backend: ModelBackend,
}

impl ModelSpec {
    pub fn mock(name: &str, kind: ModelKind, residency: Residency) -> Self {
        Self {
            name: name.to_string(),
            kind,
            residency,
            backend: ModelBackend::Mock { step_delay_ms: 50 },
        }
    }
}

/// Settings for the downstream asset-import listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub host: String,
    pub port: u16,
    /// Host-tool command; the uploaded file path is appended as last argument.
    pub command: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5666,
            command: vec![
                "blender".to_string(),
                "--python".to_string(),
                "import_glb.py".to_string(),
                "--".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    pub host: String,
    pub port: u16,
    /// Size of the inference worker pool.
    pub worker_threads: usize,
    pub slot_policy: SlotPolicy,
    pub after_run: AfterRun,
    pub default_seed: u64,
    pub sampling_steps: u32,
    pub image_size: u32,
    pub guidance_scale: f32,
    pub default_image_model: String,
    pub style_templates: HashMap<String, String>,
    /// `#rrggbb`; when set, background removal flattens alpha onto this colour.
    pub background_fill: Option<String>,
    pub mesh_target: MeshTarget,
    pub models: Vec<ModelSpec>,
    pub import: ImportConfig,
    pub log_dir: String,
    pub log_level: String,
}

impl Default for ArchConfig {
    fn default() -> Self {
        // Every model defaults to the synthetic backend so the server runs
        // without a GPU; real deployments point `models` at worker processes.
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            worker_threads: 4,
            slot_policy: SlotPolicy::Serialize,
            after_run: AfterRun::KeepLoaded,
            default_seed: 42,
            sampling_steps: 20,
            image_size: 512,
            guidance_scale: 5.0,
            default_image_model: "sana".to_string(),
            style_templates: default_style_templates(),
            background_fill: None,
            mesh_target: MeshTarget::default(),
            models: vec![
                ModelSpec::mock("sana", ModelKind::TextToImage, Residency::Exclusive),
                ModelSpec::mock("sdxl", ModelKind::TextToImage, Residency::Exclusive),
                ModelSpec::mock("dalle3", ModelKind::TextToImage, Residency::AlwaysResident),
                ModelSpec::mock("rmbg", ModelKind::BackgroundRemoval, Residency::AlwaysResident),
                ModelSpec::mock("trellis-image", ModelKind::Reconstruction, Residency::Exclusive),
                ModelSpec::mock("trellis-decoder", ModelKind::MeshDecoding, Residency::Exclusive),
            ],
            import: ImportConfig::default(),
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Built-in prompt styles. Templates are minijinja strings with a `prompt` variable.
pub fn default_style_templates() -> HashMap<String, String> {
    let mut templates = HashMap::new();
    templates.insert(
        "hero".to_string(),
        "A single whimsical, highly detailed 3D object centered in the frame against a simple \
         light background. The object should fill most of the image, with no distracting \
         elements around it. Capture it from a slightly angled front-facing perspective so its \
         features are fully visible. Render it in a bright, vibrant, and polished illustrative \
         style with clean edges, crisp details, and subtle, even lighting. The object is {{ prompt }}."
            .to_string(),
    );
    templates.insert(
        "isometric".to_string(),
        "Isometric style, {{ prompt }}, centered, plain background.".to_string(),
    );
    templates
}

impl ArchConfig {
    /// Load from an optional JSON file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json_str(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `ARCH_*` overrides through `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ARCH_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("ARCH_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("ARCH_PORT '{port}' is not a port")))?;
        }
        if let Some(workers) = lookup("ARCH_WORKERS") {
            self.worker_threads = workers.parse().map_err(|_| {
                ConfigError::Invalid(format!("ARCH_WORKERS '{workers}' is not a number"))
            })?;
        }
        if let Some(policy) = lookup("ARCH_SLOT_POLICY") {
            self.slot_policy = policy.parse()?;
        }
        if let Some(level) = lookup("ARCH_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.sampling_steps == 0 {
            return Err(ConfigError::Invalid("sampling_steps must be at least 1".into()));
        }
        if let Some(fill) = &self.background_fill {
            parse_hex_color(fill)?;
        }

        let env = minijinja::Environment::new();
        for (name, template) in &self.style_templates {
            env.render_str(template, minijinja::context! { prompt => "test" })
                .map_err(|e| ConfigError::Invalid(format!("style template '{name}': {e}")))?;
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.models {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate model name '{}'", spec.name)));
            }
            if let ModelBackend::Process { command } = &spec.backend {
                if command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' has an empty process command",
                        spec.name
                    )));
                }
            }
        }

        let default_registered = self.models.iter().any(|spec| {
            spec.kind == ModelKind::TextToImage && spec.name == self.default_image_model
        });
        if !default_registered {
            return Err(ConfigError::Invalid(format!(
                "default_image_model '{}' is not a configured text-to-image model",
                self.default_image_model
            )));
        }
        Ok(())
    }

    pub fn models_of(&self, kind: ModelKind) -> impl Iterator<Item = &ModelSpec> {
        self.models.iter().filter(move |spec| spec.kind == kind)
    }

    pub fn background_fill_rgb(&self) -> Option<[u8; 3]> {
        self.background_fill
            .as_deref()
            .and_then(|fill| parse_hex_color(fill).ok())
    }
}

/// Parse `#rrggbb` (leading `#` optional).
pub fn parse_hex_color(value: &str) -> Result<[u8; 3], ConfigError> {
    let hex = value.trim().trim_start_matches('#');
    let invalid = || ConfigError::Invalid(format!("'{value}' is not a #rrggbb colour"));
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(invalid());
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ArchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.sampling_steps, 20);
        assert_eq!(config.default_seed, 42);
        assert_eq!(config.slot_policy, SlotPolicy::Serialize);
        assert_eq!(config.import.port, 5666);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ArchConfig::from_json_str(r#"{"port": 9100, "slot_policy": "fail_fast"}"#)
            .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.slot_policy, SlotPolicy::FailFast);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.models.len(), 6);
    }

    #[test]
    fn test_process_backend_parses() {
        let json = r#"{
            "default_image_model": "sana",
            "models": [
                {"name": "sana", "kind": "text_to_image",
                 "backend": {"type": "process", "command": ["python", "sana_worker.py"]}}
            ]
        }"#;
        let config = ArchConfig::from_json_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.models[0].residency, Residency::Exclusive);
        assert_eq!(
            config.models[0].backend,
            ModelBackend::Process {
                command: vec!["python".to_string(), "sana_worker.py".to_string()]
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ArchConfig::default();
        config
            .apply_overrides(|key| match key {
                "ARCH_PORT" => Some("8123".to_string()),
                "ARCH_WORKERS" => Some("2".to_string()),
                "ARCH_SLOT_POLICY" => Some("fail-fast".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.port, 8123);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.slot_policy, SlotPolicy::FailFast);
    }

    #[test]
    fn test_bad_env_override_is_rejected() {
        let mut config = ArchConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "ARCH_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_unknown_default_model() {
        let config = ArchConfig {
            default_image_model: "missing".to_string(),
            ..ArchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_names() {
        let mut config = ArchConfig::default();
        config
            .models
            .push(ModelSpec::mock("sana", ModelKind::TextToImage, Residency::Exclusive));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = ArchConfig {
            worker_threads: 0,
            ..ArchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hex_colors() {
        assert_eq!(parse_hex_color("#ff8000").unwrap(), [255, 128, 0]);
        assert_eq!(parse_hex_color("000000").unwrap(), [0, 0, 0]);
        assert!(parse_hex_color("#fff").is_err());
        assert!(parse_hex_color("#gg0000").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r##"{{"host": "127.0.0.1", "background_fill": "#ffffff"}}"##).unwrap();
        let config = ArchConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.background_fill_rgb(), Some([255, 255, 255]));
    }
}
