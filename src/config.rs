use std::time::Duration;

use crate::pipeline::RenderSettings;

pub const DEMO_KEY: &str = "DEMO_KEY";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub api_base: String,
    pub planner_model: String,
    pub render_model: String,
    pub render: RenderSettings,
    pub model_timeout: Duration,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: DEMO_KEY.into(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".into(),
            planner_model: "gemini-3-pro-preview".into(),
            render_model: "gemini-3-pro-image-preview".into(),
            render: RenderSettings::default(),
            model_timeout: Duration::from_secs(120),
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Reads the process environment; unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str, default: String| lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or(default);
        Self {
            api_key: var("GEMINI_API_KEY", defaults.api_key),
            api_base: var("GEMINI_API_BASE", defaults.api_base).trim_end_matches('/').to_string(),
            planner_model: var("PLANNER_MODEL", defaults.planner_model),
            render_model: var("RENDER_MODEL", defaults.render_model),
            render: RenderSettings {
                aspect_ratio: var("RENDER_ASPECT_RATIO", defaults.render.aspect_ratio),
                image_size: var("RENDER_IMAGE_SIZE", defaults.render.image_size),
            },
            model_timeout: lookup("MODEL_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.model_timeout),
            port: lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(defaults.port),
        }
    }

    pub fn is_demo(&self) -> bool { self.api_key == DEMO_KEY }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = AppConfig::from_lookup(|_| None);
        assert!(cfg.is_demo());
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.render, RenderSettings::default());
        assert_eq!(cfg.model_timeout, Duration::from_secs(120));
    }

    #[test]
    fn overrides_are_applied() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEY", "abc"),
            ("GEMINI_API_BASE", "http://localhost:9000/"),
            ("RENDER_ASPECT_RATIO", "1:1"),
            ("MODEL_TIMEOUT_SECS", "30"),
            ("PORT", "not-a-port"),
        ]);
        let cfg = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert!(!cfg.is_demo());
        assert_eq!(cfg.api_base, "http://localhost:9000");
        assert_eq!(cfg.render.aspect_ratio, "1:1");
        assert_eq!(cfg.render.image_size, "1K");
        assert_eq!(cfg.model_timeout, Duration::from_secs(30));
        assert_eq!(cfg.port, 8080);
    }
}
