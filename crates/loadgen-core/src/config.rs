use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Base URL and request timeout for one of the four downstream services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub url: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ServiceEndpoint {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUrls {
    pub user: ServiceEndpoint,
    pub chat: ServiceEndpoint,
    pub posts: ServiceEndpoint,
    pub profile: ServiceEndpoint,
}

impl Default for ServiceUrls {
    fn default() -> Self {
        Self {
            user: ServiceEndpoint::new("http://localhost:8001"),
            chat: ServiceEndpoint::new("http://localhost:8002"),
            posts: ServiceEndpoint::new("http://localhost:8003"),
            profile: ServiceEndpoint::new("http://localhost:8004"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChaosConfig {
    pub error_rate: f64,
    pub delay_rate: f64,
    pub max_delay_ms: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            delay_rate: 0.0,
            max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadgenConfig {
    pub services: ServiceUrls,
    pub chaos: ChaosConfig,
    pub control_port: u16,
    pub metrics_port: u16,
}

impl Default for LoadgenConfig {
    fn default() -> Self {
        Self {
            services: ServiceUrls::default(),
            chaos: ChaosConfig::default(),
            control_port: 8080,
            metrics_port: 9090,
        }
    }
}

impl LoadgenConfig {
    /// Layers defaults, an optional YAML file, then environment overrides.
    ///
    /// A missing or malformed file is logged and skipped, never fatal --
    /// every field already has a default.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_yaml::from_str::<LoadgenConfig>(&contents) {
                    Ok(parsed) => config = parsed,
                    Err(e) => warn!("failed to parse config at {}: {e}", path.display()),
                },
                Err(e) => warn!("failed to read config at {}: {e}", path.display()),
            }
        }

        apply_env_overrides(&mut config);
        config
    }
}

fn apply_env_overrides(config: &mut LoadgenConfig) {
    if let Ok(val) = std::env::var("USER_SERVICE_URL") {
        config.services.user.url = val;
    }
    if let Ok(val) = std::env::var("CHAT_SERVICE_URL") {
        config.services.chat.url = val;
    }
    if let Ok(val) = std::env::var("POSTS_SERVICE_URL") {
        config.services.posts.url = val;
    }
    if let Ok(val) = std::env::var("PROFILE_SERVICE_URL") {
        config.services.profile.url = val;
    }
    if let Ok(val) = std::env::var("CHAOS_ERROR_RATE") {
        if let Ok(parsed) = val.parse() {
            config.chaos.error_rate = parsed;
        }
    }
    if let Ok(val) = std::env::var("CHAOS_DELAY_RATE") {
        if let Ok(parsed) = val.parse() {
            config.chaos.delay_rate = parsed;
        }
    }
    if let Ok(val) = std::env::var("CHAOS_MAX_DELAY_MS") {
        if let Ok(parsed) = val.parse() {
            config.chaos.max_delay_ms = parsed;
        }
    }
    if let Ok(val) = std::env::var("WEB_PORT") {
        if let Ok(parsed) = val.parse() {
            config.control_port = parsed;
        }
    }
    if let Ok(val) = std::env::var("METRICS_PORT") {
        if let Ok(parsed) = val.parse() {
            config.metrics_port = parsed;
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
