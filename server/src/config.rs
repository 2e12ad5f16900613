use std::time::Duration;

/// Header carrying the shared scoring secret, on both the submission
/// endpoint and the outbound result callback.
pub const SCORING_KEY_HEADER: &str = "x-scoring-key";

/// Placeholder secret used when `SCORING_KEY` is unset. Fine for local
/// development; `main` warns loudly when it is still in effect.
pub const DEFAULT_SCORING_KEY: &str = "default";

/// Interval between sweeper ticks on the leader worker.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub scoring_key: String,
    pub port: u16,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            scoring_key: std::env::var("SCORING_KEY")
                .unwrap_or_else(|_| DEFAULT_SCORING_KEY.to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            metrics_enabled: matches!(
                std::env::var("ENABLE_METRICS").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
            ),
        }
    }

    pub fn scoring_key_is_default(&self) -> bool {
        self.scoring_key == DEFAULT_SCORING_KEY
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
