use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub workflows_file: PathBuf,
    pub images_dir: PathBuf,
    pub node_timeout: Duration,
    pub poll: PollConfig,
    /// `None` disables the periodic fleet probe.
    pub health_interval: Option<Duration>,
    pub workflow_liveness_interval: Duration,
    pub jwt_secret: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 50,
        }
    }
}

/// Signing secret used when `SKYPORT_JWT_SECRET` is unset. Development only.
pub const DEV_JWT_SECRET: &str = "dev-insecure-change-me";

fn jwt_secret_from(raw: Option<String>) -> Vec<u8> {
    match raw {
        Some(secret) => secret.into_bytes(),
        None => {
            tracing::warn!(
                "SKYPORT_JWT_SECRET not set; using the development secret, tokens can be forged"
            );
            DEV_JWT_SECRET.as_bytes().to_vec()
        }
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_ms(raw: Option<String>, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    let ms = raw
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms)
        .clamp(min_ms, max_ms);
    Duration::from_millis(ms)
}

fn parse_listen_addr(raw: Option<String>) -> SocketAddr {
    raw.and_then(|v| v.parse().ok())
        .unwrap_or_else(|| ([0, 0, 0, 0], 8080).into())
}

impl Config {
    pub fn from_env() -> Self {
        let health_interval = match env_trimmed("SKYPORT_HEALTH_INTERVAL_MS").as_deref() {
            Some("0") => None,
            raw => Some(parse_ms(raw.map(str::to_string), 60_000, 1_000, 3_600_000)),
        };

        Self {
            database_url: env_trimmed("DATABASE_URL"),
            listen_addr: parse_listen_addr(env_trimmed("SKYPORT_LISTEN_ADDR")),
            workflows_file: env_trimmed("SKYPORT_WORKFLOWS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage/workflows.json")),
            images_dir: env_trimmed("SKYPORT_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage/images")),
            node_timeout: parse_ms(env_trimmed("SKYPORT_NODE_TIMEOUT_MS"), 5_000, 500, 120_000),
            poll: PollConfig {
                interval: parse_ms(env_trimmed("SKYPORT_POLL_INTERVAL_MS"), 30_000, 10, 600_000),
                max_attempts: env_trimmed("SKYPORT_POLL_MAX_ATTEMPTS")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(50)
                    .clamp(1, 10_000),
            },
            health_interval,
            workflow_liveness_interval: parse_ms(
                env_trimmed("SKYPORT_WORKFLOW_LIVENESS_MS"),
                60_000,
                1_000,
                3_600_000,
            ),
            jwt_secret: jwt_secret_from(env_trimmed("SKYPORT_JWT_SECRET")),
        }
    }
}
