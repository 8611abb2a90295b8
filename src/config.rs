use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub email: EmailConfig,
    pub webhook_retry: WebhookRetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the loop scans the job store for due jobs.
    pub tick_ms: u64,
    /// Maximum concurrent firings (bounds concurrent agent calls).
    pub worker_pool_size: usize,
    /// How long workers get to finish after a shutdown signal.
    pub shutdown_grace_seconds: u64,
    /// Executions stuck in pending/running longer than this are swept
    /// to `failed` at startup.
    pub recovery_threshold_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
}

impl EmailConfig {
    /// Email delivery is enabled only when a host and sender are configured.
    pub fn is_configured(&self) -> bool {
        self.smtp_host.is_some() && self.smtp_from.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRetryConfig {
    /// Maximum delivery attempts per (execution, recipient) chain.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff_ms: u64,
    /// Cap for exponential backoff.
    pub max_backoff_ms: u64,
    /// Jitter applied to each delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/torale.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            scheduler: SchedulerConfig {
                tick_ms: env::var("SCHEDULER_TICK_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                worker_pool_size: env::var("WORKER_POOL_SIZE")
                    .unwrap_or_else(|_| "16".to_string())
                    .parse()
                    .unwrap_or(16),
                shutdown_grace_seconds: env::var("SHUTDOWN_GRACE_SECONDS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .unwrap_or(15),
                recovery_threshold_seconds: env::var("RECOVERY_THRESHOLD_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            },
            agent: AgentConfig {
                url: env::var("AGENT_URL")
                    .map_err(|_| ConfigError::MissingEnv("AGENT_URL".to_string()))?,
                api_key: env::var("AGENT_API_KEY").ok(),
                timeout_seconds: env::var("AGENT_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
            },
            email: EmailConfig {
                smtp_host: env::var("EMAIL_SMTP_HOST").ok(),
                smtp_port: env::var("EMAIL_SMTP_PORT")
                    .unwrap_or_else(|_| "587".to_string())
                    .parse()
                    .unwrap_or(587),
                smtp_username: env::var("EMAIL_SMTP_USERNAME").ok(),
                smtp_password: env::var("EMAIL_SMTP_PASSWORD").ok(),
                smtp_from: env::var("EMAIL_SMTP_FROM").ok(),
            },
            webhook_retry: WebhookRetryConfig {
                max_attempts: env::var("WEBHOOK_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "6".to_string())
                    .parse()
                    .unwrap_or(6),
                initial_backoff_ms: env::var("WEBHOOK_INITIAL_BACKOFF_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                max_backoff_ms: env::var("WEBHOOK_MAX_BACKOFF_MS")
                    .unwrap_or_else(|_| "300000".to_string())
                    .parse()
                    .unwrap_or(300_000),
                jitter: 0.2,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/torale.db".to_string(),
                max_connections: 5,
            },
            scheduler: SchedulerConfig {
                tick_ms: 1000,
                worker_pool_size: 16,
                shutdown_grace_seconds: 15,
                recovery_threshold_seconds: 300,
            },
            agent: AgentConfig {
                url: "http://localhost:9090/invoke".to_string(),
                api_key: None,
                timeout_seconds: 120,
            },
            email: EmailConfig {
                smtp_host: None,
                smtp_port: 587,
                smtp_username: None,
                smtp_password: None,
                smtp_from: None,
            },
            webhook_retry: WebhookRetryConfig {
                max_attempts: 6,
                initial_backoff_ms: 1000,
                max_backoff_ms: 300_000,
                jitter: 0.2,
            },
        }
    }
}
