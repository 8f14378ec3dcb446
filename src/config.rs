use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub sweep_interval_secs: u64,
    pub dead_threshold_secs: u64,
    /// How far `updated_at` is pushed past a successful start.
    pub start_grace_secs: u64,
    pub runtime_port: u16,
    pub runtime_timeout_secs: u64,
    pub server_image: String,
    pub bungee_image: String,
    pub bungee_port: u16,
    pub data_volume: String,
    /// Extra same-node attempts after a container fails to start.
    pub start_retries: u32,
    /// Nodes tried per server intent before giving up.
    pub max_placements: usize,
    pub worker_concurrency: usize,
    pub redeliver_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<PathBuf>,

    // Passed through to every instance container.
    pub store_addresses: String,
    pub store_database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_password: Option<String>,
    pub broker_addresses: String,
    pub broker_username: String,
    pub broker_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            dead_threshold_secs: 60,
            start_grace_secs: 300,
            runtime_port: 4243,
            runtime_timeout_secs: 120,
            server_image: "minestack/bukkit".into(),
            bungee_image: "minestack/bungee".into(),
            bungee_port: 25565,
            data_volume: "/mnt/minestack".into(),
            start_retries: 2,
            max_placements: 3,
            worker_concurrency: 8,
            redeliver_delay_ms: 1000,
            topology: None,
            store_addresses: "127.0.0.1:27017".into(),
            store_database: "minestack".into(),
            store_username: None,
            store_password: None,
            broker_addresses: "127.0.0.1:5672".into(),
            broker_username: "guest".into(),
            broker_password: "guest".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("stackd.toml"))
            .merge(Json::file("stackd.json"))
            .merge(Env::prefixed("STACKD_"));
        let mut config = Self::from_figment(figment)?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("STACKD_STORE_PASSWORD_FILE") {
            config.store_password = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }
        if let Ok(secret_file) = std::env::var("STACKD_BROKER_PASSWORD_FILE") {
            config.broker_password = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.max_placements == 0 {
            anyhow::bail!("max_placements must be at least 1");
        }
        if config.worker_concurrency == 0 {
            anyhow::bail!("worker_concurrency must be at least 1");
        }
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn redeliver_delay(&self) -> Duration {
        Duration::from_millis(self.redeliver_delay_ms)
    }

    pub fn container_env(&self) -> ContainerEnv {
        ContainerEnv {
            store_addresses: self.store_addresses.clone(),
            store_database: self.store_database.clone(),
            store_credentials: self
                .store_username
                .clone()
                .map(|user| (user, self.store_password.clone().unwrap_or_default())),
            broker_addresses: self.broker_addresses.clone(),
            broker_username: self.broker_username.clone(),
            broker_password: self.broker_password.clone(),
        }
    }
}

/// Connection parameters injected into instance containers so the hosted
/// process can register itself and heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnv {
    pub store_addresses: String,
    pub store_database: String,
    pub store_credentials: Option<(String, String)>,
    pub broker_addresses: String,
    pub broker_username: String,
    pub broker_password: String,
}

impl ContainerEnv {
    /// Renders `KEY=value` entries, ending with the instance identity
    /// (`server_id` or `bungee_id`).
    pub fn render(&self, identity_key: &str, identity: &str) -> Vec<String> {
        let mut env = vec![
            format!("store_addresses={}", self.store_addresses),
            format!("store_database={}", self.store_database),
            format!("broker_addresses={}", self.broker_addresses),
            format!("broker_username={}", self.broker_username),
            format!("broker_password={}", self.broker_password),
        ];
        if let Some((username, password)) = &self.store_credentials {
            env.push(format!("store_username={}", username));
            env.push(format!("store_password={}", password));
        }
        env.push(format!("{}={}", identity_key, identity));
        env
    }
}
