use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub observability: ObservabilitySection,
    pub database: DatabaseSection,
    pub wallet: WalletSection,
    pub chain: ChainSection,
    pub payout: PayoutSection,
    pub fees: FeeSection,
    pub backup: BackupSection,
    pub audit: AuditSection,
    pub webhook: WebhookSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    /// Region/server id this instance runs as; keys all durable state.
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Postgres URL of the shared durable store; absent means in-memory
    /// (local development only).
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    pub endpoint: String,
    /// Simulate-only mode: the signing service never moves funds but the
    /// pipeline behaves identically.
    pub simulate: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub rpc_endpoint: String,
    pub house_account: String,
    pub max_transaction_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutSection {
    pub max_retries: u32,
    pub drain_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSection {
    pub buy_in: u64,
    pub creator_share_bps: u16,
    pub prize_share_bps: u16,
    pub creator_address: String,
    pub split_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
    pub snapshot_path: String,
    pub snapshot_interval_secs: u64,
    pub max_snapshot_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    pub log_path: String,
    pub backup_dir: String,
    pub backup_interval_secs: u64,
    pub health_probe_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    observability: Option<PartialObservabilitySection>,
    database: Option<PartialDatabaseSection>,
    wallet: Option<PartialWalletSection>,
    chain: Option<PartialChainSection>,
    payout: Option<PartialPayoutSection>,
    fees: Option<PartialFeeSection>,
    backup: Option<PartialBackupSection>,
    audit: Option<PartialAuditSection>,
    webhook: Option<PartialWebhookSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialWalletSection {
    endpoint: Option<String>,
    simulate: Option<bool>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialChainSection {
    rpc_endpoint: Option<String>,
    house_account: Option<String>,
    max_transaction_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialPayoutSection {
    max_retries: Option<u32>,
    drain_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialFeeSection {
    buy_in: Option<u64>,
    creator_share_bps: Option<u16>,
    prize_share_bps: Option<u16>,
    creator_address: Option<String>,
    split_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialBackupSection {
    snapshot_path: Option<String>,
    snapshot_interval_secs: Option<u64>,
    max_snapshot_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAuditSection {
    log_path: Option<String>,
    backup_dir: Option<String>,
    backup_interval_secs: Option<u64>,
    health_probe_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialWebhookSection {
    url: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "arena-pay-server".to_string(),
                region: "local-1".to_string(),
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
            database: DatabaseSection { url: None },
            wallet: WalletSection {
                endpoint: "http://127.0.0.1:8700".to_string(),
                simulate: app_env != AppEnv::Prod,
                request_timeout_secs: 10,
            },
            chain: ChainSection {
                rpc_endpoint: "http://127.0.0.1:8899".to_string(),
                house_account: String::new(),
                max_transaction_age_secs: 86_400,
            },
            payout: PayoutSection {
                max_retries: 3,
                drain_interval_secs: 5,
            },
            fees: FeeSection {
                buy_in: 1_000_000,
                creator_share_bps: 250,
                prize_share_bps: 250,
                creator_address: String::new(),
                split_interval_secs: 3_600,
            },
            backup: BackupSection {
                snapshot_path: "state-snapshot.json".to_string(),
                snapshot_interval_secs: 30,
                max_snapshot_age_secs: 600,
            },
            audit: AuditSection {
                log_path: "audit-log.jsonl".to_string(),
                backup_dir: "audit-backups".to_string(),
                backup_interval_secs: 3_600,
                health_probe_interval_secs: 60,
            },
            webhook: WebhookSection { url: None },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(region) = env::var("ARENA_PAY__REGION") {
            self.app.region = region;
        }
        if let Ok(url) = env::var("ARENA_PAY__DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Ok(endpoint) = env::var("ARENA_PAY__WALLET_ENDPOINT") {
            self.wallet.endpoint = endpoint;
        }
        if let Ok(url) = env::var("ARENA_PAY__WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
            if let Some(value) = app.region {
                self.app.region = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
        if let Some(database) = partial.database {
            if let Some(value) = database.url {
                self.database.url = Some(value);
            }
        }
        if let Some(wallet) = partial.wallet {
            if let Some(value) = wallet.endpoint {
                self.wallet.endpoint = value;
            }
            if let Some(value) = wallet.simulate {
                self.wallet.simulate = value;
            }
            if let Some(value) = wallet.request_timeout_secs {
                self.wallet.request_timeout_secs = value;
            }
        }
        if let Some(chain) = partial.chain {
            if let Some(value) = chain.rpc_endpoint {
                self.chain.rpc_endpoint = value;
            }
            if let Some(value) = chain.house_account {
                self.chain.house_account = value;
            }
            if let Some(value) = chain.max_transaction_age_secs {
                self.chain.max_transaction_age_secs = value;
            }
        }
        if let Some(payout) = partial.payout {
            if let Some(value) = payout.max_retries {
                self.payout.max_retries = value;
            }
            if let Some(value) = payout.drain_interval_secs {
                self.payout.drain_interval_secs = value;
            }
        }
        if let Some(fees) = partial.fees {
            if let Some(value) = fees.buy_in {
                self.fees.buy_in = value;
            }
            if let Some(value) = fees.creator_share_bps {
                self.fees.creator_share_bps = value;
            }
            if let Some(value) = fees.prize_share_bps {
                self.fees.prize_share_bps = value;
            }
            if let Some(value) = fees.creator_address {
                self.fees.creator_address = value;
            }
            if let Some(value) = fees.split_interval_secs {
                self.fees.split_interval_secs = value;
            }
        }
        if let Some(backup) = partial.backup {
            if let Some(value) = backup.snapshot_path {
                self.backup.snapshot_path = value;
            }
            if let Some(value) = backup.snapshot_interval_secs {
                self.backup.snapshot_interval_secs = value;
            }
            if let Some(value) = backup.max_snapshot_age_secs {
                self.backup.max_snapshot_age_secs = value;
            }
        }
        if let Some(audit) = partial.audit {
            if let Some(value) = audit.log_path {
                self.audit.log_path = value;
            }
            if let Some(value) = audit.backup_dir {
                self.audit.backup_dir = value;
            }
            if let Some(value) = audit.backup_interval_secs {
                self.audit.backup_interval_secs = value;
            }
            if let Some(value) = audit.health_probe_interval_secs {
                self.audit.health_probe_interval_secs = value;
            }
        }
        if let Some(webhook) = partial.webhook {
            if let Some(value) = webhook.url {
                self.webhook.url = Some(value);
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("ARENA_PAY_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}
