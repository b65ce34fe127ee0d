pub mod chain_client;
pub mod config;
pub mod game_events;
pub mod http_wallet;
pub mod webhook;

pub use chain_client::JsonRpcChainClient;
pub use config::{AppConfig, AppEnv, ConfigError};
pub use game_events::{GameEventError, GameEvents};
pub use http_wallet::HttpWalletService;
pub use webhook::WebhookNotifier;
