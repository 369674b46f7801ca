//! Environment Configuration
//!
//! Every external key, endpoint and contract address is supplied through the
//! environment. Each sub-config has a `from_env()` constructor and a `Default`
//! suitable for tests.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Public URL of the front-end (used for redirects and share links).
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

/// Hosted prover base URL.
pub const DEFAULT_PROVER_URL: &str = "https://prover.vlayer.xyz";

/// Neynar REST base URL.
pub const DEFAULT_NEYNAR_URL: &str = "https://api.neynar.com/v2";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more required keys are not set.
    #[error("missing configuration: {0}")]
    Missing(String),
    /// A key is set but does not parse.
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// Environment variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

// =============================================================================
// CHAIN TABLE
// =============================================================================

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
    /// Celo Alfajores test network (44787).
    Alfajores,
    /// Celo main network (42220).
    Celo,
}

impl ChainId {
    /// Numeric chain id.
    pub const fn id(self) -> u64 {
        match self {
            ChainId::Alfajores => 44787,
            ChainId::Celo => 42220,
        }
    }

    /// Map a numeric id onto the table. Unknown ids fall back to the test network.
    pub fn from_id(id: u64) -> Self {
        match id {
            44787 => ChainId::Alfajores,
            42220 => ChainId::Celo,
            other => {
                warn!("Unknown chain id {}, falling back to Alfajores", other);
                ChainId::Alfajores
            }
        }
    }

    /// Public RPC endpoint.
    pub fn default_rpc_url(self) -> &'static str {
        match self {
            ChainId::Alfajores => "https://alfajores-forno.celo-testnet.org",
            ChainId::Celo => "https://forno.celo.org",
        }
    }

    /// Block explorer link for a transaction hash.
    pub fn explorer_tx_url(self, tx_hash: &str) -> String {
        match self {
            ChainId::Alfajores => format!("https://explorer.celo.org/alfajores/tx/{}", tx_hash),
            ChainId::Celo => format!("https://explorer.celo.org/mainnet/tx/{}", tx_hash),
        }
    }

    /// Deployed cUSD token.
    pub fn default_token_address(self) -> Address {
        match self {
            ChainId::Alfajores => address!("F194afDf50B03e69Bd7D057c1Aa9e10c9954E4C9"),
            ChainId::Celo => address!("765DE816845861e75A25fCA122bb6898B8B1282a"),
        }
    }
}

/// Escrow and stake-token addresses for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    /// Betting escrow contract.
    pub escrow: Address,
    /// ERC-20 stake token (cUSD).
    pub token: Address,
}

impl ContractAddresses {
    /// Resolve addresses for `chain` from `ESCROW_CONTRACT_<NET>` / `CUSD_<NET>`.
    ///
    /// A missing escrow address resolves to zero and is reported by
    /// [`AppConfig::validate`]; a missing token falls back to the deployed cUSD.
    pub fn from_env(chain: ChainId) -> Result<Self, ConfigError> {
        let escrow_key = escrow_env_key(chain);
        let token_key = token_env_key(chain);

        let escrow = env_parse::<Address>(escrow_key)?.unwrap_or(Address::ZERO);
        let token = env_parse::<Address>(token_key)?
            .unwrap_or_else(|| chain.default_token_address());

        Ok(Self { escrow, token })
    }
}

fn escrow_env_key(chain: ChainId) -> &'static str {
    match chain {
        ChainId::Alfajores => "ESCROW_CONTRACT_SEPOLIA",
        ChainId::Celo => "ESCROW_CONTRACT_MAINNET",
    }
}

fn token_env_key(chain: ChainId) -> &'static str {
    match chain {
        ChainId::Alfajores => "CUSD_SEPOLIA",
        ChainId::Celo => "CUSD_MAINNET",
    }
}

// =============================================================================
// SUB-CONFIGS
// =============================================================================

/// Strava OAuth application and API endpoints.
#[derive(Clone, Debug)]
pub struct StravaConfig {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret (server-side only).
    pub client_secret: Option<String>,
    /// Authorization endpoint.
    pub authorize_url: String,
    /// Token exchange endpoint.
    pub token_url: String,
    /// REST API base.
    pub api_base: String,
    /// Activities per page.
    pub page_size: u32,
    /// Upper bound on pages fetched per listing.
    pub max_pages: u32,
}

impl Default for StravaConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            authorize_url: "https://www.strava.com/oauth/authorize".into(),
            token_url: "https://www.strava.com/oauth/token".into(),
            api_base: "https://www.strava.com/api/v3".into(),
            page_size: 30,
            max_pages: 5,
        }
    }
}

impl StravaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            client_id: env_var("STRAVA_CLIENT_ID").unwrap_or_default(),
            client_secret: env_var("STRAVA_CLIENT_SECRET"),
            ..Default::default()
        }
    }
}

/// Hosted prover.
#[derive(Clone, Debug)]
pub struct ProverConfig {
    /// Base URL (`/prove` and `/compress-web-proof` are appended).
    pub base_url: String,
    /// `X-API-Key` value.
    pub api_key: Option<String>,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROVER_URL.into(),
            api_key: None,
        }
    }
}

impl ProverConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: env_var("VLAYER_PROVER_URL").unwrap_or_else(|| DEFAULT_PROVER_URL.into()),
            api_key: env_var("VLAYER_API_KEY"),
        }
    }
}

/// Farcaster identity API.
#[derive(Clone, Debug)]
pub struct NeynarConfig {
    /// REST base URL.
    pub base_url: String,
    /// `api_key` header value.
    pub api_key: Option<String>,
}

impl Default for NeynarConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_NEYNAR_URL.into(),
            api_key: None,
        }
    }
}

impl NeynarConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: DEFAULT_NEYNAR_URL.into(),
            api_key: env_var("NEYNAR_API_KEY"),
        }
    }
}

/// Chain access and confirmation policy.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Selected network.
    pub chain: ChainId,
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Contract addresses for `chain`.
    pub contracts: ContractAddresses,
    /// Default sending account for CLI commands.
    pub sender: Option<Address>,
    /// Receipt polling cadence.
    pub receipt_poll: Duration,
    /// Give up waiting for a receipt after this long.
    pub receipt_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        let chain = ChainId::Alfajores;
        Self {
            chain,
            rpc_url: chain.default_rpc_url().into(),
            contracts: ContractAddresses {
                escrow: Address::ZERO,
                token: chain.default_token_address(),
            },
            sender: None,
            receipt_poll: Duration::from_millis(1000),
            receipt_timeout: Duration::from_secs(180),
        }
    }
}

impl ChainConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let chain = ChainId::from_id(env_parse::<u64>("CHAIN_ID")?.unwrap_or(44787));
        Ok(Self {
            chain,
            rpc_url: env_var("RPC_URL").unwrap_or_else(|| chain.default_rpc_url().into()),
            contracts: ContractAddresses::from_env(chain)?,
            sender: env_parse::<Address>("SENDER_ADDRESS")?,
            receipt_poll: Duration::from_millis(env_parse::<u64>("RECEIPT_POLL_MS")?.unwrap_or(1000)),
            receipt_timeout: Duration::from_secs(
                env_parse::<u64>("RECEIPT_TIMEOUT_SECS")?.unwrap_or(180),
            ),
        })
    }
}

/// Session ticket signing.
#[derive(Clone, Debug)]
pub struct TicketConfig {
    /// HS256 secret.
    pub secret: Option<String>,
    /// Ticket and flow-session lifetime.
    pub ttl: Duration,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl: Duration::from_secs(900),
        }
    }
}

impl TicketConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            secret: env_var("TICKET_SECRET"),
            ttl: Duration::from_secs(env_parse::<u64>("TICKET_TTL_SECS")?.unwrap_or(900)),
        })
    }

    /// Check if ticket signing is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.as_deref().map_or(false, |s| !s.is_empty())
    }
}

// =============================================================================
// APP CONFIG
// =============================================================================

/// Complete application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Public front-end URL.
    pub app_url: String,
    /// Strava OAuth + API.
    pub strava: StravaConfig,
    /// Hosted prover.
    pub prover: ProverConfig,
    /// Farcaster identity.
    pub neynar: NeynarConfig,
    /// Chain access.
    pub chain: ChainConfig,
    /// Session tickets.
    pub tickets: TicketConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_url: DEFAULT_APP_URL.into(),
            strava: StravaConfig::default(),
            prover: ProverConfig::default(),
            neynar: NeynarConfig::default(),
            chain: ChainConfig::default(),
            tickets: TicketConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            app_url: env_var("APP_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_APP_URL.into()),
            strava: StravaConfig::from_env(),
            prover: ProverConfig::from_env(),
            neynar: NeynarConfig::from_env(),
            chain: ChainConfig::from_env()?,
            tickets: TicketConfig::from_env()?,
        })
    }

    /// Names of required keys that are not set.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.strava.client_id.is_empty() {
            missing.push("STRAVA_CLIENT_ID");
        }
        if self.strava.client_secret.is_none() {
            missing.push("STRAVA_CLIENT_SECRET");
        }
        if self.prover.api_key.is_none() {
            missing.push("VLAYER_API_KEY");
        }
        if self.neynar.api_key.is_none() {
            missing.push("NEYNAR_API_KEY");
        }
        if self.chain.contracts.escrow == Address::ZERO {
            missing.push(escrow_env_key(self.chain.chain));
        }
        if !self.tickets.is_configured() {
            missing.push("TICKET_SECRET");
        }
        missing
    }

    /// Fail if any required key is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_keys();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing.join(", ")))
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_table() {
        assert_eq!(ChainId::from_id(44787), ChainId::Alfajores);
        assert_eq!(ChainId::from_id(42220), ChainId::Celo);
        assert_eq!(ChainId::Celo.id(), 42220);
    }

    #[test]
    fn test_unknown_chain_falls_back_to_testnet() {
        assert_eq!(ChainId::from_id(1), ChainId::Alfajores);
    }

    #[test]
    fn test_explorer_links() {
        let url = ChainId::Alfajores.explorer_tx_url("0xabc");
        assert_eq!(url, "https://explorer.celo.org/alfajores/tx/0xabc");
    }

    #[test]
    fn test_default_config_reports_missing_keys() {
        let config = AppConfig::default();
        let missing = config.missing_keys();
        assert!(missing.contains(&"STRAVA_CLIENT_SECRET"));
        assert!(missing.contains(&"ESCROW_CONTRACT_SEPOLIA"));
        assert!(missing.contains(&"TICKET_SECRET"));
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_complete_config_validates() {
        let mut config = AppConfig::default();
        config.strava.client_id = "12345".into();
        config.strava.client_secret = Some("secret".into());
        config.prover.api_key = Some("key".into());
        config.neynar.api_key = Some("key".into());
        config.chain.contracts.escrow = address!("1111111111111111111111111111111111111111");
        config.tickets.secret = Some("ticket-secret".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ticket_config_empty_secret_not_configured() {
        let config = TicketConfig {
            secret: Some(String::new()),
            ..Default::default()
        };
        assert!(!config.is_configured());
    }
}
