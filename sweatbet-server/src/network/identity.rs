//! Farcaster Identity
//!
//! Resolves social handles to wallet addresses through Neynar and publishes
//! casts announcing wagers.

use std::collections::HashMap;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::core::config::NeynarConfig;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// API key is not configured.
    #[error("NEYNAR_API_KEY is not configured")]
    NotConfigured,
    /// Transport or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-2xx response.
    #[error("identity service rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// Lookup succeeded but returned no user.
    #[error("user not found: {0}")]
    NotFound(String),
}

/// Verified addresses attached to a profile.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedAddresses {
    /// Ethereum addresses, in verification order.
    #[serde(default)]
    pub eth_addresses: Vec<Address>,
    /// Solana addresses (unused).
    #[serde(default)]
    pub sol_addresses: Vec<String>,
}

/// Farcaster user profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarcasterUser {
    /// Farcaster id.
    pub fid: u64,
    /// Handle without `@`.
    pub username: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Custody address.
    pub custody_address: Address,
    /// Verified addresses.
    #[serde(default)]
    pub verified_addresses: VerifiedAddresses,
    /// Avatar URL.
    #[serde(default)]
    pub pfp_url: Option<String>,
}

impl FarcasterUser {
    /// First verified address, else the custody address.
    pub fn preferred_address(&self) -> Address {
        self.verified_addresses
            .eth_addresses
            .first()
            .copied()
            .unwrap_or(self.custody_address)
    }
}

/// Handle resolved to an address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedParticipant {
    /// Handle as returned by the service.
    pub handle: String,
    /// Farcaster id.
    pub fid: u64,
    /// Preferred address.
    pub address: Address,
}

/// Identity lookups.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Users for a list of handles. Unknown handles are omitted.
    async fn users_by_username(&self, usernames: &[String]) -> Result<Vec<FarcasterUser>, IdentityError>;

    /// Users for a list of fids.
    async fn users_by_fid(&self, fids: &[u64]) -> Result<Vec<FarcasterUser>, IdentityError>;

    /// Users verified for `address`.
    async fn users_by_address(&self, address: Address) -> Result<Vec<FarcasterUser>, IdentityError>;
}

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<FarcasterUser>,
}

#[derive(Serialize)]
struct CastRequest<'a> {
    signer_uuid: &'a str,
    text: &'a str,
    embeds: &'a [String],
}

/// Published cast.
#[derive(Clone, Debug, Deserialize)]
pub struct PublishedCast {
    /// Cast hash.
    pub hash: String,
}

#[derive(Deserialize)]
struct CastResponse {
    cast: PublishedCast,
}

/// Neynar REST client.
pub struct NeynarClient {
    config: NeynarConfig,
    http: reqwest::Client,
}

impl NeynarClient {
    /// Create a client.
    pub fn new(config: NeynarConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, IdentityError> {
        self.config.api_key.as_deref().ok_or(IdentityError::NotConfigured)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, String)]) -> Result<T, IdentityError> {
        let response = self
            .http
            .get(format!("{}{}", self.config.base_url, path))
            .header("api_key", self.api_key()?)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Post a cast from a managed signer.
    #[instrument(skip(self, signer_uuid, text))]
    pub async fn publish_cast(
        &self,
        signer_uuid: &str,
        text: &str,
        embeds: &[String],
    ) -> Result<PublishedCast, IdentityError> {
        let response = self
            .http
            .post(format!("{}/farcaster/cast", self.config.base_url))
            .header("api_key", self.api_key()?)
            .json(&CastRequest {
                signer_uuid,
                text,
                embeds,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let err = IdentityError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            };
            error!("Error publishing cast: {}", err);
            return Err(err);
        }
        let body: CastResponse = response.json().await?;
        info!(hash = %body.cast.hash, "Cast published");
        Ok(body.cast)
    }
}

#[async_trait]
impl IdentityApi for NeynarClient {
    async fn users_by_username(&self, usernames: &[String]) -> Result<Vec<FarcasterUser>, IdentityError> {
        let response: UsersResponse = self
            .get("/farcaster/user/bulk-by-username", &[("usernames", usernames.join(","))])
            .await?;
        Ok(response.users)
    }

    async fn users_by_fid(&self, fids: &[u64]) -> Result<Vec<FarcasterUser>, IdentityError> {
        let fids = fids.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
        let response: UsersResponse = self.get("/farcaster/user/bulk", &[("fids", fids)]).await?;
        Ok(response.users)
    }

    async fn users_by_address(&self, address: Address) -> Result<Vec<FarcasterUser>, IdentityError> {
        let key = address.to_string().to_lowercase();
        let mut response: HashMap<String, Vec<FarcasterUser>> = self
            .get("/farcaster/user/bulk-by-address", &[("addresses", key.clone())])
            .await?;
        let users = response
            .drain()
            .find(|(k, _)| k.to_lowercase() == key)
            .map(|(_, users)| users)
            .unwrap_or_default();
        Ok(users)
    }
}

/// Normalise a handle: trim, strip a leading `@`, lowercase.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

/// Split a comma-separated handle list, dropping empties.
pub fn parse_handle_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(normalize_handle)
        .filter(|h| !h.is_empty())
        .collect()
}

/// Resolve handles to addresses, in request order. Unknown handles are skipped.
#[instrument(skip(api))]
pub async fn resolve_usernames(
    api: &dyn IdentityApi,
    usernames: &[String],
) -> Result<Vec<ResolvedParticipant>, IdentityError> {
    let handles: Vec<String> = usernames.iter().map(|h| normalize_handle(h)).collect();
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    let users = api.users_by_username(&handles).await.map_err(|e| {
        error!("Error resolving usernames: {}", e);
        e
    })?;
    let by_handle: HashMap<String, &FarcasterUser> =
        users.iter().map(|u| (u.username.to_lowercase(), u)).collect();

    let mut resolved = Vec::with_capacity(handles.len());
    for handle in &handles {
        match by_handle.get(handle) {
            Some(user) => resolved.push(ResolvedParticipant {
                handle: user.username.clone(),
                fid: user.fid,
                address: user.preferred_address(),
            }),
            None => warn!(handle = %handle, "Handle did not resolve"),
        }
    }
    info!(requested = handles.len(), resolved = resolved.len(), "Resolved handles");
    Ok(resolved)
}

/// One user by fid.
pub async fn user_by_fid(api: &dyn IdentityApi, fid: u64) -> Result<FarcasterUser, IdentityError> {
    api.users_by_fid(&[fid])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| IdentityError::NotFound(format!("fid {}", fid)))
}

/// First user verified for `address`. Lookup failures are logged and read as `None`.
pub async fn user_by_address(api: &dyn IdentityApi, address: Address) -> Option<FarcasterUser> {
    match api.users_by_address(address).await {
        Ok(users) => users.into_iter().next(),
        Err(e) => {
            warn!("Error fetching user by address: {}", e);
            None
        }
    }
}
