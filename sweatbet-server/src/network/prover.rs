//! Remote Prover Client
//!
//! Builds notarised web-proof requests for a single activity, runs them
//! against the hosted prover, compresses the result and packages it as a
//! [`ProofArtifact`] ready for `submitZKProof`.
//!
//! ## Redaction
//!
//! The notarised response keeps only the fields needed to judge the wager.
//! GPS traces, splits, photos and the athlete id never leave the prover.

use std::fmt;

use alloy_primitives::{Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::core::config::ProverConfig;
use crate::network::strava::{AccessToken, FitnessApi, StravaError};

/// Response fields removed from the notarised transcript.
pub const REDACTED_FIELDS: [&str; 9] = [
    "map",
    "segment_efforts",
    "splits_metric",
    "splits_standard",
    "laps",
    "best_efforts",
    "photos",
    "athlete.id",
    "athlete.resource_state",
];

/// Response fields disclosed in the proof.
pub const DISCLOSED_FIELDS: [&str; 5] = [
    "distance",
    "moving_time",
    "type",
    "start_date",
    "start_date_local",
];

/// Prover errors.
#[derive(Debug, Error)]
pub enum ProverError {
    /// API key is not configured.
    #[error("VLAYER_API_KEY is not configured")]
    NotConfigured,
    /// Transport or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-2xx response.
    #[error("prover rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// Compressed proof is not valid hex.
    #[error("malformed compressed proof: {0}")]
    MalformedProof(#[from] hex::FromHexError),
    /// Activity detail fetch failed.
    #[error("activity fetch failed: {0}")]
    Activity(#[from] StravaError),
}

// =============================================================================
// REQUEST
// =============================================================================

/// Request headers forwarded to the notarised endpoint.
#[derive(Clone, Serialize)]
pub struct ForwardedHeaders {
    /// `Bearer <token>`.
    #[serde(rename = "Authorization")]
    pub authorization: String,
}

/// Field selection applied to the notarised response.
#[derive(Clone, Debug, Serialize)]
pub struct FieldPolicy {
    /// Fields removed.
    pub exclude: Vec<String>,
    /// Fields kept.
    pub include: Vec<String>,
}

/// Redaction block of a prove request.
#[derive(Clone, Debug, Serialize)]
pub struct Redaction {
    /// Policy applied to the response body.
    pub response: FieldPolicy,
}

/// Body of `POST /prove`.
#[derive(Clone, Serialize)]
pub struct ProveRequest {
    /// Endpoint to notarise.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Headers sent to the endpoint.
    pub headers: ForwardedHeaders,
    /// Always true.
    pub notarize: bool,
    /// Redaction policy.
    pub redact: Redaction,
}

impl ProveRequest {
    /// Notarised GET of one activity's detail with the fixed redaction policy.
    pub fn for_activity(fitness: &dyn FitnessApi, token: &AccessToken, activity_id: u64) -> Self {
        Self {
            url: fitness.activity_url(activity_id),
            method: "GET".into(),
            headers: ForwardedHeaders {
                authorization: format!("Bearer {}", token.secret()),
            },
            notarize: true,
            redact: Redaction {
                response: FieldPolicy {
                    exclude: REDACTED_FIELDS.iter().map(|s| s.to_string()).collect(),
                    include: DISCLOSED_FIELDS.iter().map(|s| s.to_string()).collect(),
                },
            },
        }
    }
}

impl fmt::Debug for ProveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProveRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("notarize", &self.notarize)
            .field("redact", &self.redact)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ProveResponse {
    proof: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompressRequest<'a> {
    web_proof: &'a serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompressResponse {
    compressed_proof: String,
}

// =============================================================================
// ARTIFACT
// =============================================================================

/// Public claim attached to a proof.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofClaim {
    /// Distance in meters, as recorded.
    pub distance: f64,
    /// Sport type.
    pub activity_type: String,
    /// Activity start (RFC 3339).
    pub date: String,
}

/// Compressed proof plus its claim.
#[derive(Clone, Debug, PartialEq)]
pub struct ProofArtifact {
    /// Compressed proof bytes passed to the escrow.
    pub proof: Bytes,
    /// Disclosed claim.
    pub claim: ProofClaim,
}

impl ProofArtifact {
    /// Whole meters submitted on-chain (fraction truncated).
    pub fn claimed_distance(&self) -> u64 {
        if self.claim.distance.is_finite() && self.claim.distance > 0.0 {
            self.claim.distance.floor() as u64
        } else {
            0
        }
    }

    /// [`Self::claimed_distance`] in ABI form.
    pub fn claimed_distance_u256(&self) -> U256 {
        U256::from(self.claimed_distance())
    }

    /// SHA-256 of the proof bytes (hex), for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.proof))
    }
}

/// Decode a compressed proof, with or without `0x`.
pub fn decode_proof_bytes(compressed: &str) -> Result<Bytes, ProverError> {
    let trimmed = compressed.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    Ok(Bytes::from(hex::decode(digits)?))
}

// =============================================================================
// SERVICE
// =============================================================================

/// Remote prover operations.
#[async_trait]
pub trait ProofService: Send + Sync {
    /// Run a notarised request, returning the raw web proof.
    async fn prove(&self, request: &ProveRequest) -> Result<serde_json::Value, ProverError>;

    /// Compress a raw web proof to the on-chain form (hex string).
    async fn compress(&self, web_proof: &serde_json::Value) -> Result<String, ProverError>;
}

/// Hosted vlayer prover.
pub struct VlayerClient {
    config: ProverConfig,
    http: reqwest::Client,
}

impl VlayerClient {
    /// Create a client.
    pub fn new(config: ProverConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, ProverError> {
        self.config.api_key.as_deref().ok_or(ProverError::NotConfigured)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProverError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .header("X-API-Key", self.api_key()?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProverError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProofService for VlayerClient {
    #[instrument(skip_all, fields(url = %request.url))]
    async fn prove(&self, request: &ProveRequest) -> Result<serde_json::Value, ProverError> {
        let response: ProveResponse = self.post("prove", request).await?;
        Ok(response.proof)
    }

    #[instrument(skip_all)]
    async fn compress(&self, web_proof: &serde_json::Value) -> Result<String, ProverError> {
        let response: CompressResponse = self
            .post("compress-web-proof", &CompressRequest { web_proof })
            .await?;
        Ok(response.compressed_proof)
    }
}

/// Detail fetch, prove, compress.
#[instrument(skip(fitness, prover, token))]
pub async fn generate_proof(
    fitness: &dyn FitnessApi,
    prover: &dyn ProofService,
    token: &AccessToken,
    activity_id: u64,
) -> Result<ProofArtifact, ProverError> {
    let activity = fitness.get_activity(token, activity_id).await?;

    let request = ProveRequest::for_activity(fitness, token, activity_id);
    info!("Requesting web proof");
    let web_proof = prover.prove(&request).await.map_err(|e| {
        error!("Error generating ZK proof: {}", e);
        e
    })?;

    let compressed = prover.compress(&web_proof).await?;
    let proof = decode_proof_bytes(&compressed)?;

    let artifact = ProofArtifact {
        proof,
        claim: ProofClaim {
            distance: activity.distance,
            activity_type: activity.activity_type,
            date: activity.start_date.to_rfc3339(),
        },
    };
    info!(
        fingerprint = %artifact.fingerprint(),
        claimed_distance = artifact.claimed_distance(),
        "Proof generated"
    );
    Ok(artifact)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::strava::tests::FakeFitness;
    use crate::wager::activity::tests::activity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Prover that returns a fixed proof, or fails.
    #[derive(Default)]
    pub(crate) struct FakeProver {
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ProofService for FakeProver {
        async fn prove(&self, request: &ProveRequest) -> Result<serde_json::Value, ProverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProverError::Rejected {
                    status: 500,
                    body: "prover unavailable".into(),
                });
            }
            Ok(serde_json::json!({ "url": request.url, "presentation": "00" }))
        }

        async fn compress(&self, _web_proof: &serde_json::Value) -> Result<String, ProverError> {
            Ok("0xdeadbeef".into())
        }
    }

    #[test]
    fn test_request_carries_redaction_policy() {
        let fitness = FakeFitness::default();
        let token = AccessToken::new("secret-token");
        let request = ProveRequest::for_activity(&fitness, &token, 99);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["url"], "https://www.strava.com/api/v3/activities/99");
        assert_eq!(json["method"], "GET");
        assert_eq!(json["notarize"], true);
        assert_eq!(json["headers"]["Authorization"], "Bearer secret-token");
        assert_eq!(json["redact"]["response"]["exclude"].as_array().unwrap().len(), 9);
        assert_eq!(json["redact"]["response"]["include"][0], "distance");
    }

    #[test]
    fn test_request_debug_hides_credential() {
        let fitness = FakeFitness::default();
        let request = ProveRequest::for_activity(&fitness, &AccessToken::new("secret-token"), 1);
        assert!(!format!("{:?}", request).contains("secret-token"));
    }

    #[test]
    fn test_claimed_distance_truncates() {
        let artifact = ProofArtifact {
            proof: Bytes::from(vec![1, 2, 3]),
            claim: ProofClaim {
                distance: 5234.9,
                activity_type: "Run".into(),
                date: "2024-05-01T06:30:00+00:00".into(),
            },
        };
        assert_eq!(artifact.claimed_distance(), 5234);
        assert_eq!(artifact.claimed_distance_u256(), U256::from(5234u64));
        assert_eq!(artifact.fingerprint().len(), 64);
    }

    #[test]
    fn test_decode_proof_bytes() {
        assert_eq!(decode_proof_bytes("0xdeadbeef").unwrap().to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decode_proof_bytes("0102").unwrap().to_vec(), vec![1, 2]);
        assert!(matches!(decode_proof_bytes("0xzz"), Err(ProverError::MalformedProof(_))));
    }

    #[tokio::test]
    async fn test_generate_proof() {
        let fitness = FakeFitness::with_activities(vec![activity(5, 6200.7, "Run", 1_000)]);
        let prover = FakeProver::default();

        let artifact = generate_proof(&fitness, &prover, &AccessToken::new("t"), 5)
            .await
            .unwrap();

        assert_eq!(artifact.proof.to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(artifact.claimed_distance(), 6200);
        assert_eq!(artifact.claim.activity_type, "Run");
        assert_eq!(prover.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generate_proof_unknown_activity() {
        let fitness = FakeFitness::default();
        let prover = FakeProver::default();

        let result = generate_proof(&fitness, &prover, &AccessToken::new("t"), 5).await;
        assert!(matches!(result, Err(ProverError::Activity(_))));
        assert_eq!(prover.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = VlayerClient::new(ProverConfig::default());
        let result = client.compress(&serde_json::json!({})).await;
        assert!(matches!(result, Err(ProverError::NotConfigured)));
    }
}
