//! HTTP client for the external business service: trust scoring,
//! registration and the valid-peer listing.
//!
//! All calls carry `Authorization: Bearer <credential>` when a credential is
//! present. A 401 or 403 surfaces as [`ValidatorError::AuthExpired`] so the
//! caller can invalidate its token; any other non-success status is a
//! [`ValidatorError::ValidationServiceError`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::auth::redact;
use crate::error::ValidatorError;
use crate::messages::{
    ListedPeer, RegisterRequest, RegisterResponse, ValidateRequest, ValidateResponse,
};
use crate::protocols::{PeerListing, RegistrationService, TrustScorer};

pub const VALIDATE_PATH: &str = "/sapi/node/task/validate";
pub const REGISTER_PATH: &str = "/sapi/node/neuron/register";
pub const LIST_VALID_PATH: &str = "/sapi/node/neuron/list-valid";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServiceApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ServiceApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder, credential: &str) -> reqwest::RequestBuilder {
        if credential.is_empty() {
            request
        } else {
            request.bearer_auth(credential)
        }
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(path, status = status.as_u16(), "credential rejected");
            return Err(ValidatorError::AuthExpired.into());
        }
        if !status.is_success() {
            return Err(ValidatorError::ValidationServiceError(format!("{path} returned HTTP {status}")).into());
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ValidatorError::InvalidResponse(format!("{path}: {e}")).into())
    }
}

#[async_trait]
impl TrustScorer for ServiceApiClient {
    async fn validate(&self, credential: &str, request: &ValidateRequest) -> Result<ValidateResponse> {
        trace!(uids = request.uids.len(), token = %redact(credential), "submitting round for scoring");
        let response = self
            .authorize(self.client.post(self.url(VALIDATE_PATH)), credential)
            .json(request)
            .send()
            .await
            .context("validate request failed")?;
        Self::decode(VALIDATE_PATH, response).await
    }
}

#[async_trait]
impl RegistrationService for ServiceApiClient {
    async fn register(&self, credential: &str, request: &RegisterRequest) -> Result<RegisterResponse> {
        trace!(uid = request.uid, "registering with service");
        let response = self
            .authorize(self.client.post(self.url(REGISTER_PATH)), credential)
            .json(request)
            .send()
            .await
            .context("register request failed")?;
        Self::decode(REGISTER_PATH, response).await
    }
}

#[async_trait]
impl PeerListing for ServiceApiClient {
    async fn list_valid(&self, credential: &str) -> Result<Vec<ListedPeer>> {
        let response = self
            .authorize(self.client.get(self.url(LIST_VALID_PATH)), credential)
            .send()
            .await
            .context("list-valid request failed")?;
        Self::decode(LIST_VALID_PATH, response).await
    }
}
