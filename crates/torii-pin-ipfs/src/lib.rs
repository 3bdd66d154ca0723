//! Content store backed by an IPFS node's RPC API (Kubo `/api/v0`).
//!
//! Every RPC is a `POST`. Errors come back as non-2xx responses with a JSON body
//! `{"Message": "...", "Code": 0, "Type": "error"}`.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use torii_pin::etl::sink::{ContentStore, PinOutcome, UnpinOutcome};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum IpfsError {
    #[error("Invalid IPFS API url '{0}': {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("IPFS request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IPFS API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl IpfsError {
    /// Kubo answers `pin/rm` on an unpinned object with an error, which is a no-op for us.
    pub fn is_not_pinned(&self) -> bool {
        matches!(self, Self::Api { message, .. } if message.contains("not pinned"))
    }
}

#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// Base URL of the RPC API, e.g. `http://127.0.0.1:5001`.
    pub api_url: String,
    pub timeout: Duration,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5001".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct PinsResponse {
    #[serde(rename = "Pins", default)]
    pins: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct VersionResponse {
    #[serde(rename = "Version")]
    pub version: String,
}

pub struct IpfsClient {
    base: Url,
    client: Client,
}

impl IpfsClient {
    pub fn new(config: IpfsConfig) -> Result<Self, IpfsError> {
        // A trailing slash keeps any path prefix when joining endpoints.
        let raw = if config.api_url.ends_with('/') {
            config.api_url.clone()
        } else {
            format!("{}/", config.api_url)
        };
        let base = Url::parse(&raw).map_err(|e| IpfsError::InvalidUrl(config.api_url, e))?;

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str, arg: Option<&str>) -> Result<Url, IpfsError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| IpfsError::InvalidUrl(path.to_string(), e))?;
        if let Some(arg) = arg {
            url.query_pairs_mut().append_pair("arg", arg);
        }
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, IpfsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await?;
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(IpfsError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Add bytes without pinning them. Returns the CIDv0 (base58 multihash).
    pub async fn add(&self, data: &[u8]) -> Result<String, IpfsError> {
        let mut url = self.endpoint("api/v0/add", None)?;
        url.query_pairs_mut()
            .append_pair("pin", "false")
            .append_pair("cid-version", "0");

        let form = Form::new().part("file", Part::bytes(data.to_vec()).file_name("data"));
        let response = self.client.post(url).multipart(form).send().await?;
        let added: AddResponse = Self::decode(response).await?;
        Ok(added.hash)
    }

    /// Recursively pin `cid`. Pinning an already pinned object succeeds.
    pub async fn pin_add(&self, cid: &str) -> Result<Vec<String>, IpfsError> {
        let url = self.endpoint("api/v0/pin/add", Some(cid))?;
        let response = self.client.post(url).send().await?;
        let pins: PinsResponse = Self::decode(response).await?;
        Ok(pins.pins)
    }

    pub async fn pin_rm(&self, cid: &str) -> Result<Vec<String>, IpfsError> {
        let url = self.endpoint("api/v0/pin/rm", Some(cid))?;
        let response = self.client.post(url).send().await?;
        let pins: PinsResponse = Self::decode(response).await?;
        Ok(pins.pins)
    }

    pub async fn version(&self) -> Result<VersionResponse, IpfsError> {
        let url = self.endpoint("api/v0/version", None)?;
        let response = self.client.post(url).send().await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl ContentStore for IpfsClient {
    async fn put(&self, data: &[u8]) -> anyhow::Result<String> {
        Ok(self.add(data).await?)
    }

    async fn pin(&self, multihash: &str) -> anyhow::Result<PinOutcome> {
        self.pin_add(multihash).await?;
        tracing::debug!(target: "torii_pin_ipfs", cid = multihash, "Pinned");
        Ok(PinOutcome::Pinned)
    }

    async fn unpin(&self, multihash: &str) -> anyhow::Result<UnpinOutcome> {
        match self.pin_rm(multihash).await {
            Ok(_) => {
                tracing::debug!(target: "torii_pin_ipfs", cid = multihash, "Unpinned");
                Ok(UnpinOutcome::Unpinned)
            }
            Err(e) if e.is_not_pinned() => Ok(UnpinOutcome::NotPinned),
            Err(e) => Err(e.into()),
        }
    }
}
