//! HTTP client for the beacon node REST API.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::{
    api::{
        ApiResponse, BeaconApi, BeaconBlock, FinalityCheckpoints, Genesis, SignedBeaconBlock,
        ValidatorId, ValidatorState, ValidatorStatus,
    },
    config::BeaconConfig,
    error::{Error, Result},
    util::RateLimiter,
};

/// Beacon node HTTP API client.
///
/// Every request waits on a shared [`RateLimiter`] and is retried on
/// connection failures, `429` and `5xx` responses. Callers see only the
/// final outcome.
#[derive(Clone)]
pub struct BeaconClient {
    url: Url,
    http_client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    retry_delay: Duration,
}

impl BeaconClient {
    /// Create a new beacon client.
    pub fn new(url: Url, config: &BeaconConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            url: with_trailing_slash(url),
            http_client,
            limiter: Arc::new(RateLimiter::new(
                config.max_requests_per_period,
                Duration::from_millis(config.rate_limit_period_ms),
            )),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Return url of the beacon node.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// GET `path` and decode the `data` field of the response.
    ///
    /// Returns `None` on `404`.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.url.join(path)?;
        let mut attempt = 0;

        loop {
            self.limiter.acquire().await;

            let error = match self.http_client.get(url.clone()).send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    debug!(url = %url, "Beacon API returned 404");
                    return Ok(None);
                }
                Ok(response) if response.status().is_success() => {
                    let body: ApiResponse<T> = response.json().await?;
                    return Ok(Some(body.data));
                }
                Ok(response) => {
                    let status = response.status();
                    let error = Error::Api {
                        status: status.as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    };
                    if !is_retryable_status(status) {
                        return Err(error);
                    }
                    error
                }
                Err(e) if e.is_connect() || e.is_timeout() => Error::Http(e),
                Err(e) => return Err(e.into()),
            };

            if attempt >= self.max_retries {
                return Err(error);
            }
            attempt += 1;
            warn!(url = %url, attempt, error = %error, "Beacon API request failed, retrying");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Like [`Self::get`] but treats `404` as an error.
    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.ok_or_else(|| Error::Api {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("{path} not found"),
        })
    }
}

#[async_trait]
impl BeaconApi for BeaconClient {
    async fn get_head_block(&self) -> Result<BeaconBlock> {
        let block: SignedBeaconBlock = self.get_required("eth/v2/beacon/blocks/head").await?;
        Ok(block.message)
    }

    async fn get_block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        let block: Option<SignedBeaconBlock> =
            self.get(&format!("eth/v2/beacon/blocks/{slot}")).await?;
        Ok(block.map(|block| block.message))
    }

    async fn get_validators(
        &self,
        status: Option<ValidatorStatus>,
        ids: Option<&[ValidatorId]>,
    ) -> Result<Vec<ValidatorState>> {
        if ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }
        self.get_required(&validators_path(status, ids)).await
    }

    async fn get_validator(&self, index: u64) -> Result<Option<ValidatorState>> {
        self.get(&format!("eth/v1/beacon/states/head/validators/{index}"))
            .await
    }

    async fn get_genesis(&self) -> Result<Genesis> {
        self.get_required("eth/v1/beacon/genesis").await
    }

    async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints> {
        self.get_required("eth/v1/beacon/states/head/finality_checkpoints")
            .await
    }
}

/// Relative path of the validators query for the head state.
///
/// Indices and pubkeys may be mixed in one `id` list.
fn validators_path(status: Option<ValidatorStatus>, ids: Option<&[ValidatorId]>) -> String {
    let mut query = Vec::new();
    if let Some(ids) = ids {
        let ids: Vec<String> = ids.iter().map(ValidatorId::to_string).collect();
        query.push(format!("id={}", ids.join(",")));
    }
    if let Some(status) = status {
        query.push(format!("status={status}"));
    }

    let mut path = "eth/v1/beacon/states/head/validators".to_string();
    if !query.is_empty() {
        path.push('?');
        path.push_str(&query.join("&"));
    }
    path
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `Url::join` drops the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use exit_queue_types::BlsPublicKey;
    use reqwest::StatusCode;
    use url::Url;

    use super::{BeaconClient, is_retryable_status, validators_path, with_trailing_slash};
    use crate::{
        api::{BeaconApi, ValidatorId, ValidatorStatus},
        config::BeaconConfig,
    };

    #[test]
    fn validators_path_batches_ids_into_one_query() {
        let ids = [
            ValidatorId::Index(42),
            ValidatorId::Index(7),
            ValidatorId::Index(1000),
        ];
        assert_eq!(
            validators_path(None, Some(&ids)),
            "eth/v1/beacon/states/head/validators?id=42,7,1000"
        );
    }

    #[test]
    fn validators_path_mixes_indices_and_pubkeys() {
        let ids = [
            ValidatorId::Index(42),
            ValidatorId::Pubkey(BlsPublicKey::repeat_byte(0xab)),
        ];
        assert_eq!(
            validators_path(None, Some(&ids)),
            format!(
                "eth/v1/beacon/states/head/validators?id=42,0x{}",
                "ab".repeat(48)
            )
        );
    }

    #[test]
    fn validators_path_with_status_filter() {
        assert_eq!(
            validators_path(Some(ValidatorStatus::ActiveExiting), None),
            "eth/v1/beacon/states/head/validators?status=active_exiting"
        );
        assert_eq!(
            validators_path(Some(ValidatorStatus::ActiveOngoing), Some(&[ValidatorId::Index(1)])),
            "eth/v1/beacon/states/head/validators?id=1&status=active_ongoing"
        );
        assert_eq!(
            validators_path(None, None),
            "eth/v1/beacon/states/head/validators"
        );
    }

    #[test]
    fn base_url_keeps_path_prefix() {
        let url = with_trailing_slash(Url::parse("https://node.example/key123").unwrap());
        assert_eq!(
            url.join("eth/v1/beacon/genesis").unwrap().as_str(),
            "https://node.example/key123/eth/v1/beacon/genesis"
        );

        let url = with_trailing_slash(Url::parse("http://localhost:5052/").unwrap());
        assert_eq!(
            url.join("eth/v1/beacon/genesis").unwrap().as_str(),
            "http://localhost:5052/eth/v1/beacon/genesis"
        );
    }

    #[test]
    fn client_reports_normalized_endpoint() {
        let client = BeaconClient::new(
            Url::parse("https://node.example/key123").unwrap(),
            &BeaconConfig::default(),
        )
        .unwrap();
        assert_eq!(client.url().as_str(), "https://node.example/key123/");
    }

    #[test]
    fn retries_only_throttling_and_server_errors() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn empty_id_filter_does_not_query_the_node() {
        // Nothing listens on this port; any request would fail.
        let client = BeaconClient::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            &BeaconConfig::default(),
        )
        .unwrap();
        let validators = client.get_validators(None, Some(&[])).await.unwrap();
        assert!(validators.is_empty());
    }
}
