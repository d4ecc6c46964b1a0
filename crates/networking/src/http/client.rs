//! PostgREST client for claim and offer rows

use crate::api::BackendApi;
use async_trait::async_trait;
use claimsync_core::{
    BackendConfig, ClaimId, ClaimRow, Error, FlashOffer, OfferId, Result, UserId,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER},
    Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// HTTP client for the hosted backend's REST interface
///
/// Sends the project's anon key as `apikey` and the user's access token
/// as a bearer token on every request.
pub struct SupabaseClient {
    http: Client,
    config: BackendConfig,
}

impl SupabaseClient {
    /// Create a new client from backend configuration
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::NetworkError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.config.anon_key)
                .map_err(|e| Error::InvalidArgument(format!("anon key: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.bearer_token()))
                .map_err(|e| Error::InvalidArgument(format!("access token: {}", e)))?,
        );
        Ok(headers)
    }

    /// Map non-success statuses onto the error taxonomy
    fn check_status(response: &Response) -> Option<Error> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(Error::AuthenticationRequired),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                Some(Error::RateLimitExceeded {
                    message: "Too many requests to the backend".to_string(),
                    retry_after_secs,
                })
            }
            s if s.is_server_error() => Some(Error::NetworkError(format!("server error: {}", s))),
            s if !s.is_success() => Some(Error::ApiError(format!("unexpected status: {}", s))),
            _ => None,
        }
    }

    /// Run a `select=*` query with `column=eq.value` filters
    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        order: Option<&str>,
    ) -> Result<Vec<T>> {
        let url = format!("{}/{}", self.config.rest_url(), table);

        let mut query: Vec<(&str, String)> = vec![("select", "*".to_string())];
        query.extend(filters.iter().map(|(col, val)| (*col, format!("eq.{}", val))));
        if let Some(order) = order {
            query.push(("order", order.to_string()));
        }

        debug!("GET {} {:?}", url, query);

        let response = self
            .http
            .get(&url)
            .headers(self.default_headers()?)
            .query(&query)
            .send()
            .await?;

        if let Some(err) = Self::check_status(&response) {
            warn!("Request to {} failed: {}", table, err);
            return Err(err);
        }

        response.json::<Vec<T>>().await.map_err(|e| {
            error!("Failed to parse {} rows: {}", table, e);
            Error::InvalidData(e.to_string())
        })
    }
}

#[async_trait]
impl BackendApi for SupabaseClient {
    #[instrument(skip(self), fields(claim_id = %claim_id))]
    async fn fetch_claim(&self, claim_id: &ClaimId) -> Result<Option<ClaimRow>> {
        let rows: Vec<ClaimRow> = self
            .select(
                &self.config.claims_table,
                &[("id", claim_id.to_string())],
                None,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn fetch_user_claims(&self, user_id: &UserId) -> Result<Vec<ClaimRow>> {
        let rows: Vec<ClaimRow> = self
            .select(
                &self.config.claims_table,
                &[("user_id", user_id.to_string())],
                Some("updated_at.desc"),
            )
            .await?;
        debug!("Fetched {} claims", rows.len());
        Ok(rows)
    }

    #[instrument(skip(self), fields(offer_id = %offer_id))]
    async fn fetch_offer(&self, offer_id: &OfferId) -> Result<Option<FlashOffer>> {
        let rows: Vec<FlashOffer> = self
            .select(
                &self.config.offers_table,
                &[("id", offer_id.to_string())],
                None,
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        // Any HTTP answer at all means the backend is reachable
        let response = self
            .http
            .get(format!("{}/", self.config.rest_url()))
            .headers(self.default_headers()?)
            .send()
            .await?;
        debug!("Ping status: {}", response.status());
        Ok(())
    }
}
