// =============================================================================
// Live broker REST client — checksum-authenticated, form-encoded requests
// =============================================================================
//
// SECURITY: the API secret is only ever fed into the SHA-256 session
// checksum; it is never logged, serialised, or sent after login. All
// requests carry the `Authorization: token api_key:access_token` header.
//
// Every call funnels through `request_json`, which enforces three gates in
// order: the circuit breaker (short-circuits BEFORE the execution stack's
// retry policy ever runs), the local rate-limit guard, then the wire call.
// Broker error text is surfaced verbatim in the returned error so the retry
// classifier can bucket it by substring ("rate limit", "insufficient",
// "network", ...).
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{ApiCircuitBreaker, BreakerConfig};

use super::rate_limit::RateLimitTracker;
use super::{
    BrokerClient, BrokerOrderArgs, BrokerPosition, OrderRecord, BROKER_CALL_TIMEOUT,
    VARIETY_REGULAR,
};

const DEFAULT_BASE_URL: &str = "https://api.kite.trade";

/// REST client for the live broker API.
pub struct KiteBrokerClient {
    api_key: String,
    access_token: String,
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimitTracker,
    breaker: ApiCircuitBreaker,
}

impl KiteBrokerClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client from an api key and a previously exchanged access
    /// token.
    pub fn new(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let access_token = access_token.into();

        let mut default_headers = HeaderMap::new();
        default_headers.insert("X-Kite-Version", HeaderValue::from_static("3"));
        if let Ok(val) = HeaderValue::from_str(&format!("token {api_key}:{access_token}")) {
            default_headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(BROKER_CALL_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = DEFAULT_BASE_URL, "broker client initialised");

        Self {
            api_key,
            access_token,
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            limiter: RateLimitTracker::new(),
            breaker: ApiCircuitBreaker::new(BreakerConfig::default()),
        }
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &ApiCircuitBreaker {
        &self.breaker
    }

    // -------------------------------------------------------------------------
    // Session login
    // -------------------------------------------------------------------------

    /// SHA-256 checksum over api_key + request_token + api_secret, hex
    /// encoded — the broker's session-exchange signature.
    pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hasher.update(request_token.as_bytes());
        hasher.update(api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Exchange a login `request_token` for an access token.
    #[instrument(skip(self, request_token, api_secret), name = "broker::generate_session")]
    pub async fn generate_session(
        &mut self,
        request_token: &str,
        api_secret: &str,
    ) -> Result<String> {
        let checksum = Self::session_checksum(&self.api_key, request_token, api_secret);
        let url = format!("{}/session/token", self.base_url);
        let request = self.client.post(&url).form(&[
            ("api_key", self.api_key.as_str()),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ]);

        let body = self.request_json(request, "POST /session/token").await?;
        let access_token = body["access_token"]
            .as_str()
            .context("session response missing access_token")?
            .to_string();

        self.access_token = access_token.clone();
        debug!("broker session established");
        Ok(access_token)
    }

    // -------------------------------------------------------------------------
    // Internal plumbing
    // -------------------------------------------------------------------------

    /// Single choke point for every wire call: breaker gate → local rate
    /// limit → send → envelope parse, with breaker bookkeeping on the
    /// outcome. Locally-rejected calls never count as breaker failures.
    async fn request_json(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        if !self.breaker.can_execute() {
            anyhow::bail!("circuit breaker {} — {what} blocked", self.breaker.state());
        }
        if !self.limiter.can_send_request() {
            anyhow::bail!("local rate limit guard: request quota exhausted for {what}");
        }
        self.limiter.record_request();

        let outcome = async {
            let resp = request
                .send()
                .await
                .with_context(|| format!("{what} request failed"))?;
            Self::parse_envelope(resp).await
        }
        .await;

        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        outcome
    }

    /// Unwrap the broker's `{status, data}` envelope, surfacing error text
    /// for the retry classifier.
    async fn parse_envelope(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.context("failed to parse broker response")?;

        if !status.is_success() || body["status"].as_str() == Some("error") {
            let message = body["message"].as_str().unwrap_or("unknown broker error");
            let error_type = body["error_type"].as_str().unwrap_or("GeneralException");
            anyhow::bail!("broker returned {status}: {error_type}: {message}");
        }

        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_num_f64(val: &Value) -> f64 {
        if let Some(n) = val.as_f64() {
            n
        } else if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[async_trait]
impl BrokerClient for KiteBrokerClient {
    #[instrument(skip(self, args), fields(tradingsymbol = %args.tradingsymbol), name = "broker::place_order")]
    async fn place_order(&self, args: &BrokerOrderArgs) -> Result<String> {
        if !self.limiter.can_place_order() {
            anyhow::bail!("local rate limit guard: order quota exhausted");
        }

        let url = format!("{}/orders/{}", self.base_url, VARIETY_REGULAR);

        let mut form: Vec<(&str, String)> = vec![
            ("exchange", args.exchange.as_str().to_string()),
            ("tradingsymbol", args.tradingsymbol.clone()),
            ("transaction_type", args.transaction_type.as_str().to_string()),
            ("quantity", args.quantity.to_string()),
            ("product", args.product.as_str().to_string()),
            ("order_type", args.order_type.as_str().to_string()),
            ("validity", "DAY".to_string()),
        ];
        if let Some(price) = args.price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger) = args.trigger_price {
            form.push(("trigger_price", trigger.to_string()));
        }

        debug!(
            side = %args.transaction_type,
            order_type = %args.order_type,
            quantity = args.quantity,
            "placing order"
        );

        let request = self.client.post(&url).form(&form);
        let data = self.request_json(request, "POST /orders").await?;
        self.limiter.record_order_sent();

        let order_id = data["order_id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| data["order_id"].as_u64().map(|n| n.to_string()))
            .context("order response missing order_id")?;

        debug!(order_id = %order_id, "order placed");
        Ok(order_id)
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/orders/{}/{}", self.base_url, VARIETY_REGULAR, order_id);
        self.request_json(self.client.delete(&url), "DELETE /orders")
            .await?;
        debug!(order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::positions")]
    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/portfolio/positions", self.base_url);
        let data = self
            .request_json(self.client.get(&url), "GET /portfolio/positions")
            .await?;
        let net = data["net"].as_array().cloned().unwrap_or_default();

        let mut positions = Vec::with_capacity(net.len());
        for entry in net {
            match serde_json::from_value::<BrokerPosition>(entry.clone()) {
                Ok(mut pos) => {
                    // Some fields occasionally come back as strings.
                    if pos.average_price == 0.0 {
                        pos.average_price = Self::parse_num_f64(&entry["average_price"]);
                    }
                    if pos.last_price == 0.0 {
                        pos.last_price = Self::parse_num_f64(&entry["last_price"]);
                    }
                    positions.push(pos);
                }
                Err(err) => {
                    warn!(error = %err, "skipping unparseable position row");
                }
            }
        }

        debug!(count = positions.len(), "positions retrieved");
        Ok(positions)
    }

    #[instrument(skip(self), name = "broker::orders")]
    async fn orders(&self) -> Result<Vec<OrderRecord>> {
        let url = format!("{}/orders", self.base_url);
        let data = self.request_json(self.client.get(&url), "GET /orders").await?;
        let rows = data.as_array().cloned().unwrap_or_default();

        let mut orders = Vec::with_capacity(rows.len());
        for entry in rows {
            match serde_json::from_value::<OrderRecord>(entry) {
                Ok(order) => orders.push(order),
                Err(err) => {
                    // Transitional statuses outside our model are skipped;
                    // the next poll will pick the order up once settled.
                    warn!(error = %err, "skipping unparseable order row");
                }
            }
        }

        debug!(count = orders.len(), "orders retrieved");
        Ok(orders)
    }

    #[instrument(skip(self), name = "broker::profile")]
    async fn profile(&self) -> Result<Value> {
        let url = format!("{}/user/profile", self.base_url);
        self.request_json(self.client.get(&url), "GET /user/profile")
            .await
    }

    #[instrument(skip(self), name = "broker::margins")]
    async fn margins(&self) -> Result<Value> {
        let url = format!("{}/user/margins", self.base_url);
        self.request_json(self.client.get(&url), "GET /user/margins")
            .await
    }
}

impl std::fmt::Debug for KiteBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteBrokerClient")
            .field("api_key", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}
