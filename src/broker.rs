//! C9: the broker contract the core consumes, plus a paper and a live
//! implementation.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    #[serde(rename = "SL-M")]
    SlM,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    Intraday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub security_id: String,
    pub exch_seg: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub product_type: ProductType,
}

/// Normalized response the core interprets. The raw broker reply carries
/// synonymous keys (`filled_quantity`/`filledQty`/`filled_qty`;
/// `avg_price`/`filled_price`/`avgPrice`); normalization happens once, at
/// this boundary, so downstream code only ever sees this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerOrderResponse {
    pub status: Option<String>,
    pub order_id: Option<String>,
    pub filled_quantity: Option<f64>,
    pub avg_price: Option<f64>,
}

impl BrokerOrderResponse {
    /// True when the response indicates an immediate fill: an explicit
    /// terminal status, or both fill quantity and average price present.
    pub fn indicates_fill(&self) -> bool {
        let status_says_filled = matches!(
            self.status.as_deref(),
            Some("filled") | Some("complete") | Some("filled_with_trade")
        );
        status_says_filled || (self.filled_quantity.is_some() && self.avg_price.is_some())
    }

    pub fn indicates_rejection(&self) -> bool {
        matches!(self.status.as_deref(), Some("rejected") | Some("failed"))
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Parses a raw JSON broker reply into the normalized shape, tolerating the
/// documented key synonyms.
pub fn normalize_broker_response(raw: &serde_json::Value) -> BrokerOrderResponse {
    let status = raw.get("status").and_then(|v| v.as_str()).map(String::from);
    let order_id = ["order_id", "orderId", "orderID"]
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(|v| v.as_str())
        .map(String::from);
    let filled_quantity = ["filled_quantity", "filledQty", "filled_qty"]
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(numeric_value);
    let avg_price = ["avg_price", "filled_price", "avgPrice"]
        .iter()
        .find_map(|key| raw.get(*key))
        .and_then(numeric_value);

    BrokerOrderResponse {
        status,
        order_id,
        filled_quantity,
        avg_price,
    }
}

fn numeric_value(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[async_trait::async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(&self, req: BrokerOrderRequest) -> Result<BrokerOrderResponse>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}

/// Deterministic simulated broker used under `SIMULATE=true`. Never makes a
/// network call; always reports the order as sent but not yet filled,
/// leaving fill/market-hours decisions to the execution engine itself.
#[derive(Debug, Clone, Default)]
pub struct PaperBrokerAdapter;

#[async_trait::async_trait]
impl BrokerAdapter for PaperBrokerAdapter {
    async fn place_order(&self, req: BrokerOrderRequest) -> Result<BrokerOrderResponse> {
        Ok(BrokerOrderResponse {
            status: Some("sent".to_string()),
            order_id: Some(format!("paper:{}", req.security_id)),
            filled_quantity: None,
            avg_price: None,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Live adapter against the Dhan broker REST API.
#[derive(Clone)]
pub struct DhanBrokerAdapter {
    client: Client,
    client_id: String,
    access_token: String,
    host: String,
}

impl std::fmt::Debug for DhanBrokerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhanBrokerAdapter")
            .field("host", &self.host)
            .field("client_id", &"[REDACTED]")
            .finish()
    }
}

impl DhanBrokerAdapter {
    pub const HOST: &'static str = "https://api.dhan.co";

    pub fn new(client_id: String, access_token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build broker HTTP client")?;
        Ok(Self {
            client,
            client_id,
            access_token,
            host: Self::HOST.to_string(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("DHAN_CLIENT_ID").ok()?;
        let access_token = std::env::var("DHAN_ACCESS_TOKEN").ok()?;
        if client_id.is_empty() || access_token.is_empty() {
            return None;
        }
        match Self::new(client_id, access_token) {
            Ok(adapter) => {
                info!("DhanBrokerAdapter::from_env() - initialized with live credentials");
                Some(adapter)
            }
            Err(e) => {
                warn!(error = %e, "failed to initialize DhanBrokerAdapter");
                None
            }
        }
    }

    /// Request signature over method+path+body+timestamp, matching the
    /// HMAC-over-canonical-message pattern used for broker authentication
    /// throughout this codebase.
    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.access_token.as_bytes())
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("client-id".to_string(), self.client_id.clone()),
            ("signature".to_string(), signature),
            ("timestamp".to_string(), timestamp.to_string()),
        ])
    }
}

#[async_trait::async_trait]
impl BrokerAdapter for DhanBrokerAdapter {
    async fn place_order(&self, req: BrokerOrderRequest) -> Result<BrokerOrderResponse> {
        let path = "/orders";
        let body = serde_json::to_string(&req).context("failed to serialize order")?;
        let headers = self.auth_headers("POST", path, &body)?;
        let url = format!("{}{}", self.host, path);

        debug!(security_id = %req.security_id, quantity = req.quantity, "placing broker order");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .context("broker order request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(anyhow!("broker order rejected ({status}): {text}"));
        }

        let raw: serde_json::Value =
            serde_json::from_str(&text).context("failed to parse broker response")?;
        Ok(normalize_broker_response(&raw))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = format!("/orders/{order_id}");
        let headers = self.auth_headers("DELETE", &path, "")?;
        let url = format!("{}{}", self.host, path);

        let mut request = self.client.delete(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.send().await.context("broker cancel request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("broker cancel rejected ({status}): {text}"));
        }
        Ok(())
    }
}
