use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use super::ExchangeGateway;
use crate::error::GatewayError;
use crate::models::{
    BalanceSnapshot, Candle, OrderRequest, OrderResult, OrderStatus, OrderType, RiskLevels,
    Timeframe,
};

pub const BYBIT_MAINNET_URL: &str = "https://api.bybit.com";
pub const BYBIT_TESTNET_URL: &str = "https://api-testnet.bybit.com";

const RECV_WINDOW: &str = "5000";
const RATE_LIMIT_RPS: u32 = 10;
const MAX_KLINE_LIMIT: usize = 1000;

// retCode returned by set-leverage when nothing changes
const LEVERAGE_NOT_MODIFIED: i64 = 110043;

type HmacSha256 = Hmac<Sha256>;

type BybitRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Classify a Bybit retCode + HTTP status into a gateway error
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> GatewayError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => GatewayError::Transient(format!("rate limited: {}", msg)),
        (10016, _) | (_, 500..=599) => {
            GatewayError::Transient(format!("server error {}: {}", http_status, msg))
        }
        (10003..=10005, _) | (_, 401) | (_, 403) => {
            GatewayError::Permanent(format!("auth failed: retCode={} msg={}", ret_code, msg))
        }
        (-1, 400..=499) => GatewayError::Permanent(format!("HTTP {}: {}", http_status, msg)),
        _ => GatewayError::Rejected(format!("retCode={} msg={}", ret_code, msg)),
    }
}

/// Decimal string without float noise or trailing zeros
fn format_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn parse_str_f64(value: &Value) -> Option<f64> {
    value.as_str()?.parse().ok()
}

/// Bybit v5 REST client for linear perpetuals
///
/// Cloneable; clones share the rate limiter and the closed flag.
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    rate_limiter: Arc<BybitRateLimiter>,
    closed: Arc<AtomicBool>,
}

impl BybitClient {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn sign(&self, payload: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Permanent(format!("HMAC init failed: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed(
        &self,
        request: reqwest::RequestBuilder,
        params: &str,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let ts = Utc::now().timestamp_millis().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW, params);
        let signature = self.sign(&payload)?;

        Ok(request
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW))
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<Value, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(self.client.get(url)).await
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<Value, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let request = self.signed(self.client.get(url), query)?;
        self.send(request).await
    }

    async fn post_signed(&self, path: &str, body: Value) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.to_string();
        let request = self
            .signed(self.client.post(url), &body)?
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.send(request).await
    }

    /// Send one request; no retries here, the caller owns the retry policy
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Permanent("gateway closed".to_string()));
        }
        self.rate_limiter.until_ready().await;

        let resp = request
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("HTTP error: {}", e)))?;

        let http_status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transient(format!("read error: {}", e)))?;

        let json: Value = match serde_json::from_str(&text) {
            Ok(json) => json,
            Err(_) if !http_status.is_success() => {
                return Err(classify_error(-1, http_status.as_u16(), &text));
            }
            Err(e) => return Err(GatewayError::Transient(format!("Parse error: {}", e))),
        };

        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status.as_u16(), msg))
        }
    }

    /// Open position size for `symbol`, 0 when flat
    async fn position_size(&self, symbol: &str) -> Result<(f64, f64), GatewayError> {
        let query = format!("category=linear&symbol={}", symbol);
        let json = self.get_signed("/v5/position/list", &query).await?;

        let entry = json["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .cloned()
            .unwrap_or(Value::Null);

        let size = parse_str_f64(&entry["size"]).unwrap_or(0.0);
        let avg_price = parse_str_f64(&entry["avgPrice"]).unwrap_or(0.0);
        Ok((size, avg_price))
    }
}

fn parse_kline_row(row: &Value) -> Option<Candle> {
    let arr = row.as_array()?;
    let ts: i64 = arr.first()?.as_str()?.parse().ok()?;
    Some(Candle {
        open_time: DateTime::from_timestamp_millis(ts)?,
        open: parse_str_f64(arr.get(1)?)?,
        high: parse_str_f64(arr.get(2)?)?,
        low: parse_str_f64(arr.get(3)?)?,
        close: parse_str_f64(arr.get(4)?)?,
        volume: parse_str_f64(arr.get(5)?)?,
    })
}

fn parse_order_status(status: &str) -> Option<OrderStatus> {
    match status {
        "Created" | "New" | "Untriggered" | "Triggered" => Some(OrderStatus::New),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Some(OrderStatus::Cancelled),
        "Rejected" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

#[async_trait]
impl ExchangeGateway for BybitClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let query = format!(
            "category=linear&symbol={}&interval={}&limit={}",
            symbol,
            timeframe.as_bybit_interval(),
            limit.clamp(1, MAX_KLINE_LIMIT)
        );
        let json = self.get_public("/v5/market/kline", &query).await?;

        let list = json["result"]["list"]
            .as_array()
            .ok_or_else(|| GatewayError::Transient("missing result.list".into()))?;

        let mut candles: Vec<Candle> = list.iter().filter_map(parse_kline_row).collect();
        candles.reverse(); // Bybit returns newest-first
        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, GatewayError> {
        let json = self
            .get_signed("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let total_equity = json["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|account| parse_str_f64(&account["totalEquity"]))
            .ok_or_else(|| GatewayError::Transient("missing totalEquity".into()))?;

        let as_of = json["time"]
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(BalanceSnapshot { as_of, total_equity })
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError> {
        let mut body = json!({
            "category":    "linear",
            "symbol":      request.symbol,
            "side":        request.side.as_str(),
            "orderType":   "Market",
            "qty":         format_decimal(request.size),
            "stopLoss":    format_decimal(request.stop_loss),
            "takeProfit":  format_decimal(request.take_profit),
            "tpslMode":    "Full",
            "timeInForce": "GTC",
            "orderLinkId": request.client_order_id.to_string(),
        });
        if request.order_type == OrderType::Limit {
            body["orderType"] = json!("Limit");
            body["price"] = json!(format_decimal(request.entry_price));
        }

        let json = self.post_signed("/v5/order/create", body).await?;
        let order_id = json["result"]["orderId"]
            .as_str()
            .ok_or_else(|| GatewayError::Transient("missing result.orderId".into()))?
            .to_string();

        tracing::info!(
            "Order placed: {} {} {} qty={}",
            request.side.as_str(),
            request.symbol,
            order_id,
            format_decimal(request.size)
        );

        Ok(OrderResult {
            order_id,
            accepted_price: request.entry_price,
            status: OrderStatus::New,
        })
    }

    async fn update_order(
        &self,
        symbol: &str,
        order_id: &str,
        levels: &RiskLevels,
    ) -> Result<OrderResult, GatewayError> {
        let body = json!({
            "category":    "linear",
            "symbol":      symbol,
            "stopLoss":    format_decimal(levels.stop_loss),
            "takeProfit":  format_decimal(levels.take_profit),
            "tpslMode":    "Full",
            "positionIdx": 0,
        });
        self.post_signed("/v5/position/trading-stop", body).await?;

        let (size, avg_price) = self.position_size(symbol).await?;
        Ok(OrderResult {
            order_id: order_id.to_string(),
            accepted_price: avg_price,
            status: if size > 0.0 {
                OrderStatus::Filled
            } else {
                OrderStatus::Closed
            },
        })
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, GatewayError> {
        let query = format!("category=linear&symbol={}&orderId={}", symbol, order_id);
        let json = self.get_signed("/v5/order/realtime", &query).await?;

        let status = json["result"]["list"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|order| order["orderStatus"].as_str())
            .and_then(parse_order_status);

        match status {
            // A filled entry stays open until the position is flat
            Some(OrderStatus::Filled) | None => {
                let (size, _) = self.position_size(symbol).await?;
                Ok(if size > 0.0 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Closed
                })
            }
            Some(other) => Ok(other),
        }
    }

    async fn find_order(
        &self,
        symbol: &str,
        client_order_id: Uuid,
    ) -> Result<Option<OrderResult>, GatewayError> {
        let query = format!(
            "category=linear&symbol={}&orderLinkId={}",
            symbol, client_order_id
        );
        let json = self.get_signed("/v5/order/realtime", &query).await?;

        let Some(order) = json["result"]["list"].as_array().and_then(|list| list.first()) else {
            return Ok(None);
        };
        let order_id = order["orderId"]
            .as_str()
            .ok_or_else(|| GatewayError::Transient("missing orderId".into()))?
            .to_string();
        let status = order["orderStatus"]
            .as_str()
            .and_then(parse_order_status)
            .unwrap_or(OrderStatus::New);
        let accepted_price = parse_str_f64(&order["avgPrice"])
            .filter(|p| *p > 0.0)
            .or_else(|| parse_str_f64(&order["price"]))
            .unwrap_or(0.0);

        Ok(Some(OrderResult {
            order_id,
            accepted_price,
            status,
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let body = json!({
            "category":     "linear",
            "symbol":       symbol,
            "buyLeverage":  leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post_signed("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Rejected(msg))
                if msg.contains(&format!("retCode={}", LEVERAGE_NOT_MODIFIED)) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Bybit client closed");
        }
    }
}
