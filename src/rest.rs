//! REST trading collaborator for Backpack.
//!
//! Thin typed wrapper over the exchange's HTTP API: one method per
//! endpoint, request signing via the injected [`InstructionSigner`], and a
//! bounded fixed-delay retry that only re-attempts transient transport
//! failures. Definitive rejections surface immediately.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{
    errors::{RestError, RestResult},
    signer::InstructionSigner,
    types::{ClientOrderId, Order, OrderStatus, PriceLevel, Side},
};

pub const DEFAULT_BASE_URL: &str = "https://api.backpack.exchange/";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Request to place one limit order.
#[derive(Clone, Debug)]
pub struct OrderRequest {
    pub client_id: ClientOrderId,
    pub symbol: String,
    pub side: Side,
    pub order_type: String,
    pub time_in_force: String,
    pub quantity: f64,
    pub price: f64,
}

impl OrderRequest {
    pub fn limit_gtc(
        client_id: ClientOrderId,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            client_id,
            symbol: symbol.into(),
            side,
            order_type: "Limit".to_string(),
            time_in_force: "GTC".to_string(),
            quantity,
            price,
        }
    }
}

/// Exchange operations the strategy needs; mockable for tests.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Place a limit order. A 202 acknowledgement (submitted but not yet
    /// executed) is returned as a `New` order carrying the exchange id.
    async fn place_order(&self, request: &OrderRequest) -> RestResult<Order>;

    /// Cancel one order. Idempotent: an already-gone order acknowledges.
    async fn cancel_order(&self, symbol: &str, exchange_id: &str) -> RestResult<()>;

    /// Cancel every resting order for the symbol.
    async fn cancel_all_orders(&self, symbol: &str) -> RestResult<()>;

    /// Available balance per asset.
    async fn balances(&self) -> RestResult<HashMap<String, f64>>;

    /// Look up a resting order; `None` once it has filled or cancelled.
    async fn open_order(&self, symbol: &str, exchange_id: &str) -> RestResult<Option<Order>>;

    /// Most recent historical orders for the symbol.
    async fn historical_orders(
        &self,
        symbol: &str,
        limit: u32,
        offset: u32,
    ) -> RestResult<Vec<Order>>;
}

// Wire models.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiOrder {
    #[serde(default)]
    client_id: Option<u64>,
    id: String,
    price: String,
    quantity: String,
    side: String,
    #[serde(default)]
    status: Option<String>,
}

impl ApiOrder {
    fn into_order(self) -> RestResult<Order> {
        let side = Side::from_wire(&self.side)
            .ok_or_else(|| RestError::InvalidResponse(format!("unknown side {:?}", self.side)))?;
        Ok(Order {
            client_id: ClientOrderId::new(self.client_id.unwrap_or(0)),
            exchange_id: Some(self.id),
            side,
            price: parse_decimal(&self.price)?,
            quantity: parse_decimal(&self.quantity)?,
            status: self
                .status
                .as_deref()
                .map(OrderStatus::from_wire)
                .unwrap_or(OrderStatus::Unknown),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AcceptedAck {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub last_update_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SystemStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SystemStatus {
    pub fn is_ok(&self) -> bool {
        self.status == "Ok"
    }
}

fn parse_decimal(text: &str) -> RestResult<f64> {
    text.parse::<f64>()
        .map_err(|_| RestError::InvalidResponse(format!("bad decimal {text:?}")))
}

/// Formats a number the way it is signed and serialized on the wire. Both
/// paths must agree or the exchange rejects the signature.
fn wire_number(value: f64) -> String {
    let mut text = format!("{value}");
    if !text.contains('.') {
        text.push_str(".0");
    }
    text
}

/// Backpack REST client.
pub struct BpxClient {
    http: reqwest::Client,
    base_url: String,
    signer: Arc<dyn InstructionSigner>,
    max_retries: u32,
    retry_delay: Duration,
}

impl BpxClient {
    pub fn new(signer: Arc<dyn InstructionSigner>) -> Self {
        Self::with_base_url(signer, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(signer: Arc<dyn InstructionSigner>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
            signer,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn retry_policy(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn signed(
        &self,
        request: reqwest::RequestBuilder,
        instruction: &str,
        params: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        let headers = self.signer.sign(instruction, params);
        request
            .header("X-API-KEY", headers.api_key)
            .header("X-TIMESTAMP", headers.timestamp)
            .header("X-WINDOW", headers.window)
            .header("X-SIGNATURE", headers.signature)
            .header("Content-Type", "application/json")
    }

    /// Runs `operation` up to `max_retries + 1` times with a fixed delay,
    /// retrying only the transient transport kind.
    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> RestResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = RestResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{what} failed (attempt {attempt}/{}), retrying in {:?}: {err}",
                        self.max_retries, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Public depth snapshot, used to seed the incremental book.
    pub async fn depth(&self, symbol: &str) -> RestResult<DepthSnapshot> {
        self.with_retry("depth query", || async {
            let response = self
                .http
                .get(self.url("api/v1/depth"))
                .query(&[("symbol", symbol)])
                .send()
                .await?;
            expect_status(response, StatusCode::OK)
                .await?
                .json::<DepthSnapshot>()
                .await
                .map_err(RestError::from)
        })
        .await
    }

    /// Public system status; anything but `Ok` means maintenance.
    pub async fn status(&self) -> RestResult<SystemStatus> {
        self.with_retry("status query", || async {
            let response = self.http.get(self.url("api/v1/status")).send().await?;
            expect_status(response, StatusCode::OK)
                .await?
                .json::<SystemStatus>()
                .await
                .map_err(RestError::from)
        })
        .await
    }
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> RestResult<reqwest::Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RestError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ExchangeApi for BpxClient {
    async fn place_order(&self, request: &OrderRequest) -> RestResult<Order> {
        let params = vec![
            ("clientId".to_string(), request.client_id.to_string()),
            ("symbol".to_string(), request.symbol.clone()),
            ("side".to_string(), request.side.to_string()),
            ("orderType".to_string(), request.order_type.clone()),
            ("timeInForce".to_string(), request.time_in_force.clone()),
            ("quantity".to_string(), wire_number(request.quantity)),
            ("price".to_string(), wire_number(request.price)),
        ];
        let body = json!({
            "clientId": request.client_id.into_inner(),
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type,
            "timeInForce": request.time_in_force,
            "quantity": wire_number(request.quantity),
            "price": wire_number(request.price),
        });

        self.with_retry("order placement", || {
            let params = params.clone();
            let body = body.clone();
            async move {
                let response = self
                    .signed(
                        self.http.post(self.url("api/v1/order")).json(&body),
                        "orderExecute",
                        &params,
                    )
                    .send()
                    .await?;

                match response.status() {
                    StatusCode::OK => {
                        let api: ApiOrder = response.json().await?;
                        api.into_order()
                    }
                    // Submitted but not yet executed: synthesize the
                    // resting order from what we sent plus the assigned id.
                    StatusCode::ACCEPTED => {
                        let ack: AcceptedAck = response.json().await?;
                        Ok(Order {
                            client_id: request.client_id,
                            exchange_id: Some(ack.id),
                            side: request.side,
                            price: request.price,
                            quantity: request.quantity,
                            status: OrderStatus::New,
                        })
                    }
                    status => {
                        let body = response.text().await.unwrap_or_default();
                        Err(RestError::Rejected {
                            status: status.as_u16(),
                            body,
                        })
                    }
                }
            }
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, exchange_id: &str) -> RestResult<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), exchange_id.to_string()),
        ];
        let body = json!({ "symbol": symbol, "orderId": exchange_id });

        let response = self
            .signed(
                self.http.delete(self.url("api/v1/order")).json(&body),
                "orderCancel",
                &params,
            )
            .send()
            .await?;

        match response.status() {
            // 404 means the order is already filled or cancelled, which is
            // exactly the state a cancel wants.
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RestError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> RestResult<()> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let body = json!({ "symbol": symbol });

        self.with_retry("cancel all", || {
            let params = params.clone();
            let body = body.clone();
            async move {
                let response = self
                    .signed(
                        self.http.delete(self.url("api/v1/orders")).json(&body),
                        "orderCancelAll",
                        &params,
                    )
                    .send()
                    .await?;
                match response.status() {
                    StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
                    status => {
                        let body = response.text().await.unwrap_or_default();
                        Err(RestError::Rejected {
                            status: status.as_u16(),
                            body,
                        })
                    }
                }
            }
        })
        .await
    }

    async fn balances(&self) -> RestResult<HashMap<String, f64>> {
        self.with_retry("balance query", || async {
            let response = self
                .signed(self.http.get(self.url("api/v1/capital")), "balanceQuery", &[])
                .send()
                .await?;
            let raw: HashMap<String, AssetBalance> =
                expect_status(response, StatusCode::OK).await?.json().await?;
            let mut out = HashMap::with_capacity(raw.len());
            for (asset, balance) in raw {
                out.insert(asset, parse_decimal(&balance.available)?);
            }
            Ok(out)
        })
        .await
    }

    async fn open_order(&self, symbol: &str, exchange_id: &str) -> RestResult<Option<Order>> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), exchange_id.to_string()),
        ];

        self.with_retry("order query", || {
            let params = params.clone();
            async move {
                let response = self
                    .signed(
                        self.http
                            .get(self.url("api/v1/order"))
                            .query(&[("symbol", symbol), ("orderId", exchange_id)]),
                        "orderQuery",
                        &params,
                    )
                    .send()
                    .await?;
                match response.status() {
                    StatusCode::OK => {
                        let api: ApiOrder = response.json().await?;
                        Ok(Some(api.into_order()?))
                    }
                    StatusCode::NOT_FOUND => Ok(None),
                    status => {
                        let body = response.text().await.unwrap_or_default();
                        Err(RestError::Rejected {
                            status: status.as_u16(),
                            body,
                        })
                    }
                }
            }
        })
        .await
    }

    async fn historical_orders(
        &self,
        symbol: &str,
        limit: u32,
        offset: u32,
    ) -> RestResult<Vec<Order>> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];

        self.with_retry("order history query", || {
            let params = params.clone();
            async move {
                let response = self
                    .signed(
                        self.http.get(self.url("wapi/v1/history/orders")).query(&[
                            ("symbol", symbol.to_string()),
                            ("limit", limit.to_string()),
                            ("offset", offset.to_string()),
                        ]),
                        "orderHistoryQueryAll",
                        &params,
                    )
                    .send()
                    .await?;
                let raw: Vec<ApiOrder> =
                    expect_status(response, StatusCode::OK).await?.json().await?;
                raw.into_iter().map(ApiOrder::into_order).collect()
            }
        })
        .await
    }
}

impl DepthSnapshot {
    /// Converts the wire snapshot into numeric levels plus the sequence id.
    pub fn into_levels(self) -> RestResult<(Vec<PriceLevel>, Vec<PriceLevel>, u64)> {
        let seq = self
            .last_update_id
            .parse::<u64>()
            .map_err(|_| RestError::InvalidResponse("bad lastUpdateId".into()))?;
        let parse_side = |raw: Vec<[String; 2]>| -> RestResult<Vec<PriceLevel>> {
            raw.into_iter()
                .map(|[price, size]| {
                    Ok(PriceLevel::new(parse_decimal(&price)?, parse_decimal(&size)?))
                })
                .collect()
        };
        Ok((parse_side(self.bids)?, parse_side(self.asks)?, seq))
    }
}

/// In-memory exchange used by the engine and runner tests.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockExchange {
        pub placed: Mutex<Vec<OrderRequest>>,
        pub cancelled: Mutex<Vec<String>>,
        pub cancel_all_calls: AtomicU64,
        pub balances: Mutex<HashMap<String, f64>>,
        pub fail_placement_for: Mutex<Option<Side>>,
        next_id: AtomicU64,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_balances(balances: &[(&str, f64)]) -> Self {
            let mut map = HashMap::new();
            for (asset, amount) in balances {
                map.insert(asset.to_string(), *amount);
            }
            Self {
                balances: Mutex::new(map),
                ..Self::default()
            }
        }

        pub async fn set_balance(&self, asset: &str, amount: f64) {
            self.balances.lock().await.insert(asset.to_string(), amount);
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn place_order(&self, request: &OrderRequest) -> RestResult<Order> {
            if *self.fail_placement_for.lock().await == Some(request.side) {
                return Err(RestError::Rejected {
                    status: 400,
                    body: "mock rejection".to_string(),
                });
            }
            self.placed.lock().await.push(request.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Order {
                client_id: request.client_id,
                exchange_id: Some(format!("mock-{id}")),
                side: request.side,
                price: request.price,
                quantity: request.quantity,
                status: OrderStatus::New,
            })
        }

        async fn cancel_order(&self, _symbol: &str, exchange_id: &str) -> RestResult<()> {
            self.cancelled.lock().await.push(exchange_id.to_string());
            Ok(())
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> RestResult<()> {
            self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn balances(&self) -> RestResult<HashMap<String, f64>> {
            Ok(self.balances.lock().await.clone())
        }

        async fn open_order(&self, _symbol: &str, _exchange_id: &str) -> RestResult<Option<Order>> {
            Ok(None)
        }

        async fn historical_orders(
            &self,
            _symbol: &str,
            _limit: u32,
            _offset: u32,
        ) -> RestResult<Vec<Order>> {
            Ok(Vec::new())
        }
    }
}
