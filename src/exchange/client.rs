// =============================================================================
// Live REST client — HMAC-SHA256 signed requests against both venues
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the venue.
//
// Retry policy lives here so the core never sees a raw transport failure:
// transient errors are retried up to `MAX_RETRIES` with capped exponential
// backoff, then surfaced classified.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::meta::SymbolMeta;
use crate::exchange::{
    AccountSummary, AssetBalance, Kline, OpenOrder, OrderAck, OrderSpec, PositionInfo, Ticker24h,
    TransferDirection, UserTrade,
};
use crate::types::{OrderSide, OrderType, Venue};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Retries on transient failures, with capped exponential backoff.
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Signed REST client covering the spot and derivatives venues.
#[derive(Clone)]
pub struct RestClient {
    api_key: String,
    secret: String,
    spot_base: String,
    derivatives_base: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!("RestClient initialised");

        Self {
            api_key,
            secret,
            spot_base: "https://api.binance.com".to_string(),
            derivatives_base: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn base(&self, venue: Venue) -> &str {
        match venue {
            Venue::Spot => &self.spot_base,
            Venue::Derivatives => &self.derivatives_base,
        }
    }

    fn api_prefix(venue: Venue) -> &'static str {
        match venue {
            Venue::Spot => "/api/v3",
            Venue::Derivatives => "/fapi/v1",
        }
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    /// Execute `method url` and parse the JSON body, retrying transient
    /// failures with capped exponential backoff.
    async fn send_json(
        &self,
        op: &'static str,
        method: reqwest::Method,
        url: &str,
    ) -> ExchangeResult<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(op, method.clone(), url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                    let delay = (BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS);
                    warn!(op, attempt, delay_ms = delay, error = %err, "transient exchange error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        op: &'static str,
        method: reqwest::Method,
        url: &str,
    ) -> ExchangeResult<serde_json::Value> {
        let resp = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| ExchangeError::from_reqwest(op, &e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::from_reqwest(op, &e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_status(op, status.as_u16(), &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::permanent(op, format!("invalid JSON body: {e}")))
    }

    // -------------------------------------------------------------------------
    // Symbol metadata
    // -------------------------------------------------------------------------

    pub async fn exchange_info(&self, venue: Venue) -> ExchangeResult<Vec<SymbolMeta>> {
        let op = "exchange_info";
        let url = format!("{}{}/exchangeInfo", self.base(venue), Self::api_prefix(venue));
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "response missing 'symbols' array"))?;

        let mut metas = Vec::with_capacity(symbols.len());
        for entry in symbols {
            // Skip delisted or otherwise untradable entries quietly.
            if let Some(status) = entry["status"].as_str() {
                if status != "TRADING" {
                    continue;
                }
            }
            match SymbolMeta::parse(venue, entry) {
                Ok(meta) => metas.push(meta),
                Err(e) => debug!(error = %e, "skipping unparseable symbol entry"),
            }
        }

        debug!(venue = %venue, count = metas.len(), "exchange info fetched");
        Ok(metas)
    }

    // -------------------------------------------------------------------------
    // Account / balances
    // -------------------------------------------------------------------------

    pub async fn balances(&self, venue: Venue) -> ExchangeResult<Vec<AssetBalance>> {
        let op = "balances";
        let qs = self.signed_query("");
        let url = match venue {
            Venue::Spot => format!("{}/api/v3/account?{qs}", self.spot_base),
            Venue::Derivatives => format!("{}/fapi/v2/balance?{qs}", self.derivatives_base),
        };
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let entries = match venue {
            Venue::Spot => body["balances"]
                .as_array()
                .ok_or_else(|| ExchangeError::permanent(op, "account missing 'balances'"))?
                .clone(),
            Venue::Derivatives => body
                .as_array()
                .ok_or_else(|| ExchangeError::permanent(op, "balance response not an array"))?
                .clone(),
        };

        let mut balances = Vec::new();
        for entry in &entries {
            let asset = entry["asset"].as_str().unwrap_or_default().to_string();
            let free = parse_f64(&entry["free"]).max(parse_f64(&entry["availableBalance"]));
            let locked = parse_f64(&entry["locked"]);
            if free > 0.0 || locked > 0.0 {
                balances.push(AssetBalance { asset, free, locked });
            }
        }

        debug!(venue = %venue, count = balances.len(), "balances fetched");
        Ok(balances)
    }

    pub async fn account(&self, venue: Venue) -> ExchangeResult<AccountSummary> {
        let op = "account";
        let qs = self.signed_query("");
        let url = match venue {
            Venue::Spot => format!("{}/api/v3/account?{qs}", self.spot_base),
            Venue::Derivatives => format!("{}/fapi/v2/account?{qs}", self.derivatives_base),
        };
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let summary = match venue {
            Venue::Spot => {
                // Spot equity approximated by the quote-asset line; spot has no
                // margin concept, so available == free quote balance.
                let mut equity = 0.0;
                if let Some(balances) = body["balances"].as_array() {
                    for b in balances {
                        if b["asset"].as_str() == Some("USDT") {
                            equity = parse_f64(&b["free"]) + parse_f64(&b["locked"]);
                        }
                    }
                }
                AccountSummary {
                    venue,
                    equity,
                    available_margin: equity,
                    unrealized_pnl: 0.0,
                }
            }
            Venue::Derivatives => AccountSummary {
                venue,
                equity: parse_f64(&body["totalMarginBalance"]),
                available_margin: parse_f64(&body["availableBalance"]),
                unrealized_pnl: parse_f64(&body["totalUnrealizedProfit"]),
            },
        };

        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    pub async fn ticker(&self, symbol: &str, venue: Venue) -> ExchangeResult<Ticker24h> {
        let op = "ticker";
        let url = format!(
            "{}{}/ticker/24hr?symbol={symbol}",
            self.base(venue),
            Self::api_prefix(venue)
        );
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;
        parse_ticker(op, &body)
    }

    pub async fn tickers_24h(&self, venue: Venue) -> ExchangeResult<Vec<Ticker24h>> {
        let op = "tickers_24h";
        let url = format!(
            "{}{}/ticker/24hr",
            self.base(venue),
            Self::api_prefix(venue)
        );
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "ticker response not an array"))?;

        let mut tickers = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Ok(ticker) = parse_ticker(op, entry) {
                tickers.push(ticker);
            }
        }
        debug!(venue = %venue, count = tickers.len(), "batched tickers fetched");
        Ok(tickers)
    }

    /// Klines in the venue's array-of-arrays format:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        venue: Venue,
    ) -> ExchangeResult<Vec<Kline>> {
        let op = "klines";
        let url = format!(
            "{}{}/klines?symbol={symbol}&interval={interval}&limit={limit}",
            self.base(venue),
            Self::api_prefix(venue)
        );
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "klines response not an array"))?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            klines.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_f64(&arr[1]),
                high: parse_f64(&arr[2]),
                low: parse_f64(&arr[3]),
                close: parse_f64(&arr[4]),
                volume: parse_f64(&arr[5]),
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    pub async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let op = "positions";
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v2/positionRisk?{qs}", self.derivatives_base);
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "position response not an array"))?;

        let mut positions = Vec::new();
        for entry in entries {
            let size = parse_f64(&entry["positionAmt"]);
            if size == 0.0 {
                continue;
            }
            positions.push(PositionInfo {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                venue: Venue::Derivatives,
                size,
                entry_price: parse_f64(&entry["entryPrice"]),
                unrealized_pnl: parse_f64(&entry["unRealizedProfit"]),
                leverage: parse_f64(&entry["leverage"]) as u32,
            });
        }
        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub async fn place_order(&self, spec: &OrderSpec) -> ExchangeResult<OrderAck> {
        let op = "place_order";
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            spec.symbol, spec.side, spec.order_type, spec.quantity
        );
        if let Some(price) = spec.price {
            params.push_str(&format!("&price={price}"));
        }
        if let Some(stop) = spec.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }
        if spec.order_type == OrderType::Limit {
            params.push_str(&format!("&timeInForce={}", spec.time_in_force));
        }
        if spec.reduce_only && spec.venue == Venue::Derivatives {
            params.push_str("&reduceOnly=true");
        }
        // Client order id makes retried submissions idempotent venue-side.
        let client_order_id = format!("mge-{}", uuid::Uuid::new_v4().simple());
        params.push_str(&format!("&newClientOrderId={client_order_id}"));

        let qs = self.signed_query(&params);
        let url = format!(
            "{}{}/order?{qs}",
            self.base(spec.venue),
            Self::api_prefix(spec.venue)
        );

        debug!(symbol = %spec.symbol, side = %spec.side, order_type = %spec.order_type, qty = spec.quantity, "placing order");
        let body = self.send_json(op, reqwest::Method::POST, &url).await?;

        Ok(OrderAck {
            order_id: body["orderId"].as_u64().unwrap_or(0),
            symbol: spec.symbol.clone(),
            side: spec.side,
            price: spec.price.unwrap_or_else(|| parse_f64(&body["avgPrice"])),
            quantity: spec.quantity,
            executed_qty: parse_f64(&body["executedQty"]),
        })
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        venue: Venue,
        order_id: u64,
    ) -> ExchangeResult<()> {
        let op = "cancel_order";
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}{}/order?{qs}", self.base(venue), Self::api_prefix(venue));

        debug!(symbol, order_id, "cancelling order");
        self.send_json(op, reqwest::Method::DELETE, &url).await?;
        Ok(())
    }

    pub async fn open_orders(&self, symbol: &str, venue: Venue) -> ExchangeResult<Vec<OpenOrder>> {
        let op = "open_orders";
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!(
            "{}{}/openOrders?{qs}",
            self.base(venue),
            Self::api_prefix(venue)
        );
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "openOrders response not an array"))?;

        let mut orders = Vec::with_capacity(entries.len());
        for entry in entries {
            orders.push(OpenOrder {
                order_id: entry["orderId"].as_u64().unwrap_or(0),
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                side: parse_side(&entry["side"]),
                price: parse_f64(&entry["price"]),
                quantity: parse_f64(&entry["origQty"]),
            });
        }
        Ok(orders)
    }

    pub async fn my_trades(
        &self,
        symbol: &str,
        venue: Venue,
        from_id: Option<u64>,
    ) -> ExchangeResult<Vec<UserTrade>> {
        let op = "my_trades";
        let mut params = format!("symbol={symbol}");
        if let Some(id) = from_id {
            params.push_str(&format!("&fromId={id}"));
        }
        let qs = self.signed_query(&params);
        let url = format!(
            "{}{}/userTrades?{qs}",
            self.base(venue),
            Self::api_prefix(venue)
        );
        // Spot calls the same endpoint /myTrades.
        let url = match venue {
            Venue::Spot => url.replace("/userTrades", "/myTrades"),
            Venue::Derivatives => url,
        };
        let body = self.send_json(op, reqwest::Method::GET, &url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::permanent(op, "trades response not an array"))?;

        let mut trades = Vec::with_capacity(entries.len());
        for entry in entries {
            let is_buyer = entry["isBuyer"]
                .as_bool()
                .or_else(|| entry["buyer"].as_bool())
                .unwrap_or(false);
            trades.push(UserTrade {
                trade_id: entry["id"].as_u64().unwrap_or(0),
                order_id: entry["orderId"].as_u64().unwrap_or(0),
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                side: if is_buyer { OrderSide::Buy } else { OrderSide::Sell },
                price: parse_f64(&entry["price"]),
                qty: parse_f64(&entry["qty"]),
                timestamp_ms: entry["time"].as_i64().unwrap_or(0),
            });
        }
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    pub async fn transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> ExchangeResult<()> {
        let op = "transfer";
        let type_code = match direction {
            TransferDirection::SpotToDerivatives => 1,
            TransferDirection::DerivativesToSpot => 2,
        };
        let params = format!("asset={asset}&amount={amount}&type={type_code}");
        let qs = self.signed_query(&params);
        let url = format!("{}/sapi/v1/futures/transfer?{qs}", self.spot_base);

        debug!(asset, amount, direction = %direction, "requesting inter-venue transfer");
        self.send_json(op, reqwest::Method::POST, &url).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

fn parse_side(val: &serde_json::Value) -> OrderSide {
    match val.as_str() {
        Some("SELL") => OrderSide::Sell,
        _ => OrderSide::Buy,
    }
}

fn parse_ticker(op: &'static str, entry: &serde_json::Value) -> ExchangeResult<Ticker24h> {
    let symbol = entry["symbol"]
        .as_str()
        .ok_or_else(|| ExchangeError::permanent(op, "ticker entry missing 'symbol'"))?
        .to_string();
    Ok(Ticker24h {
        symbol,
        last_price: parse_f64(&entry["lastPrice"]),
        price_change_pct: parse_f64(&entry["priceChangePercent"]),
        quote_volume: parse_f64(&entry["quoteVolume"]),
        high: parse_f64(&entry["highPrice"]),
        low: parse_f64(&entry["lowPrice"]),
        bid: parse_f64(&entry["bidPrice"]),
        ask: parse_f64(&entry["askPrice"]),
    })
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("spot_base", &self.spot_base)
            .field("derivatives_base", &self.derivatives_base)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = RestClient::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&side=BUY");
        let sig2 = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_appends_signature() {
        let client = RestClient::new("key", "secret");
        let qs = client.signed_query("symbol=ETHUSDT");
        assert!(qs.starts_with("symbol=ETHUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn parse_ticker_from_wire_shape() {
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "lastPrice": "2000.50",
            "priceChangePercent": "-1.25",
            "quoteVolume": "123456789.0",
            "highPrice": "2100.0",
            "lowPrice": "1950.0",
            "bidPrice": "2000.4",
            "askPrice": "2000.6"
        });
        let ticker = parse_ticker("ticker", &entry).unwrap();
        assert_eq!(ticker.symbol, "ETHUSDT");
        assert_eq!(ticker.last_price, 2000.50);
        assert_eq!(ticker.price_change_pct, -1.25);
    }

    #[test]
    fn parse_f64_accepts_strings_and_numbers() {
        assert_eq!(parse_f64(&serde_json::json!("1.5")), 1.5);
        assert_eq!(parse_f64(&serde_json::json!(2.5)), 2.5);
        assert_eq!(parse_f64(&serde_json::json!(null)), 0.0);
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = RestClient::new("my-key", "my-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("my-key"));
        assert!(!rendered.contains("my-secret"));
    }
}
