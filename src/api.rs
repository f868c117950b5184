// ===============================
// src/api.rs (FinLearn REST backend)
// ===============================
/*
=============================================================================
Project : finlearn_trader — live market sync & paper-trading client in Rust
Module  : api.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a self-healing WebSocket to the FinLearn price stream,
          reconciles price snapshots into a local quote book, values the
          paper portfolio on every tick, and executes buy/sell orders
          against the backend with authoritative reconciliation.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
//
// Thin reqwest client over the Django API (`/api`):
// - stocks   : list / refresh / initialize / history / quote
// - trading  : POST /stocks/trade/, portfolio rows, transaction history
// - users    : login / register / profile (also the post-trade balance)
//
// `MarketBackend` is the seam used by the feed and the trade engine so they can
// run against an in-process fake in tests.
//

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Execution, Period, PositionReport, PriceQuote, PricePoint, Side};
use crate::error::ApiError;
use crate::session::Session;

/// Body of `POST /stocks/trade/`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOrder {
    pub stock_id: i64,
    pub shares: Decimal,
    pub transaction_type: Side,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockRef {
    #[serde(default)]
    pub id: i64,
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRow {
    #[serde(default)]
    pub id: i64,
    pub stock: StockRef,
    pub transaction_type: Side,
    pub shares: Decimal,
    pub price_per_share: Decimal,
    pub total_amount: Decimal,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioRow {
    pub stock: PriceQuote,
    pub shares: Decimal,
    pub average_buy_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeConfirmation {
    #[serde(default)]
    pub message: String,
    pub transaction: TransactionRow,
    #[serde(default)]
    pub portfolio: Option<PortfolioRow>,
    #[serde(default, alias = "virtual_balance")]
    pub cash_balance: Option<Decimal>,
}

impl TradeConfirmation {
    /// Authoritative execution as reported by the backend.
    pub fn into_execution(self, symbol: &str) -> Execution {
        let side = self.transaction.transaction_type;
        let position = match self.portfolio {
            Some(row) if row.shares > Decimal::ZERO => Some(PositionReport::Open {
                shares: row.shares,
                average_cost: row.average_buy_price,
            }),
            Some(_) => Some(PositionReport::Closed),
            // a sell that empties the position comes back as `portfolio: null`
            None if side == Side::Sell => Some(PositionReport::Closed),
            None => None,
        };
        Execution {
            symbol: symbol.to_string(),
            side,
            shares: self.transaction.shares,
            fill_price: self.transaction.price_per_share,
            cash_balance: self.cash_balance,
            position,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub xp_points: i64,
    #[serde(default)]
    pub level: i64,
    pub virtual_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    updated_count: u32,
}

#[derive(Debug, Deserialize)]
struct InitializeResponse {
    #[serde(default)]
    stocks: Vec<PriceQuote>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<PricePoint>,
}

#[async_trait]
pub trait MarketBackend: Send + Sync {
    async fn list_quotes(&self) -> Result<Vec<PriceQuote>, ApiError>;
    /// Triggers a server-side price recomputation; returns the updated count.
    async fn refresh_prices(&self) -> Result<u32, ApiError>;
    async fn initialize_stocks(&self) -> Result<Vec<PriceQuote>, ApiError>;
    async fn history(&self, stock_id: i64, period: Period) -> Result<Vec<PricePoint>, ApiError>;
    async fn execute_trade(&self, order: &TradeOrder) -> Result<TradeConfirmation, ApiError>;
    /// Server-side cash for `user_id`; `None` when there is no account to ask.
    async fn balance(&self, user_id: Option<i64>) -> Result<Option<Decimal>, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string(), token: None })
    }

    /// Same client, authorised as `session`.
    pub fn with_session(&self, session: &Session) -> Self {
        Self { token: Some(session.token.clone()), ..self.clone() }
    }

    pub fn is_authenticated(&self) -> bool { self.token.is_some() }

    fn url(&self, endpoint: &str) -> String { format!("{}{}", self.base_url, endpoint) }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.header("Authorization", format!("Token {t}")),
            None => req,
        }
    }

    async fn read<T: DeserializeOwned>(rsp: Response) -> Result<T, ApiError> {
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_body(status, &body));
        }
        serde_json::from_str::<T>(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        debug!(endpoint, "GET");
        let rsp = self.authorize(self.http.get(self.url(endpoint))).send().await?;
        Self::read(rsp).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        debug!(endpoint, "POST");
        let mut req = self.authorize(self.http.post(self.url(endpoint)));
        if let Some(b) = body {
            req = req.json(b);
        }
        Self::read(req.send().await?).await
    }

    // ---- users ----

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = serde_json::json!({ "username": username, "password": password });
        self.post("/users/login/", Some(&body)).await
    }

    /// Creates the account; signing in is a separate `login`.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "username": username,
            "email": email,
            "password": password,
            "password_confirm": password,
        });
        let _: serde_json::Value = self.post("/users/register/", Some(&body)).await?;
        Ok(())
    }

    pub async fn profile(&self, user_id: i64) -> Result<UserProfile, ApiError> {
        self.get(&format!("/users/{user_id}/")).await
    }

    // ---- trading reads ----

    /// Live quote straight from the market data provider (`503` when it is down).
    pub async fn quote(&self, stock_id: i64) -> Result<serde_json::Value, ApiError> {
        self.get(&format!("/stocks/stocks/{stock_id}/quote/")).await
    }

    pub async fn portfolio(&self, user_id: Option<i64>) -> Result<Vec<PortfolioRow>, ApiError> {
        match user_id {
            Some(id) => self.get(&format!("/stocks/portfolio/?user_id={id}")).await,
            None => self.get("/stocks/portfolio/").await,
        }
    }

    pub async fn transactions(&self, user_id: Option<i64>) -> Result<Vec<TransactionRow>, ApiError> {
        match user_id {
            Some(id) => self.get(&format!("/stocks/transactions/?user_id={id}")).await,
            None => self.get("/stocks/transactions/").await,
        }
    }
}

#[async_trait]
impl MarketBackend for ApiClient {
    async fn list_quotes(&self) -> Result<Vec<PriceQuote>, ApiError> {
        self.get("/stocks/stocks/").await
    }

    async fn refresh_prices(&self) -> Result<u32, ApiError> {
        let rsp: RefreshResponse = self.post::<(), _>("/stocks/stocks/refresh/", None).await?;
        Ok(rsp.updated_count)
    }

    async fn initialize_stocks(&self) -> Result<Vec<PriceQuote>, ApiError> {
        let rsp: InitializeResponse = self.post::<(), _>("/stocks/stocks/initialize/", None).await?;
        Ok(rsp.stocks)
    }

    async fn history(&self, stock_id: i64, period: Period) -> Result<Vec<PricePoint>, ApiError> {
        let endpoint = format!(
            "/stocks/stocks/{stock_id}/history/?period={}",
            urlencoding::encode(period.as_str())
        );
        let rsp: HistoryResponse = self.get(&endpoint).await?;
        Ok(rsp.history)
    }

    async fn execute_trade(&self, order: &TradeOrder) -> Result<TradeConfirmation, ApiError> {
        self.post("/stocks/trade/", Some(order)).await
    }

    async fn balance(&self, user_id: Option<i64>) -> Result<Option<Decimal>, ApiError> {
        match user_id {
            Some(id) if self.is_authenticated() => Ok(Some(self.profile(id).await?.virtual_balance)),
            _ => Ok(None),
        }
    }
}
