use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Time-in-force flags understood by the venues. `Alo` is add-liquidity-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Alo,
}

impl FromStr for TimeInForce {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gtc" => Ok(TimeInForce::Gtc),
            "ioc" => Ok(TimeInForce::Ioc),
            "alo" | "post_only" | "postonly" => Ok(TimeInForce::Alo),
            other => Err(format!("unknown time in force '{}'", other)),
        }
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "Gtc"),
            TimeInForce::Ioc => write!(f, "Ioc"),
            TimeInForce::Alo => write!(f, "Alo"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub tick_size: Decimal,
    pub size_decimals: u32,
    pub min_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

impl SymbolMeta {
    /// Smallest size increment the venue accepts.
    pub fn size_step(&self) -> Decimal {
        Decimal::new(1, self.size_decimals.min(28))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn mid(&self) -> Option<Decimal> {
        if self.ask > Decimal::ZERO && self.bid > Decimal::ZERO {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else if self.bid > Decimal::ZERO {
            Some(self.bid)
        } else if self.ask > Decimal::ZERO {
            Some(self.ask)
        } else {
            None
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        if self.ask > Decimal::ZERO && self.bid > Decimal::ZERO {
            Some(self.ask - self.bid)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub rate: Decimal,
    pub mark_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub total: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balances: Vec<AssetBalance>,
}

impl BalanceSnapshot {
    pub fn total_of(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Venue-reported position. `signed_size` is negative for shorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub signed_size: Decimal,
    pub entry_price: Option<Decimal>,
    pub leverage: Option<u32>,
}

pub fn position_for<'a>(
    positions: &'a [PositionSnapshot],
    symbol: &str,
) -> Option<&'a PositionSnapshot> {
    positions.iter().find(|p| p.symbol == symbol)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            tif: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.tif = tif;
        self
    }

    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Fill {
    pub size: Decimal,
    pub avg_price: Decimal,
    pub maker: bool,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.size * self.avg_price
    }
}

/// Venue order response, decoded once at the gateway boundary.
///
/// A `Filled` outcome with `resting_order_id` set means part of the order
/// executed and the remainder is still on the book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OrderOutcome {
    Resting {
        order_id: String,
    },
    Filled {
        size: Decimal,
        avg_price: Decimal,
        maker: bool,
        resting_order_id: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    Unknown(String),
}

impl OrderOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, OrderOutcome::Error { .. })
    }

    pub fn fill(&self) -> Option<Fill> {
        match self {
            OrderOutcome::Filled {
                size,
                avg_price,
                maker,
                ..
            } if *size > Decimal::ZERO => Some(Fill {
                size: *size,
                avg_price: *avg_price,
                maker: *maker,
            }),
            _ => None,
        }
    }

    pub fn resting_order_id(&self) -> Option<&str> {
        match self {
            OrderOutcome::Resting { order_id } => Some(order_id.as_str()),
            OrderOutcome::Filled {
                resting_order_id: Some(id),
                ..
            } => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            OrderOutcome::Resting { .. } | OrderOutcome::Filled { .. } => "ok",
            OrderOutcome::Error { .. } => "error",
            OrderOutcome::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Network(String),
    RateLimited(String),
    InvalidSymbol(String),
    NotApplicable,
    Rejected(String),
    Other(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Network(msg) => write!(f, "network error: {}", msg),
            GatewayError::RateLimited(msg) => write!(f, "429 Too Many Requests: {}", msg),
            GatewayError::InvalidSymbol(sym) => write!(f, "invalid symbol: {}", sym),
            GatewayError::NotApplicable => write!(f, "operation not applicable on this venue"),
            GatewayError::Rejected(msg) => write!(f, "rejected: {}", msg),
            GatewayError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// One trading venue (spot or perpetual). Every call may suspend on the network.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    fn venue_name(&self) -> &str;

    fn normalize_symbol(&self, raw: &str) -> Result<String, GatewayError>;

    async fn get_symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, GatewayError>;

    async fn get_balances(&self) -> Result<BalanceSnapshot, GatewayError>;

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError>;

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    /// `Ok(None)` on venues without funding (spot).
    async fn get_funding(&self, symbol: &str) -> Result<Option<FundingInfo>, GatewayError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderOutcome, GatewayError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError>;

    async fn set_leverage(
        &self,
        _symbol: &str,
        _leverage: u32,
        _cross_margin: bool,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::NotApplicable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quote_mid_falls_back_to_bid_when_ask_missing() {
        let q = Quote {
            bid: dec!(10.00),
            ask: Decimal::ZERO,
        };
        assert_eq!(q.mid(), Some(dec!(10.00)));
        assert_eq!(q.spread(), None);
    }

    #[test]
    fn balance_lookup_is_case_insensitive() {
        let snapshot = BalanceSnapshot {
            balances: vec![AssetBalance {
                asset: "USDC".to_string(),
                total: dec!(250),
                available: dec!(200),
            }],
        };
        assert_eq!(snapshot.total_of("usdc"), dec!(250));
        assert_eq!(snapshot.total_of("ASTER"), Decimal::ZERO);
    }

    #[test]
    fn partial_fill_exposes_resting_remainder() {
        let outcome = OrderOutcome::Filled {
            size: dec!(1.5),
            avg_price: dec!(10.01),
            maker: false,
            resting_order_id: Some("42".to_string()),
        };
        assert_eq!(outcome.resting_order_id(), Some("42"));
        assert_eq!(outcome.fill().map(|f| f.size), Some(dec!(1.5)));
        assert_eq!(outcome.status_label(), "ok");
    }

    #[test]
    fn tif_parses_aliases() {
        assert_eq!("IOC".parse::<TimeInForce>(), Ok(TimeInForce::Ioc));
        assert_eq!("post_only".parse::<TimeInForce>(), Ok(TimeInForce::Alo));
        assert!("fok".parse::<TimeInForce>().is_err());
    }
}
