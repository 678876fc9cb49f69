//! In-memory venue used by the unit tests. Orders fill at the requested
//! price unless an outcome has been queued; fills move balances and
//! positions so the close paths see realistic venue state.

use crate::gateway::{
    AssetBalance, BalanceSnapshot, CancelOutcome, FundingInfo, GatewayError, OpenOrder,
    OrderOutcome, OrderRequest, OrderSide, PositionSnapshot, Quote, SymbolMeta, VenueGateway,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn quote(bid: Decimal, ask: Decimal) -> Quote {
    Quote { bid, ask }
}

pub fn meta(symbol: &str, tick: Decimal, size_decimals: u32) -> SymbolMeta {
    SymbolMeta {
        symbol: symbol.to_string(),
        tick_size: tick,
        size_decimals,
        min_qty: None,
        min_notional: None,
    }
}

struct VenueState {
    quote: Quote,
    meta: SymbolMeta,
    balances: Vec<AssetBalance>,
    position: Decimal,
    funding: Option<FundingInfo>,
    funding_fails: bool,
    open_orders: Vec<OpenOrder>,
    queued: VecDeque<Result<OrderOutcome, GatewayError>>,
    placed: Vec<OrderRequest>,
    cancels: Vec<(String, String)>,
    leverage_calls: Vec<(String, u32, bool)>,
    fill_by_default: bool,
}

pub struct ScriptedGateway {
    name: String,
    symbol: String,
    is_perp: bool,
    state: Mutex<VenueState>,
    next_id: AtomicUsize,
}

impl ScriptedGateway {
    fn build(name: &str, symbol: &str, is_perp: bool, state: VenueState) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            is_perp,
            state: Mutex::new(state),
            next_id: AtomicUsize::new(1),
        }
    }

    fn base_state(symbol: &str) -> VenueState {
        VenueState {
            quote: quote(dec!(10.00), dec!(10.02)),
            meta: meta(symbol, dec!(0.01), 2),
            balances: Vec::new(),
            position: Decimal::ZERO,
            funding: None,
            funding_fails: false,
            open_orders: Vec::new(),
            queued: VecDeque::new(),
            placed: Vec::new(),
            cancels: Vec::new(),
            leverage_calls: Vec::new(),
            fill_by_default: true,
        }
    }

    pub fn spot(symbol: &str, quote_balance: Decimal) -> Self {
        let mut state = Self::base_state(symbol);
        let (base, quote_asset) = symbol.split_once('/').unwrap_or((symbol, "USDC"));
        state.balances = vec![
            AssetBalance {
                asset: quote_asset.to_string(),
                total: quote_balance,
                available: quote_balance,
            },
            AssetBalance {
                asset: base.to_string(),
                total: Decimal::ZERO,
                available: Decimal::ZERO,
            },
        ];
        Self::build("scripted-spot", symbol, false, state)
    }

    pub fn perp(symbol: &str, funding_rate: Decimal) -> Self {
        let mut state = Self::base_state(symbol);
        state.funding = Some(FundingInfo {
            rate: funding_rate,
            mark_price: dec!(10.01),
        });
        Self::build("scripted-perp", symbol, true, state)
    }

    pub fn set_quote(&self, q: Quote) {
        self.state.lock().unwrap().quote = q;
    }

    pub fn set_funding(&self, rate: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.funding_fails = false;
        state.funding = Some(FundingInfo {
            rate,
            mark_price: dec!(10.01),
        });
    }

    pub fn fail_funding(&self) {
        self.state.lock().unwrap().funding_fails = true;
    }

    /// Unqueued orders rest on the book instead of filling.
    pub fn rest_by_default(&self) {
        self.state.lock().unwrap().fill_by_default = false;
    }

    pub fn queue_outcome(&self, outcome: OrderOutcome) {
        self.state.lock().unwrap().queued.push_back(Ok(outcome));
    }

    pub fn queue_error(&self, err: GatewayError) {
        self.state.lock().unwrap().queued.push_back(Err(err));
    }

    pub fn set_position(&self, signed_size: Decimal) {
        self.state.lock().unwrap().position = signed_size;
    }

    pub fn position(&self) -> Decimal {
        self.state.lock().unwrap().position
    }

    pub fn set_base_balance(&self, amount: Decimal) {
        let base = self.base_asset();
        let mut state = self.state.lock().unwrap();
        if let Some(b) = state.balances.iter_mut().find(|b| b.asset == base) {
            b.total = amount;
            b.available = amount;
        }
    }

    pub fn base_balance(&self) -> Decimal {
        let base = self.base_asset();
        let state = self.state.lock().unwrap();
        state
            .balances
            .iter()
            .find(|b| b.asset == base)
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn add_open_order(&self, order_id: &str, side: OrderSide, size: Decimal) {
        let mut state = self.state.lock().unwrap();
        let price = state.quote.bid;
        state.open_orders.push(OpenOrder {
            order_id: order_id.to_string(),
            symbol: self.symbol.clone(),
            side,
            size,
            price,
        });
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancels(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().cancels.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32, bool)> {
        self.state.lock().unwrap().leverage_calls.clone()
    }

    fn base_asset(&self) -> String {
        self.symbol
            .split_once('/')
            .map(|(base, _)| base.to_string())
            .unwrap_or_else(|| self.symbol.clone())
    }

    fn apply_fill(&self, state: &mut VenueState, side: OrderSide, size: Decimal, price: Decimal) {
        if self.is_perp {
            match side {
                OrderSide::Buy => state.position += size,
                OrderSide::Sell => state.position -= size,
            }
            return;
        }
        let base = self.base_asset();
        let notional = size * price;
        for b in state.balances.iter_mut() {
            let delta = if b.asset == base {
                match side {
                    OrderSide::Buy => size,
                    OrderSide::Sell => -size,
                }
            } else {
                match side {
                    OrderSide::Buy => -notional,
                    OrderSide::Sell => notional,
                }
            };
            b.total += delta;
            b.available += delta;
        }
    }
}

#[async_trait]
impl VenueGateway for ScriptedGateway {
    fn venue_name(&self) -> &str {
        &self.name
    }

    fn normalize_symbol(&self, raw: &str) -> Result<String, GatewayError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::InvalidSymbol(raw.to_string()));
        }
        Ok(trimmed.to_ascii_uppercase())
    }

    async fn get_symbol_meta(&self, _symbol: &str) -> Result<SymbolMeta, GatewayError> {
        Ok(self.state.lock().unwrap().meta.clone())
    }

    async fn get_quote(&self, _symbol: &str) -> Result<Quote, GatewayError> {
        Ok(self.state.lock().unwrap().quote)
    }

    async fn get_balances(&self) -> Result<BalanceSnapshot, GatewayError> {
        Ok(BalanceSnapshot {
            balances: self.state.lock().unwrap().balances.clone(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let state = self.state.lock().unwrap();
        if !self.is_perp || state.position == Decimal::ZERO {
            return Ok(Vec::new());
        }
        Ok(vec![PositionSnapshot {
            symbol: self.symbol.clone(),
            signed_size: state.position,
            entry_price: Some(dec!(10.01)),
            leverage: None,
        }])
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(self.state.lock().unwrap().open_orders.clone())
    }

    async fn get_funding(&self, _symbol: &str) -> Result<Option<FundingInfo>, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.funding_fails {
            return Err(GatewayError::Network("funding endpoint down".to_string()));
        }
        Ok(state.funding)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderOutcome, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.placed.push(req.clone());
        let outcome = match state.queued.pop_front() {
            Some(result) => result?,
            None if state.fill_by_default => OrderOutcome::Filled {
                size: req.qty,
                avg_price: req.price,
                maker: false,
                resting_order_id: None,
            },
            None => OrderOutcome::Resting {
                order_id: format!("o-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            },
        };
        if let Some(fill) = outcome.fill() {
            self.apply_fill(&mut state, req.side, fill.size, fill.avg_price);
        }
        if let Some(order_id) = outcome.resting_order_id() {
            let remaining = req.qty - outcome.fill().map(|f| f.size).unwrap_or(Decimal::ZERO);
            state.open_orders.push(OpenOrder {
                order_id: order_id.to_string(),
                symbol: req.symbol.clone(),
                side: req.side,
                size: remaining,
                price: req.price,
            });
        }
        Ok(outcome)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state
            .cancels
            .push((symbol.to_string(), order_id.to_string()));
        let before = state.open_orders.len();
        state.open_orders.retain(|o| o.order_id != order_id);
        if state.open_orders.len() < before {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        cross_margin: bool,
    ) -> Result<(), GatewayError> {
        if !self.is_perp {
            return Err(GatewayError::NotApplicable);
        }
        self.state
            .lock()
            .unwrap()
            .leverage_calls
            .push((symbol.to_string(), leverage, cross_margin));
        Ok(())
    }
}
