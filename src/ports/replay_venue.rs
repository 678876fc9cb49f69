use crate::gateway::{
    AssetBalance, BalanceSnapshot, CancelOutcome, FundingInfo, GatewayError, OpenOrder,
    OrderOutcome, OrderRequest, OrderSide, PositionSnapshot, Quote, SymbolMeta, TimeInForce,
    VenueGateway,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

// One line of the recorded tape
#[derive(Debug, Clone, Deserialize)]
pub struct BookRow {
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerpRow {
    pub bid: Decimal,
    pub ask: Decimal,
    pub funding: Decimal,
    #[serde(default)]
    pub mark: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRow {
    pub timestamp: i64,
    pub spot: BookRow,
    pub perp: PerpRow,
}

/// Recorded quotes and funding readings, shared by both simulated venues.
/// The control loop advances it once per cycle.
#[derive(Debug)]
pub struct ReplayTape {
    rows: Vec<ReplayRow>,
    cursor: AtomicUsize,
}

impl ReplayTape {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file {}", path.display()))?;
        let mut rows = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read replay line {}", idx + 1))?;
            if let Some(row) = parse_row(&line, idx)? {
                rows.push(row);
            }
        }
        Self::from_rows(rows)
    }

    pub fn from_jsonl_str(raw: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if let Some(row) = parse_row(line, idx)? {
                rows.push(row);
            }
        }
        Self::from_rows(rows)
    }

    fn from_rows(rows: Vec<ReplayRow>) -> Result<Self> {
        if rows.is_empty() {
            return Err(anyhow!("replay tape is empty"));
        }
        Ok(Self {
            rows,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Advance one row. Returns false once the last row is current.
    pub fn tick(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.rows.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn current(&self) -> Option<&ReplayRow> {
        self.rows.get(self.cursor())
    }

    pub fn current_timestamp_secs(&self) -> Option<i64> {
        self.current().map(|row| row.timestamp / 1000) // stored as ms
    }
}

fn parse_row(line: &str, idx: usize) -> Result<Option<ReplayRow>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let row = serde_json::from_str::<ReplayRow>(line)
        .with_context(|| format!("failed to parse replay entry on line {}", idx + 1))?;
    Ok(Some(row))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketKind {
    Spot,
    Perp,
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub tick_size: Decimal,
    pub size_decimals: u32,
    pub quote_asset: String,
    pub quote_balance: Decimal,
    /// Chance that a resting order fills on a tape step without being crossed.
    pub fill_probability: Decimal,
}

#[derive(Debug, Clone)]
struct SimOrder {
    order_id: String,
    side: OrderSide,
    qty: Decimal,
    price: Decimal,
    reduce_only: bool,
}

#[derive(Debug, Default)]
struct SimBook {
    balances: HashMap<String, Decimal>,
    position: Decimal,
    entry_price: Option<Decimal>,
    leverage: Option<u32>,
    open_orders: Vec<SimOrder>,
    settled_cursor: Option<usize>,
}

/// Simulated venue driven by a [`ReplayTape`]. Crossing orders fill at the
/// touch as taker; passive orders rest until the tape trades through them.
pub struct ReplayVenue {
    kind: MarketKind,
    symbol: String,
    base_asset: String,
    settings: ReplaySettings,
    tape: Arc<ReplayTape>,
    book: Mutex<SimBook>,
    next_id: AtomicU64,
}

fn reject(code: &str, message: &str) -> OrderOutcome {
    OrderOutcome::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
}

impl ReplayVenue {
    pub fn spot(tape: Arc<ReplayTape>, symbol: &str, settings: ReplaySettings) -> Self {
        let symbol = symbol.trim().to_ascii_uppercase();
        let base_asset = symbol
            .split_once('/')
            .map(|(base, _)| base.to_string())
            .unwrap_or_else(|| symbol.clone());
        let mut book = SimBook::default();
        book.balances
            .insert(settings.quote_asset.clone(), settings.quote_balance);
        book.balances.insert(base_asset.clone(), Decimal::ZERO);
        Self::build(MarketKind::Spot, symbol, base_asset, settings, tape, book)
    }

    pub fn perp(tape: Arc<ReplayTape>, symbol: &str, settings: ReplaySettings) -> Self {
        let symbol = symbol.trim().to_ascii_uppercase();
        let mut book = SimBook::default();
        book.balances
            .insert(settings.quote_asset.clone(), settings.quote_balance);
        Self::build(MarketKind::Perp, symbol.clone(), symbol, settings, tape, book)
    }

    fn build(
        kind: MarketKind,
        symbol: String,
        base_asset: String,
        settings: ReplaySettings,
        tape: Arc<ReplayTape>,
        book: SimBook,
    ) -> Self {
        Self {
            kind,
            symbol,
            base_asset,
            settings,
            tape,
            book: Mutex::new(book),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn kind(&self) -> MarketKind {
        self.kind
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), GatewayError> {
        if symbol.eq_ignore_ascii_case(&self.symbol) {
            Ok(())
        } else {
            Err(GatewayError::InvalidSymbol(symbol.to_string()))
        }
    }

    fn current_quote(&self) -> Result<Quote, GatewayError> {
        let row = self
            .tape
            .current()
            .ok_or_else(|| GatewayError::Other("replay cursor out of bounds".to_string()))?;
        Ok(match self.kind {
            MarketKind::Spot => Quote {
                bid: row.spot.bid,
                ask: row.spot.ask,
            },
            MarketKind::Perp => Quote {
                bid: row.perp.bid,
                ask: row.perp.ask,
            },
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimBook>, GatewayError> {
        self.book
            .lock()
            .map_err(|_| GatewayError::Other("replay book lock poisoned".to_string()))
    }

    /// Lock the book and fill any resting orders the current row reaches.
    fn settled(&self) -> Result<MutexGuard<'_, SimBook>, GatewayError> {
        let mut book = self.lock()?;
        let cursor = self.tape.cursor();
        if book.settled_cursor == Some(cursor) {
            return Ok(book);
        }
        book.settled_cursor = Some(cursor);
        let quote = self.current_quote()?;
        let resting = std::mem::take(&mut book.open_orders);
        for order in resting {
            let crossed = match order.side {
                OrderSide::Buy => quote.ask > Decimal::ZERO && quote.ask <= order.price,
                OrderSide::Sell => quote.bid > Decimal::ZERO && quote.bid >= order.price,
            };
            if (crossed || self.lucky_fill()) && self.can_fill(&book, &order) {
                log::info!(
                    "[REPLAY_FILL] symbol={} side={} size={} price={} maker=true",
                    self.symbol,
                    order.side,
                    order.qty,
                    order.price
                );
                self.apply_fill(&mut book, order.side, order.qty, order.price);
            } else {
                book.open_orders.push(order);
            }
        }
        Ok(book)
    }

    fn lucky_fill(&self) -> bool {
        let p = self.settings.fill_probability;
        if p <= Decimal::ZERO {
            return false;
        }
        if p >= Decimal::ONE {
            return true;
        }
        let draw = Decimal::from(rand::thread_rng().gen_range(0..10_000u32)) / Decimal::from(10_000);
        draw < p
    }

    fn balance(&self, book: &SimBook, asset: &str) -> Decimal {
        book.balances.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    fn can_fill(&self, book: &SimBook, order: &SimOrder) -> bool {
        match (self.kind, order.side) {
            (MarketKind::Spot, OrderSide::Buy) => {
                self.balance(book, &self.settings.quote_asset) >= order.qty * order.price
            }
            (MarketKind::Spot, OrderSide::Sell) => {
                self.balance(book, &self.base_asset) >= order.qty
            }
            (MarketKind::Perp, side) => {
                !order.reduce_only || reduces(book.position, side, order.qty)
            }
        }
    }

    fn apply_fill(&self, book: &mut SimBook, side: OrderSide, qty: Decimal, price: Decimal) {
        match self.kind {
            MarketKind::Spot => {
                let notional = qty * price;
                let (base_delta, quote_delta) = match side {
                    OrderSide::Buy => (qty, -notional),
                    OrderSide::Sell => (-qty, notional),
                };
                *book
                    .balances
                    .entry(self.base_asset.clone())
                    .or_insert(Decimal::ZERO) += base_delta;
                *book
                    .balances
                    .entry(self.settings.quote_asset.clone())
                    .or_insert(Decimal::ZERO) += quote_delta;
            }
            MarketKind::Perp => {
                let signed = match side {
                    OrderSide::Buy => qty,
                    OrderSide::Sell => -qty,
                };
                let prior = book.position;
                let next = prior + signed;
                book.entry_price = if next == Decimal::ZERO {
                    None
                } else if prior == Decimal::ZERO || prior.is_sign_negative() != next.is_sign_negative() {
                    Some(price)
                } else if next.abs() > prior.abs() {
                    let prior_px = book.entry_price.unwrap_or(price);
                    Some((prior_px * prior.abs() + price * qty) / next.abs())
                } else {
                    book.entry_price
                };
                book.position = next;
            }
        }
    }
}

fn reduces(position: Decimal, side: OrderSide, qty: Decimal) -> bool {
    qty > Decimal::ZERO
        && match side {
            OrderSide::Buy => position < Decimal::ZERO,
            OrderSide::Sell => position > Decimal::ZERO,
        }
}

#[async_trait]
impl VenueGateway for ReplayVenue {
    fn venue_name(&self) -> &str {
        match self.kind {
            MarketKind::Spot => "replay-spot",
            MarketKind::Perp => "replay-perp",
        }
    }

    fn normalize_symbol(&self, raw: &str) -> Result<String, GatewayError> {
        let symbol = raw.trim().to_ascii_uppercase();
        let well_formed = match self.kind {
            MarketKind::Spot => symbol.matches('/').count() == 1,
            MarketKind::Perp => !symbol.is_empty() && !symbol.contains('/'),
        };
        if !well_formed {
            return Err(GatewayError::InvalidSymbol(raw.to_string()));
        }
        self.check_symbol(&symbol)?;
        Ok(symbol)
    }

    async fn get_symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError> {
        self.check_symbol(symbol)?;
        Ok(SymbolMeta {
            symbol: self.symbol.clone(),
            tick_size: self.settings.tick_size,
            size_decimals: self.settings.size_decimals,
            min_qty: None,
            min_notional: None,
        })
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, GatewayError> {
        self.check_symbol(symbol)?;
        self.current_quote()
    }

    async fn get_balances(&self) -> Result<BalanceSnapshot, GatewayError> {
        let book = self.settled()?;
        let mut balances: Vec<AssetBalance> = book
            .balances
            .iter()
            .map(|(asset, amount)| AssetBalance {
                asset: asset.clone(),
                total: *amount,
                available: *amount,
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(BalanceSnapshot { balances })
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let book = self.settled()?;
        if self.kind == MarketKind::Spot || book.position == Decimal::ZERO {
            return Ok(Vec::new());
        }
        Ok(vec![PositionSnapshot {
            symbol: self.symbol.clone(),
            signed_size: book.position,
            entry_price: book.entry_price,
            leverage: book.leverage,
        }])
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let book = self.settled()?;
        Ok(book
            .open_orders
            .iter()
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                symbol: self.symbol.clone(),
                side: o.side,
                size: o.qty,
                price: o.price,
            })
            .collect())
    }

    async fn get_funding(&self, symbol: &str) -> Result<Option<FundingInfo>, GatewayError> {
        self.check_symbol(symbol)?;
        if self.kind == MarketKind::Spot {
            return Ok(None);
        }
        let row = self
            .tape
            .current()
            .ok_or_else(|| GatewayError::Other("replay cursor out of bounds".to_string()))?;
        let mark = row
            .perp
            .mark
            .or_else(|| self.current_quote().ok().and_then(|q| q.mid()))
            .unwrap_or(Decimal::ZERO);
        Ok(Some(FundingInfo {
            rate: row.perp.funding,
            mark_price: mark,
        }))
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderOutcome, GatewayError> {
        self.check_symbol(&req.symbol)?;
        let quote = self.current_quote()?;
        let mut book = self.settled()?;

        if req.qty <= Decimal::ZERO || req.price <= Decimal::ZERO {
            return Ok(reject("invalid", "Order size and price must be positive"));
        }

        let mut qty = req.qty;
        if req.reduce_only {
            if self.kind == MarketKind::Spot || !reduces(book.position, req.side, qty) {
                return Ok(reject(
                    "reduce_only",
                    "Reduce only order would increase position",
                ));
            }
            qty = qty.min(book.position.abs());
        }

        let crosses = match req.side {
            OrderSide::Buy => quote.ask > Decimal::ZERO && req.price >= quote.ask,
            OrderSide::Sell => quote.bid > Decimal::ZERO && req.price <= quote.bid,
        };
        if crosses && (req.post_only || req.tif == TimeInForce::Alo) {
            return Ok(reject(
                "post_only",
                "Post only order would have immediately matched",
            ));
        }
        if !crosses && req.tif == TimeInForce::Ioc {
            return Ok(reject("ioc", "Order could not immediately match"));
        }

        let fill_price = match req.side {
            OrderSide::Buy if crosses => quote.ask,
            OrderSide::Sell if crosses => quote.bid,
            _ => req.price,
        };
        let order = SimOrder {
            order_id: self.next_id.fetch_add(1, AtomicOrdering::SeqCst).to_string(),
            side: req.side,
            qty,
            price: fill_price,
            reduce_only: req.reduce_only,
        };
        if !self.can_fill(&book, &order) {
            return Ok(reject("margin", "Insufficient balance"));
        }

        if crosses {
            log::info!(
                "[REPLAY_FILL] symbol={} side={} size={} price={} maker=false",
                self.symbol,
                req.side,
                qty,
                fill_price
            );
            self.apply_fill(&mut book, req.side, qty, fill_price);
            return Ok(OrderOutcome::Filled {
                size: qty,
                avg_price: fill_price,
                maker: false,
                resting_order_id: None,
            });
        }

        let order_id = order.order_id.clone();
        book.open_orders.push(order);
        Ok(OrderOutcome::Resting { order_id })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        self.check_symbol(symbol)?;
        let mut book = self.settled()?;
        let before = book.open_orders.len();
        book.open_orders.retain(|o| o.order_id != order_id);
        if book.open_orders.len() < before {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::NotFound)
        }
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        _cross_margin: bool,
    ) -> Result<(), GatewayError> {
        if self.kind == MarketKind::Spot {
            return Err(GatewayError::NotApplicable);
        }
        self.check_symbol(symbol)?;
        self.lock()?.leverage = Some(leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TAPE: &str = r#"
{"timestamp": 1700000000000, "spot": {"bid": "10.00", "ask": "10.02"}, "perp": {"bid": "10.00", "ask": "10.02", "funding": "0.20", "mark": "10.01"}}
{"timestamp": 1700000001000, "spot": {"bid": "9.95", "ask": "9.97"}, "perp": {"bid": "9.95", "ask": "9.97", "funding": "0.15"}}
"#;

    fn settings(fill_probability: Decimal) -> ReplaySettings {
        ReplaySettings {
            tick_size: dec!(0.01),
            size_decimals: 2,
            quote_asset: "USDC".to_string(),
            quote_balance: dec!(1000),
            fill_probability,
        }
    }

    fn venues() -> (Arc<ReplayTape>, ReplayVenue, ReplayVenue) {
        let tape = Arc::new(ReplayTape::from_jsonl_str(TAPE).unwrap());
        let spot = ReplayVenue::spot(tape.clone(), "aster/usdc", settings(Decimal::ZERO));
        let perp = ReplayVenue::perp(tape.clone(), "ASTER", settings(Decimal::ZERO));
        (tape, spot, perp)
    }

    #[test]
    fn tape_ticks_until_last_row() {
        let tape = ReplayTape::from_jsonl_str(TAPE).unwrap();
        assert_eq!(tape.len(), 2);
        assert_eq!(tape.current_timestamp_secs(), Some(1_700_000_000));
        assert!(tape.tick());
        assert!(!tape.tick());
        assert_eq!(tape.cursor(), 1);
    }

    #[test]
    fn empty_tape_is_rejected() {
        assert!(ReplayTape::from_jsonl_str("\n\n").is_err());
        assert!(ReplayTape::from_jsonl_str("{not json}").is_err());
    }

    #[tokio::test]
    async fn funding_falls_back_to_mid_without_mark() {
        let (tape, spot, perp) = venues();
        assert_eq!(spot.get_funding("ASTER/USDC").await.unwrap(), None);
        let first = perp.get_funding("ASTER").await.unwrap().unwrap();
        assert_eq!(first.mark_price, dec!(10.01));
        tape.tick();
        let second = perp.get_funding("ASTER").await.unwrap().unwrap();
        assert_eq!(second.rate, dec!(0.15));
        assert_eq!(second.mark_price, dec!(9.96));
    }

    #[tokio::test]
    async fn crossing_buy_fills_at_ask_and_moves_balances() {
        let (_tape, spot, _perp) = venues();
        let req = OrderRequest::limit("ASTER/USDC", OrderSide::Buy, dec!(10), dec!(10.05));
        let outcome = spot.place_order(&req).await.unwrap();
        assert_eq!(outcome.fill().map(|f| f.avg_price), Some(dec!(10.02)));
        let balances = spot.get_balances().await.unwrap();
        assert_eq!(balances.total_of("ASTER"), dec!(10));
        assert_eq!(balances.total_of("USDC"), dec!(899.8));
    }

    #[tokio::test]
    async fn post_only_cross_is_rejected() {
        let (_tape, _spot, perp) = venues();
        let req = OrderRequest::limit("ASTER", OrderSide::Sell, dec!(1), dec!(10.00)).post_only(true);
        let outcome = perp.place_order(&req).await.unwrap();
        assert!(outcome.is_error());
        assert!(perp.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resting_order_fills_when_tape_trades_through() {
        let (tape, spot, _perp) = venues();
        let req = OrderRequest::limit("ASTER/USDC", OrderSide::Buy, dec!(5), dec!(9.98));
        let outcome = spot.place_order(&req).await.unwrap();
        assert!(outcome.resting_order_id().is_some());
        assert_eq!(spot.get_open_orders().await.unwrap().len(), 1);
        tape.tick();
        assert!(spot.get_open_orders().await.unwrap().is_empty());
        let balances = spot.get_balances().await.unwrap();
        assert_eq!(balances.total_of("ASTER"), dec!(5));
    }

    #[tokio::test]
    async fn ioc_that_cannot_cross_is_rejected() {
        let (_tape, spot, _perp) = venues();
        let req = OrderRequest::limit("ASTER/USDC", OrderSide::Buy, dec!(5), dec!(9.90))
            .with_tif(TimeInForce::Ioc);
        assert!(spot.place_order(&req).await.unwrap().is_error());
        assert!(spot.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reduce_only_is_capped_to_position() {
        let (_tape, _spot, perp) = venues();
        let open = OrderRequest::limit("ASTER", OrderSide::Sell, dec!(3), dec!(10.00));
        perp.place_order(&open).await.unwrap();
        let close = OrderRequest::limit("ASTER", OrderSide::Buy, dec!(5), dec!(10.02))
            .reduce_only(true);
        let outcome = perp.place_order(&close).await.unwrap();
        assert_eq!(outcome.fill().map(|f| f.size), Some(dec!(3)));
        assert!(perp.get_positions().await.unwrap().is_empty());

        let again = perp.place_order(&close).await.unwrap();
        assert!(again.is_error());
    }

    #[tokio::test]
    async fn spot_has_no_leverage_and_rejects_foreign_symbols() {
        let (_tape, spot, perp) = venues();
        assert_eq!(
            spot.set_leverage("ASTER/USDC", 2, true).await,
            Err(GatewayError::NotApplicable)
        );
        perp.set_leverage("ASTER", 3, true).await.unwrap();
        assert!(spot.normalize_symbol("ASTERUSDC").is_err());
        assert_eq!(spot.normalize_symbol(" aster/usdc ").unwrap(), "ASTER/USDC");
        assert!(perp.get_quote("BTC").await.is_err());
    }
}
