use crate::gateway::{
    CancelOutcome, Fill, OrderOutcome, OrderRequest, OrderSide, Quote, SymbolMeta, TimeInForce,
    VenueGateway,
};
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub enter_threshold_apr: Decimal,
    pub exit_threshold_apr: Decimal,
    pub target_usd_notional: Decimal,
    pub hedge_ratio: Decimal,
    /// When set, the per-window rate is multiplied by this before comparison.
    pub funding_periods_per_year: Option<Decimal>,
    pub price_offset_ticks: u32,
    pub tif: TimeInForce,
    pub post_only: bool,
    pub min_spread_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct MarketPair {
    pub base: String,
    pub spot_symbol: String,
    pub perp_symbol: String,
}

impl MarketPair {
    pub fn quote_asset(&self) -> &str {
        self.spot_symbol
            .split_once('/')
            .map(|(_, quote)| quote)
            .unwrap_or("USDC")
    }

    pub fn base_asset(&self) -> &str {
        self.spot_symbol
            .split_once('/')
            .map(|(base, _)| base)
            .unwrap_or(self.base.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FundingSignal {
    pub rate: Decimal,
    pub apr: Decimal,
    pub mark_price: Decimal,
}

/// Conditions owned by the control loop that gate a new entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryGate {
    pub has_exposure: bool,
    pub flatten_cooldown_elapsed: bool,
    pub exit_cooldown_elapsed: bool,
}

/// Holds an exit "in progress" so repeated low readings do not fire a
/// cancel/close storm; a retrigger needs `grace` to pass.
#[derive(Debug, Clone)]
pub struct ExitDebounce {
    grace: Duration,
    in_progress: bool,
    last_trigger: Option<Instant>,
}

impl ExitDebounce {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            in_progress: false,
            last_trigger: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        if !self.in_progress {
            return true;
        }
        match self.last_trigger {
            Some(at) => now.saturating_duration_since(at) > self.grace,
            None => true,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.in_progress = true;
        self.last_trigger = Some(now);
    }

    pub fn clear(&mut self) {
        self.in_progress = false;
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SkipReason {
    QuoteUnavailable,
    MetaUnavailable,
    ZeroSize,
    BelowMinimum,
    SpreadTooNarrow { leg: &'static str, ticks: Decimal },
    BalanceUnavailable,
    InsufficientBalance { needed: Decimal, available: Decimal },
    Halted,
    RateLimited,
    Throttled,
    OpenOrders { spot: usize, perp: usize },
    TargetReached,
    NotionalCap { remaining: Decimal },
    RepairActive,
    ExitInProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::QuoteUnavailable => write!(f, "quote_unavailable"),
            SkipReason::MetaUnavailable => write!(f, "meta_unavailable"),
            SkipReason::ZeroSize => write!(f, "zero_size"),
            SkipReason::BelowMinimum => write!(f, "below_minimum"),
            SkipReason::SpreadTooNarrow { leg, ticks } => {
                write!(f, "spread_too_narrow leg={} ticks={}", leg, ticks)
            }
            SkipReason::BalanceUnavailable => write!(f, "balance_unavailable"),
            SkipReason::InsufficientBalance { needed, available } => write!(
                f,
                "insufficient_balance needed={} available={}",
                needed, available
            ),
            SkipReason::Halted => write!(f, "guard_halted"),
            SkipReason::RateLimited => write!(f, "rate_limited"),
            SkipReason::Throttled => write!(f, "throttled"),
            SkipReason::OpenOrders { spot, perp } => {
                write!(f, "open_orders spot={} perp={}", spot, perp)
            }
            SkipReason::TargetReached => write!(f, "target_reached"),
            SkipReason::NotionalCap { remaining } => {
                write!(f, "notional_cap remaining={}", remaining)
            }
            SkipReason::RepairActive => write!(f, "repair_active"),
            SkipReason::ExitInProgress => write!(f, "exit_in_progress"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LegPlan {
    pub spot_qty: Decimal,
    pub perp_qty: Decimal,
    pub spot_price: Decimal,
    pub perp_price: Decimal,
    pub spot_quote: Quote,
    pub perp_quote: Quote,
    #[serde(skip)]
    pub spot_meta: SymbolMeta,
    #[serde(skip)]
    pub perp_meta: SymbolMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EntryOutcome {
    Entered,
    Skipped(SkipReason),
    SpotLegFailed,
    PerpLegFailed { spot_cancel: Option<CancelOutcome> },
}

/// What happened on both legs. Fill fields are populated regardless of the
/// outcome so partial fills can always be booked.
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub outcome: EntryOutcome,
    pub plan: Option<LegPlan>,
    pub spot: Option<OrderOutcome>,
    pub perp: Option<OrderOutcome>,
    pub spot_fill: Option<Fill>,
    pub perp_fill: Option<Fill>,
}

impl EntryReport {
    fn skipped(reason: SkipReason, plan: Option<LegPlan>) -> Self {
        Self {
            outcome: EntryOutcome::Skipped(reason),
            plan,
            spot: None,
            perp: None,
            spot_fill: None,
            perp_fill: None,
        }
    }

    pub fn entered(&self) -> bool {
        self.outcome == EntryOutcome::Entered
    }

    pub fn spot_filled_size(&self) -> Decimal {
        self.spot_fill.map(|f| f.size).unwrap_or(Decimal::ZERO)
    }

    pub fn perp_filled_size(&self) -> Decimal {
        self.perp_fill.map(|f| f.size).unwrap_or(Decimal::ZERO)
    }

    /// Hedge leg executed while the exposure leg did not.
    pub fn is_asymmetric(&self) -> bool {
        self.perp_filled_size() > Decimal::ZERO && self.spot_filled_size() == Decimal::ZERO
    }

    pub fn spot_order_id(&self) -> Option<&str> {
        self.spot.as_ref().and_then(|o| o.resting_order_id())
    }
}

pub struct StrategyDecisionEngine {
    spot: Arc<dyn VenueGateway>,
    perp: Arc<dyn VenueGateway>,
    pair: MarketPair,
    params: StrategyParams,
}

impl StrategyDecisionEngine {
    pub fn new(
        spot: Arc<dyn VenueGateway>,
        perp: Arc<dyn VenueGateway>,
        pair: MarketPair,
        params: StrategyParams,
    ) -> Self {
        Self {
            spot,
            perp,
            pair,
            params,
        }
    }

    /// Fails soft: any gateway problem yields `None` and the cycle is skipped.
    pub async fn compute_signal(&self) -> Option<FundingSignal> {
        match self.perp.get_funding(&self.pair.perp_symbol).await {
            Ok(Some(info)) => {
                let apr = match self.params.funding_periods_per_year {
                    Some(periods) => info.rate * periods,
                    None => info.rate,
                };
                Some(FundingSignal {
                    rate: info.rate,
                    apr,
                    mark_price: info.mark_price,
                })
            }
            Ok(None) => {
                log::debug!("[SIGNAL] no funding reported for {}", self.pair.perp_symbol);
                None
            }
            Err(err) => {
                log::warn!(
                    "[SIGNAL] funding unavailable for {}: {}",
                    self.pair.perp_symbol,
                    err
                );
                None
            }
        }
    }

    pub fn should_enter(&self, signal: &FundingSignal, gate: EntryGate) -> bool {
        signal.apr >= self.params.enter_threshold_apr
            && !gate.has_exposure
            && gate.flatten_cooldown_elapsed
            && gate.exit_cooldown_elapsed
    }

    pub fn should_exit(
        &self,
        signal: &FundingSignal,
        has_activity: bool,
        debounce: &ExitDebounce,
        now: Instant,
    ) -> bool {
        signal.apr <= self.params.exit_threshold_apr && has_activity && debounce.ready(now)
    }

    /// Read metadata and quotes for both legs and derive sizes and prices.
    pub async fn plan_entry(&self) -> Result<LegPlan, SkipReason> {
        let spot_meta = self
            .spot
            .get_symbol_meta(&self.pair.spot_symbol)
            .await
            .map_err(|_| SkipReason::MetaUnavailable)?;
        let perp_meta = self
            .perp
            .get_symbol_meta(&self.pair.perp_symbol)
            .await
            .map_err(|_| SkipReason::MetaUnavailable)?;
        let spot_quote = self
            .spot
            .get_quote(&self.pair.spot_symbol)
            .await
            .map_err(|_| SkipReason::QuoteUnavailable)?;
        let perp_quote = self
            .perp
            .get_quote(&self.pair.perp_symbol)
            .await
            .map_err(|_| SkipReason::QuoteUnavailable)?;

        let spot_mid = spot_quote.mid().ok_or(SkipReason::QuoteUnavailable)?;
        if perp_quote.mid().is_none() {
            return Err(SkipReason::QuoteUnavailable);
        }

        if self.params.min_spread_ticks > 0 {
            let min = Decimal::from(self.params.min_spread_ticks);
            for (leg, quote, meta) in [
                ("spot", &spot_quote, &spot_meta),
                ("perp", &perp_quote, &perp_meta),
            ] {
                if let Some(spread) = quote.spread() {
                    if meta.tick_size > Decimal::ZERO {
                        let ticks = spread / meta.tick_size;
                        if ticks < min {
                            return Err(SkipReason::SpreadTooNarrow { leg, ticks });
                        }
                    }
                }
            }
        }

        let (spot_qty, perp_qty) = size_legs(
            self.params.target_usd_notional,
            self.params.hedge_ratio,
            spot_mid,
            spot_meta.size_step(),
            perp_meta.size_step(),
        );
        if spot_qty <= Decimal::ZERO || perp_qty <= Decimal::ZERO {
            return Err(SkipReason::ZeroSize);
        }
        if below_minimum(&spot_meta, spot_qty, spot_mid)
            || below_minimum(&perp_meta, perp_qty, spot_mid)
        {
            return Err(SkipReason::BelowMinimum);
        }

        let spot_price = passive_price(
            OrderSide::Buy,
            &spot_quote,
            spot_meta.tick_size,
            self.params.price_offset_ticks,
            self.params.post_only,
        );
        let perp_price = passive_price(
            OrderSide::Sell,
            &perp_quote,
            perp_meta.tick_size,
            self.params.price_offset_ticks,
            self.params.post_only,
        );

        Ok(LegPlan {
            spot_qty,
            perp_qty,
            spot_price,
            perp_price,
            spot_quote,
            perp_quote,
            spot_meta,
            perp_meta,
        })
    }

    /// Two-leg entry: balance check, spot BUY, then perp SELL. A failed perp
    /// leg triggers a best-effort cancel of a resting spot order.
    pub async fn attempt_entry(&self) -> EntryReport {
        let plan = match self.plan_entry().await {
            Ok(plan) => plan,
            Err(reason) => return EntryReport::skipped(reason, None),
        };

        let quote_asset = self.pair.quote_asset().to_string();
        let available = match self.spot.get_balances().await {
            Ok(balances) => balances.total_of(&quote_asset),
            Err(err) => {
                log::warn!("[ENTRY] balance check failed: {}", err);
                return EntryReport::skipped(SkipReason::BalanceUnavailable, Some(plan));
            }
        };
        let needed = plan.spot_qty * plan.spot_price;
        if available <= Decimal::ZERO || needed > available {
            return EntryReport::skipped(
                SkipReason::InsufficientBalance { needed, available },
                Some(plan),
            );
        }

        log::debug!(
            "[ORDER_PARAMS][ENTRY] spot={} qty={} px={} bid={} ask={} perp={} qty={} px={} bid={} ask={} tif={} post_only={}",
            self.pair.spot_symbol,
            plan.spot_qty,
            plan.spot_price,
            plan.spot_quote.bid,
            plan.spot_quote.ask,
            self.pair.perp_symbol,
            plan.perp_qty,
            plan.perp_price,
            plan.perp_quote.bid,
            plan.perp_quote.ask,
            self.params.tif,
            self.params.post_only
        );

        let spot_req = OrderRequest::limit(
            &self.pair.spot_symbol,
            OrderSide::Buy,
            plan.spot_qty,
            plan.spot_price,
        )
        .with_tif(self.params.tif)
        .post_only(self.params.post_only);
        let spot_outcome = match self.spot.place_order(&spot_req).await {
            Ok(outcome) => outcome,
            Err(err) => OrderOutcome::Error {
                code: "gateway".to_string(),
                message: err.to_string(),
            },
        };
        if spot_outcome.is_error() {
            log::warn!(
                "[ENTRY] spot leg rejected {}: {:?}",
                self.pair.spot_symbol,
                spot_outcome
            );
            return EntryReport {
                outcome: EntryOutcome::SpotLegFailed,
                plan: Some(plan),
                spot: Some(spot_outcome),
                perp: None,
                spot_fill: None,
                perp_fill: None,
            };
        }

        let perp_req = OrderRequest::limit(
            &self.pair.perp_symbol,
            OrderSide::Sell,
            plan.perp_qty,
            plan.perp_price,
        )
        .with_tif(self.params.tif)
        .post_only(self.params.post_only);
        let perp_outcome = match self.perp.place_order(&perp_req).await {
            Ok(outcome) => outcome,
            Err(err) => OrderOutcome::Error {
                code: "gateway".to_string(),
                message: err.to_string(),
            },
        };

        let spot_fill = spot_outcome.fill();
        let perp_fill = perp_outcome.fill();

        if perp_outcome.is_error() {
            log::error!(
                "[ORDER] Failed to place perp leg for {} (spot={:?}): {:?}",
                self.pair.perp_symbol,
                spot_outcome.resting_order_id(),
                perp_outcome
            );
            let spot_cancel = match spot_outcome.resting_order_id() {
                Some(order_id) => {
                    let cancel = match self
                        .spot
                        .cancel_order(&self.pair.spot_symbol, order_id)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => CancelOutcome::Error {
                            message: err.to_string(),
                        },
                    };
                    match &cancel {
                        CancelOutcome::Cancelled => log::info!(
                            "[SAFETY] Canceled spot leg {} after perp leg failed.",
                            order_id
                        ),
                        other => log::warn!(
                            "[SAFETY] Failed to cancel spot leg {} after perp leg failed: {:?}",
                            order_id,
                            other
                        ),
                    }
                    Some(cancel)
                }
                None => None,
            };
            return EntryReport {
                outcome: EntryOutcome::PerpLegFailed { spot_cancel },
                plan: Some(plan),
                spot: Some(spot_outcome),
                perp: Some(perp_outcome),
                spot_fill,
                perp_fill,
            };
        }

        EntryReport {
            outcome: EntryOutcome::Entered,
            plan: Some(plan),
            spot: Some(spot_outcome),
            perp: Some(perp_outcome),
            spot_fill,
            perp_fill,
        }
    }
}

fn below_minimum(meta: &SymbolMeta, qty: Decimal, ref_price: Decimal) -> bool {
    if let Some(min_qty) = meta.min_qty {
        if qty < min_qty {
            return true;
        }
    }
    if let Some(min_notional) = meta.min_notional {
        if qty * ref_price < min_notional {
            return true;
        }
    }
    false
}

/// Common base quantity from the USD target, floored independently per venue.
pub fn size_legs(
    target_usd_notional: Decimal,
    hedge_ratio: Decimal,
    spot_mid: Decimal,
    spot_step: Decimal,
    perp_step: Decimal,
) -> (Decimal, Decimal) {
    if spot_mid <= Decimal::ZERO || target_usd_notional <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let base_qty = target_usd_notional / spot_mid * hedge_ratio;
    (
        floor_to_step(base_qty, spot_step),
        floor_to_step(base_qty, perp_step),
    )
}

/// Offset from the touch by `offset_ticks`; with `post_only` the price is
/// clamped so it never reaches the opposing side.
pub fn passive_price(
    side: OrderSide,
    quote: &Quote,
    tick: Decimal,
    offset_ticks: u32,
    post_only: bool,
) -> Decimal {
    let offset = tick * Decimal::from(offset_ticks);
    let raw = match side {
        OrderSide::Buy => {
            let mut px = quote.bid + offset;
            if post_only && quote.ask > Decimal::ZERO && px >= quote.ask {
                px = quote.bid.max(quote.ask - tick);
            }
            px
        }
        OrderSide::Sell => {
            let mut px = quote.ask - offset;
            if post_only && quote.bid > Decimal::ZERO && px <= quote.bid {
                px = quote.ask.min(quote.bid + tick);
            }
            px
        }
    };
    round_price_by_tick(raw, tick, side)
}

/// Price that crosses the spread by `extra_ticks` beyond the touch.
pub fn aggressive_price(side: OrderSide, quote: &Quote, tick: Decimal, extra_ticks: u32) -> Option<Decimal> {
    let extra = tick * Decimal::from(extra_ticks);
    let px = match side {
        OrderSide::Buy => {
            let touch = if quote.ask > Decimal::ZERO {
                quote.ask
            } else {
                quote.mid()?
            };
            touch + extra
        }
        OrderSide::Sell => {
            let touch = if quote.bid > Decimal::ZERO {
                quote.bid
            } else {
                quote.mid()?
            };
            (touch - extra).max(tick)
        }
    };
    Some(round_price_by_tick(px, tick, side.opposite()))
}

/// Round a price onto the tick grid: buys down, sells up.
pub fn round_price_by_tick(price: Decimal, step: Decimal, side: OrderSide) -> Decimal {
    if step <= Decimal::ZERO {
        return price;
    }
    let rounding = match side {
        OrderSide::Buy => RoundingStrategy::ToNegativeInfinity,
        OrderSide::Sell => RoundingStrategy::ToPositiveInfinity,
    };
    let mut multiples = (price / step).round_dp_with_strategy(0, rounding);
    if multiples < Decimal::ONE {
        multiples = Decimal::ONE;
    }
    let rounded = multiples * step;
    rounded.round_dp_with_strategy(step.scale(), RoundingStrategy::ToZero)
}

/// Truncate toward zero onto the size grid. May return zero.
pub fn floor_to_step(size: Decimal, step: Decimal) -> Decimal {
    if size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if step <= Decimal::ZERO {
        return size;
    }
    let multiples = (size / step).trunc();
    (multiples * step).round_dp_with_strategy(step.scale(), RoundingStrategy::ToZero)
}
