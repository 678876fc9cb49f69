use crate::config::{AlignmentMode, FundCarryConfig};
use crate::events::{EventKind, EventStore, JsonlEventStore, MemoryEventStore};
use crate::gateway::{
    position_for, GatewayError, OrderOutcome, OrderRequest, OrderSide, TimeInForce, VenueGateway,
};
use crate::ledger::{ExposureLedger, Leg, PnlSummary};
use crate::ports::replay_venue::ReplayTape;
use crate::repair::{HedgeRepairMachine, RepairAction, RepairPolicy, RepairProgress, RepairStage};
use crate::risk::RiskGuardLayer;
use crate::strategy::{
    aggressive_price, floor_to_step, EntryGate, EntryOutcome, EntryReport, ExitDebounce,
    FundingSignal, MarketPair, SkipReason, StrategyDecisionEngine, StrategyParams,
};
use crate::trade::execution::gateway_box::create_gateways;
use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const EXPOSURE_KEY: &str = "exposure";
const MIN_ENTRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineCounters {
    pub entries: u64,
    pub failed_entries: u64,
    pub exits: u64,
    pub skipped_cycles: u64,
    pub repairs_started: u64,
    pub repairs_completed: u64,
    pub repairs_unwound: u64,
    pub halts: u64,
    pub cycle_errors: u64,
}

/// What a single cycle decided.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleAction {
    NoSignal,
    Hold,
    Exit,
    ExitSuppressed,
    Entry(EntryOutcome),
    Skip(SkipReason),
}

pub struct FundingCarryEngine {
    cfg: FundCarryConfig,
    spot: Arc<dyn VenueGateway>,
    perp: Arc<dyn VenueGateway>,
    spot_symbol: String,
    perp_symbol: String,
    base_asset: String,
    strategy: StrategyDecisionEngine,
    ledger: ExposureLedger,
    risk: RiskGuardLayer,
    repair: HedgeRepairMachine,
    events: Box<dyn EventStore>,
    replay: Option<Arc<ReplayTape>>,
    exit_debounce: ExitDebounce,
    cooldown: Duration,
    min_entry_interval: Duration,
    last_entry: Option<Instant>,
    last_exit: Option<Instant>,
    last_flat: Option<Instant>,
    last_pnl_log: Option<Instant>,
    last_spot_entry_oid: Option<String>,
    cum_spot_usd: Decimal,
    cum_perp_usd: Decimal,
    counters: EngineCounters,
}

fn elapsed_since(last: Option<Instant>, window: Duration, now: Instant) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) >= window,
        None => true,
    }
}

fn outcome_value(outcome: &Result<Option<OrderOutcome>>) -> Value {
    match outcome {
        Ok(Some(o)) => json!({ "status": o.status_label(), "response": o }),
        Ok(None) => json!({ "status": "skipped" }),
        Err(err) => json!({ "status": "error", "error": format!("{:#}", err) }),
    }
}

impl FundingCarryEngine {
    pub async fn new(cfg: FundCarryConfig) -> Result<Self> {
        let venues = create_gateways(&cfg)
            .await
            .context("failed to create venue gateways")?;
        let events: Box<dyn EventStore> = match &cfg.runtime.event_log_dir {
            Some(dir) => Box::new(JsonlEventStore::open(dir)?),
            None => Box::new(MemoryEventStore::new()),
        };
        let mut engine = Self::with_gateways(cfg, venues.spot, venues.perp, events)?;
        engine.replay = venues.replay;
        Ok(engine)
    }

    pub fn with_gateways(
        cfg: FundCarryConfig,
        spot: Arc<dyn VenueGateway>,
        perp: Arc<dyn VenueGateway>,
        events: Box<dyn EventStore>,
    ) -> Result<Self> {
        let spot_symbol = spot
            .normalize_symbol(&cfg.markets.spot_symbol)
            .map_err(|e| anyhow!("spot symbol {}: {}", cfg.markets.spot_symbol, e))?;
        let perp_symbol = perp
            .normalize_symbol(&cfg.markets.perp_symbol)
            .map_err(|e| anyhow!("perp symbol {}: {}", cfg.markets.perp_symbol, e))?;

        let pair = MarketPair {
            base: cfg.markets.base.clone(),
            spot_symbol: spot_symbol.clone(),
            perp_symbol: perp_symbol.clone(),
        };
        let base_asset = pair.base_asset().to_string();
        let params = StrategyParams {
            enter_threshold_apr: cfg.strategy.enter_threshold_apr,
            exit_threshold_apr: cfg.strategy.exit_threshold_apr,
            target_usd_notional: cfg.strategy.target_usd_notional,
            hedge_ratio: cfg.strategy.hedge_ratio,
            funding_periods_per_year: cfg.strategy.funding_periods_per_year,
            price_offset_ticks: cfg.execution.price_offset_ticks,
            tif: cfg.execution.time_in_force,
            post_only: cfg.execution.post_only,
            min_spread_ticks: cfg.risk.min_spread_ticks,
        };
        let strategy = StrategyDecisionEngine::new(spot.clone(), perp.clone(), pair, params);
        let risk = RiskGuardLayer::new(
            cfg.risk.per_symbol_notional_cap,
            cfg.risk.portfolio_notional_cap,
            cfg.execution.max_actions_per_min,
            cfg.risk.max_drawdown_usd,
        );
        let repair = HedgeRepairMachine::new(RepairPolicy {
            timeout: Duration::from_millis(cfg.execution.hedge_repair_timeout_ms.max(1)),
            stage: Duration::from_millis(cfg.execution.hedge_repair_stage_ms),
            default_tif: cfg.execution.time_in_force,
            escalated_tif: cfg.execution.hedge_repair_tif,
            escalation_ticks: cfg.execution.price_offset_ticks,
        });
        let exit_debounce = ExitDebounce::new(Duration::from_secs(cfg.execution.exit_retrigger_s));
        let cooldown = Duration::from_secs(cfg.execution.enter_exit_cooldown_s);
        let min_entry_interval =
            Duration::from_millis(cfg.execution.reprice_interval_ms).max(MIN_ENTRY_INTERVAL);

        Ok(Self {
            cfg,
            spot,
            perp,
            spot_symbol,
            perp_symbol,
            base_asset,
            strategy,
            ledger: ExposureLedger::new(),
            risk,
            repair,
            events,
            replay: None,
            exit_debounce,
            cooldown,
            min_entry_interval,
            last_entry: None,
            last_exit: None,
            last_flat: None,
            last_pnl_log: None,
            last_spot_entry_oid: None,
            cum_spot_usd: Decimal::ZERO,
            cum_perp_usd: Decimal::ZERO,
            counters: EngineCounters::default(),
        })
    }

    pub fn with_replay(mut self, tape: Arc<ReplayTape>) -> Self {
        self.replay = Some(tape);
        self
    }

    pub fn ledger(&self) -> &ExposureLedger {
        &self.ledger
    }

    pub fn risk(&self) -> &RiskGuardLayer {
        &self.risk
    }

    pub fn repair(&self) -> &HedgeRepairMachine {
        &self.repair
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    fn record(&mut self, kind: EventKind, payload: Value) {
        if let Err(err) = self.events.append(kind, payload) {
            log::warn!("[EVENTS] failed to append {:?}: {:#}", kind, err);
        }
    }

    fn persist_exposure(&mut self) {
        let value = match serde_json::to_value(&self.ledger) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("[EVENTS] failed to encode exposure: {:?}", err);
                return;
            }
        };
        if let Err(err) = self.events.put(EXPOSURE_KEY, value) {
            log::warn!("[EVENTS] failed to store exposure: {:#}", err);
        }
    }

    fn restore_exposure(&mut self) {
        match self.events.get(EXPOSURE_KEY) {
            Ok(Some(value)) => match serde_json::from_value::<ExposureLedger>(value) {
                Ok(ledger) => {
                    log::info!(
                        "[STARTUP] restored exposure spot={} perp={}",
                        ledger.size(Leg::Spot),
                        ledger.size(Leg::Perp)
                    );
                    self.ledger = ledger;
                }
                Err(err) => log::warn!("[STARTUP] stored exposure unreadable: {:?}", err),
            },
            Ok(None) => log::info!("[STARTUP] no stored exposure"),
            Err(err) => log::warn!("[STARTUP] failed to read stored exposure: {:#}", err),
        }
    }

    /// Leverage, optional exposure restore and a pre-trade snapshot.
    pub async fn startup(&mut self) -> Result<()> {
        if self.cfg.runtime.restore_exposure {
            self.restore_exposure();
        }

        let leverage = self.cfg.execution.leverage;
        let cross = self.cfg.execution.cross_margin;
        match self.perp.set_leverage(&self.perp_symbol, leverage, cross).await {
            Ok(()) => log::info!(
                "[STARTUP] leverage applied symbol={} leverage={} cross={}",
                self.perp_symbol,
                leverage,
                cross
            ),
            Err(GatewayError::NotApplicable) => {
                log::debug!("[STARTUP] venue {} has no leverage setting", self.perp.venue_name())
            }
            Err(err) => log::warn!(
                "[STARTUP] failed to apply leverage symbol={} leverage={}: {}",
                self.perp_symbol,
                leverage,
                err
            ),
        }

        let balances = self.spot.get_balances().await.ok();
        let positions = self.perp.get_positions().await.ok();
        let spot_opens = self.spot.get_open_orders().await.ok();
        let perp_opens = self.perp.get_open_orders().await.ok();
        let venue_leverage = positions
            .as_deref()
            .and_then(|p| position_for(p, &self.perp_symbol))
            .and_then(|p| p.leverage);
        log::info!(
            "[STARTUP] pre_trade_state balances_spot={:?} positions_perp={:?} open_spot={:?} open_perp={:?} leverage={:?}",
            balances,
            positions,
            spot_opens.as_ref().map(|o| o.len()),
            perp_opens.as_ref().map(|o| o.len()),
            venue_leverage
        );

        let payload = json!({
            "spot_venue": self.spot.venue_name(),
            "perp_venue": self.perp.venue_name(),
            "spot_symbol": self.spot_symbol,
            "perp_symbol": self.perp_symbol,
            "dry_run": self.cfg.runtime.dry_run,
            "leverage": leverage,
            "cross_margin": cross,
            "restored_spot": self.ledger.size(Leg::Spot),
            "restored_perp": self.ledger.size(Leg::Perp),
        });
        self.record(EventKind::Startup, payload);
        Ok(())
    }

    /// Drive cycles until stopped, the tape ends, or `once` is set; then flatten.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<PnlSummary> {
        self.startup().await?;
        let interval = Duration::from_millis(self.cfg.interval_ms());
        let backoff = Duration::from_millis(self.cfg.execution.error_backoff_ms);

        loop {
            if *stop.borrow() {
                log::info!("[LOOP] stop requested");
                break;
            }
            let pause = match self.step().await {
                Ok(action) => {
                    log::debug!("[LOOP] cycle action={:?}", action);
                    interval
                }
                Err(err) => {
                    self.counters.cycle_errors += 1;
                    log::error!("[LOOP] cycle failed: {:#}", err);
                    backoff
                }
            };
            if self.cfg.runtime.once {
                break;
            }
            if let Some(tape) = &self.replay {
                if !tape.tick() {
                    log::info!("[REPLAY] tape exhausted after {} rows", tape.len());
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        log::warn!("[LOOP] stop channel closed");
                        break;
                    }
                }
            }
        }

        Ok(self.shutdown().await)
    }

    pub async fn step(&mut self) -> Result<CycleAction> {
        self.step_at(Instant::now()).await
    }

    /// One control cycle evaluated at `now`.
    pub async fn step_at(&mut self, now: Instant) -> Result<CycleAction> {
        let Some(signal) = self.strategy.compute_signal().await else {
            self.counters.skipped_cycles += 1;
            return Ok(CycleAction::NoSignal);
        };

        self.align().await;
        let (spot_mid, perp_mid) = self.mid_prices(Some(&signal)).await;
        self.maybe_log_pnl(&signal, spot_mid, perp_mid, now);
        self.update_drawdown(spot_mid, perp_mid);

        let action = if self.risk.drawdown.halted() && self.has_activity().await {
            if self.exit_debounce.ready(now) {
                self.run_exit("drawdown_halt", &signal, now).await;
                CycleAction::Exit
            } else {
                CycleAction::ExitSuppressed
            }
        } else if signal.apr <= self.cfg.strategy.exit_threshold_apr {
            self.exit_branch(&signal, now).await
        } else if signal.apr >= self.cfg.strategy.enter_threshold_apr {
            self.enter_branch(&signal, now).await
        } else {
            CycleAction::Hold
        };

        if self.repair.is_active() {
            self.drive_repair(now).await?;
        }
        Ok(action)
    }

    async fn has_open_orders(&self) -> bool {
        let spot = self
            .spot
            .get_open_orders()
            .await
            .map(|o| !o.is_empty())
            .unwrap_or(false);
        let perp = self
            .perp
            .get_open_orders()
            .await
            .map(|o| !o.is_empty())
            .unwrap_or(false);
        spot || perp
    }

    /// Venue-reported holdings above one size step count even when the
    /// ledger is empty, e.g. after a restart without a restored snapshot.
    async fn venue_exposure(&self) -> bool {
        let perp_held = match (
            self.perp_short_size().await,
            self.perp.get_symbol_meta(&self.perp_symbol).await,
        ) {
            (Ok(short), Ok(meta)) => short > meta.size_step(),
            _ => false,
        };
        if perp_held {
            return true;
        }
        match (
            self.spot_base_balance().await,
            self.spot.get_symbol_meta(&self.spot_symbol).await,
        ) {
            (Ok(base), Ok(meta)) => base > meta.size_step(),
            _ => false,
        }
    }

    async fn has_exposure(&self) -> bool {
        self.ledger.has_exposure() || self.venue_exposure().await
    }

    async fn has_activity(&self) -> bool {
        self.has_exposure().await || self.has_open_orders().await
    }

    async fn exit_branch(&mut self, signal: &FundingSignal, now: Instant) -> CycleAction {
        let active = self.has_activity().await;
        if !active {
            return CycleAction::Hold;
        }
        if !elapsed_since(self.last_entry, self.cooldown, now)
            || !elapsed_since(self.last_exit, self.cooldown, now)
        {
            log::debug!("[EXIT] suppressed by enter/exit cooldown");
            return CycleAction::ExitSuppressed;
        }
        if !self
            .strategy
            .should_exit(signal, active, &self.exit_debounce, now)
        {
            return CycleAction::ExitSuppressed;
        }
        self.run_exit("funding_below_exit", signal, now).await;
        CycleAction::Exit
    }

    async fn run_exit(&mut self, reason: &str, signal: &FundingSignal, now: Instant) {
        self.exit_debounce.mark(now);
        self.last_exit = Some(now);
        self.counters.exits += 1;
        log::info!(
            "[EXIT] reason={} apr={} rate={} spot_size={} perp_size={}",
            reason,
            signal.apr,
            signal.rate,
            self.ledger.size(Leg::Spot),
            self.ledger.size(Leg::Perp)
        );

        self.abandon_repair(reason).await;
        let cancelled = self.cancel_all().await;
        let perp = self.close_perp().await;
        if let Err(err) = &perp {
            log::warn!("[EXIT] perp close failed: {:#}", err);
        }
        let spot = self.close_spot().await;
        if let Err(err) = &spot {
            log::warn!("[EXIT] spot close failed: {:#}", err);
        }

        let payload = json!({
            "reason": reason,
            "apr": signal.apr,
            "rate": signal.rate,
            "cancelled": cancelled,
            "perp": outcome_value(&perp),
            "spot": outcome_value(&spot),
            "spot_size": self.ledger.size(Leg::Spot),
            "perp_size": self.ledger.size(Leg::Perp),
        });
        self.record(EventKind::Exit, payload);

        if !self.has_activity().await {
            self.mark_flat(now);
        }
    }

    /// Closing both legs supersedes any open repair episode.
    async fn abandon_repair(&mut self, reason: &str) {
        self.last_spot_entry_oid = None;
        if !self.repair.is_active() {
            return;
        }
        let residual = self.repair.target_size();
        if let Some(order_id) = self.repair.take_resting_order() {
            if let Err(err) = self.spot.cancel_order(&self.spot_symbol, &order_id).await {
                log::warn!("[REPAIR] failed to cancel attempt {}: {}", order_id, err);
            }
        }
        self.repair.finish_unwind();
        self.counters.repairs_unwound += 1;
        log::warn!("[REPAIR] abandoned reason={} residual={}", reason, residual);
        self.record(
            EventKind::RepairUnwind,
            json!({ "reason": reason, "residual": residual, "abandoned": true }),
        );
    }

    fn mark_flat(&mut self, now: Instant) {
        self.last_flat = Some(now);
        self.exit_debounce.clear();
        self.cum_spot_usd = Decimal::ZERO;
        self.cum_perp_usd = Decimal::ZERO;
        self.risk.notional.reset(&self.perp_symbol);
        log::info!("[EXIT] flat");
        self.persist_exposure();
    }

    fn skip(&mut self, reason: SkipReason) -> CycleAction {
        log::info!("[SKIP] reason={}", reason);
        self.counters.skipped_cycles += 1;
        let payload = json!({ "reason": reason.to_string() });
        self.record(EventKind::Skip, payload);
        CycleAction::Skip(reason)
    }

    async fn enter_branch(&mut self, signal: &FundingSignal, now: Instant) -> CycleAction {
        if self.repair.is_active() {
            return self.skip(SkipReason::RepairActive);
        }
        if self.exit_debounce.in_progress() {
            return self.skip(SkipReason::ExitInProgress);
        }
        let gate = EntryGate {
            has_exposure: self.has_exposure().await,
            flatten_cooldown_elapsed: elapsed_since(self.last_flat, self.cooldown, now),
            exit_cooldown_elapsed: elapsed_since(self.last_exit, self.cooldown, now),
        };
        if !self.strategy.should_enter(signal, gate) {
            log::debug!("[ENTRY] gate closed {:?}", gate);
            return CycleAction::Hold;
        }
        if let Some(reason) = self.risk_gate(now).await {
            return self.skip(reason);
        }

        let report = self.strategy.attempt_entry().await;
        if let EntryOutcome::Skipped(reason) = &report.outcome {
            return self.skip(reason.clone());
        }
        self.book_entry(&report, signal, now);
        CycleAction::Entry(report.outcome)
    }

    async fn risk_gate(&mut self, now: Instant) -> Option<SkipReason> {
        if self.risk.drawdown.halted() {
            return Some(SkipReason::Halted);
        }
        if !self.risk.rate.allow_at(now) {
            return Some(SkipReason::RateLimited);
        }
        if !elapsed_since(self.last_entry, self.min_entry_interval, now) {
            return Some(SkipReason::Throttled);
        }
        let spot_opens = self.spot.get_open_orders().await.map(|o| o.len()).unwrap_or(0);
        let perp_opens = self.perp.get_open_orders().await.map(|o| o.len()).unwrap_or(0);
        if spot_opens > 0 || perp_opens > 0 {
            return Some(SkipReason::OpenOrders {
                spot: spot_opens,
                perp: perp_opens,
            });
        }
        let remaining =
            self.cfg.strategy.target_usd_notional - self.cum_spot_usd.max(self.cum_perp_usd);
        if remaining <= Decimal::ZERO {
            return Some(SkipReason::TargetReached);
        }
        if !self.risk.notional.can_add(&self.perp_symbol, remaining) {
            return Some(SkipReason::NotionalCap { remaining });
        }
        None
    }

    fn book_entry(&mut self, report: &EntryReport, signal: &FundingSignal, now: Instant) {
        let mut spot_fee = Decimal::ZERO;
        let mut perp_fee = Decimal::ZERO;
        let mut spot_usd = Decimal::ZERO;
        let mut perp_usd = Decimal::ZERO;
        let mut spot_rate = Decimal::ZERO;
        let mut perp_rate = Decimal::ZERO;

        if let Some(fill) = report.spot_fill {
            spot_rate = self.cfg.fees.spot_rate(fill.maker);
            spot_fee = self.ledger.record_open_fill(Leg::Spot, fill, spot_rate);
            spot_usd = fill.notional();
        }
        if let Some(fill) = report.perp_fill {
            perp_rate = self.cfg.fees.perp_rate(fill.maker);
            perp_fee = self.ledger.record_open_fill(Leg::Perp, fill, perp_rate);
            perp_usd = fill.notional();
        }

        if spot_usd > Decimal::ZERO || perp_usd > Decimal::ZERO {
            self.cum_spot_usd += spot_usd;
            self.cum_perp_usd += perp_usd;
            self.record(
                EventKind::Fee,
                json!({
                    "spot_fee": spot_fee,
                    "perp_fee": perp_fee,
                    "spot_fee_rate": spot_rate,
                    "perp_fee_rate": perp_rate,
                }),
            );
            if let Err(err) = self
                .risk
                .notional
                .apply(&self.perp_symbol, spot_usd.max(perp_usd))
            {
                log::warn!("[RISK] {}", err);
            }
            self.persist_exposure();
        }

        self.last_entry = Some(now);
        let entered = report.entered();
        if entered {
            self.exit_debounce.clear();
            self.counters.entries += 1;
            self.last_spot_entry_oid = report.spot_order_id().map(str::to_string);
            log::info!(
                "[ENTRY] entered apr={} spot_filled={} perp_filled={} cum_spot_usd={} cum_perp_usd={} spot_size={} perp_size={}",
                signal.apr,
                report.spot_filled_size(),
                report.perp_filled_size(),
                self.cum_spot_usd,
                self.cum_perp_usd,
                self.ledger.size(Leg::Spot),
                self.ledger.size(Leg::Perp)
            );
        } else {
            self.counters.failed_entries += 1;
            log::warn!("[ENTRY] not entered outcome={:?}", report.outcome);
        }

        let payload = json!({
            "entered": entered,
            "outcome": report.outcome,
            "apr": signal.apr,
            "rate": signal.rate,
            "plan": report.plan,
            "spot": report.spot,
            "perp": report.perp,
            "spot_filled_size": report.spot_filled_size(),
            "perp_filled_size": report.perp_filled_size(),
            "cum_spot_usd": self.cum_spot_usd,
            "cum_perp_usd": self.cum_perp_usd,
            "spot_size": self.ledger.size(Leg::Spot),
            "perp_size": self.ledger.size(Leg::Perp),
        });
        self.record(EventKind::Entry, payload);

        if report.is_asymmetric()
            && self
                .repair
                .begin(report.perp_filled_size(), OrderSide::Buy, now)
        {
            self.counters.repairs_started += 1;
            log::warn!(
                "[REPAIR] started side=BUY_SPOT target_size={}",
                report.perp_filled_size()
            );
            self.record(
                EventKind::RepairStart,
                json!({ "side": "buy_spot", "target_size": report.perp_filled_size() }),
            );
        }
    }

    async fn drive_repair(&mut self, now: Instant) -> Result<()> {
        let age = self.repair.age(now).unwrap_or_default();
        let mut action = self.repair.next_action(now);
        if action == RepairAction::CancelSpotOrders {
            self.cancel_stale_spot_orders().await;
            self.repair.mark_cancel_done();
            action = self.repair.next_action(now);
        }
        match action {
            RepairAction::Nothing | RepairAction::CancelSpotOrders => Ok(()),
            RepairAction::Submit {
                side,
                qty,
                tif,
                extra_ticks,
                stage,
            } => {
                self.submit_repair(side, qty, tif, extra_ticks, stage, age)
                    .await
            }
            RepairAction::Unwind { residual } => {
                self.unwind_repair(residual).await;
                Ok(())
            }
        }
    }

    async fn cancel_stale_spot_orders(&mut self) {
        let entry_oid = self.last_spot_entry_oid.take();
        if let Some(order_id) = &entry_oid {
            match self.spot.cancel_order(&self.spot_symbol, order_id).await {
                Ok(outcome) => log::info!(
                    "[REPAIR] cancel entry order venue=spot oid={} result={:?}",
                    order_id,
                    outcome
                ),
                Err(err) => log::warn!("[REPAIR] cancel entry order oid={} failed: {}", order_id, err),
            }
        }
        let opens = match self.spot.get_open_orders().await {
            Ok(opens) => opens,
            Err(err) => {
                log::warn!("[REPAIR] failed to list spot orders: {}", err);
                return;
            }
        };
        for order in opens
            .iter()
            .filter(|o| o.symbol == self.spot_symbol && Some(&o.order_id) != entry_oid.as_ref())
        {
            match self.spot.cancel_order(&self.spot_symbol, &order.order_id).await {
                Ok(outcome) => log::info!(
                    "[REPAIR] cancel order venue=spot oid={} result={:?}",
                    order.order_id,
                    outcome
                ),
                Err(err) => {
                    log::warn!("[REPAIR] cancel oid={} failed: {}", order.order_id, err)
                }
            }
        }
    }

    async fn submit_repair(
        &mut self,
        side: OrderSide,
        target: Decimal,
        tif: TimeInForce,
        extra_ticks: u32,
        stage: RepairStage,
        age: Duration,
    ) -> Result<()> {
        if let Some(order_id) = self.repair.take_resting_order() {
            if let Err(err) = self.spot.cancel_order(&self.spot_symbol, &order_id).await {
                log::warn!("[REPAIR] failed to cancel previous attempt {}: {}", order_id, err);
            }
        }

        let meta = self
            .spot
            .get_symbol_meta(&self.spot_symbol)
            .await
            .context("repair: spot metadata")?;
        let quote = self
            .spot
            .get_quote(&self.spot_symbol)
            .await
            .context("repair: spot quote")?;
        let qty = floor_to_step(target, meta.size_step());
        if qty <= Decimal::ZERO {
            log::warn!(
                "[REPAIR] residual {} below size step {}; closing episode",
                target,
                meta.size_step()
            );
            if self.repair.record_fill(target) == RepairProgress::Completed {
                self.counters.repairs_completed += 1;
                self.record(
                    EventKind::RepairComplete,
                    json!({ "residual_below_step": target }),
                );
            }
            return Ok(());
        }
        let Some(price) = aggressive_price(side, &quote, meta.tick_size, extra_ticks) else {
            log::warn!("[REPAIR] no spot quote to price repair");
            return Ok(());
        };

        let req = OrderRequest::limit(&self.spot_symbol, side, qty, price).with_tif(tif);
        let outcome = match self.spot.place_order(&req).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("[REPAIR] spot attempt failed qty={} px={}: {}", qty, price, err);
                return Ok(());
            }
        };
        log::info!(
            "[REPAIR] spot attempt qty={} px={} tif={} stage={:?} age_ms={} status={} response={:?}",
            qty,
            price,
            tif,
            stage,
            age.as_millis(),
            outcome.status_label(),
            outcome
        );

        if let Some(fill) = outcome.fill() {
            let rate = self.cfg.fees.spot_rate(fill.maker);
            let fee = self.ledger.record_open_fill(Leg::Spot, fill, rate);
            self.cum_spot_usd += fill.notional();
            if let Err(err) = self.risk.notional.apply(&self.perp_symbol, fill.notional()) {
                log::debug!("[RISK] repair fill over cap: {}", err);
            }
            self.persist_exposure();
            self.record(
                EventKind::RepairFill,
                json!({
                    "size": fill.size,
                    "avg_price": fill.avg_price,
                    "fee": fee,
                    "stage": stage,
                }),
            );
            match self.repair.record_fill(fill.size) {
                RepairProgress::Completed => {
                    self.counters.repairs_completed += 1;
                    log::info!("[REPAIR] completed spot_size={}", self.ledger.size(Leg::Spot));
                    self.record(
                        EventKind::RepairComplete,
                        json!({ "spot_size": self.ledger.size(Leg::Spot) }),
                    );
                }
                RepairProgress::Pending { remaining } => {
                    log::info!("[REPAIR] partial fill remaining={}", remaining)
                }
                RepairProgress::Inactive => {}
            }
        }
        if self.repair.is_active() {
            self.repair
                .set_resting_order(outcome.resting_order_id().map(str::to_string));
        }
        Ok(())
    }

    async fn unwind_repair(&mut self, residual: Decimal) {
        if let Some(order_id) = self.repair.take_resting_order() {
            if let Err(err) = self.spot.cancel_order(&self.spot_symbol, &order_id).await {
                log::warn!("[REPAIR] failed to cancel attempt {}: {}", order_id, err);
            }
        }
        let result = self.unwind_perp_short().await;
        match &result {
            Ok(Some(outcome)) => log::warn!(
                "[REPAIR] timed out; perp unwound status={} response={:?}",
                outcome.status_label(),
                outcome
            ),
            Ok(None) => log::warn!("[REPAIR] timed out; no perp short left to unwind"),
            Err(err) => log::error!("[REPAIR] timed out; perp unwind failed: {:#}", err),
        }
        self.counters.repairs_unwound += 1;
        let payload = json!({
            "residual": residual,
            "unwind": outcome_value(&result),
            "perp_size": self.ledger.size(Leg::Perp),
        });
        self.record(EventKind::RepairUnwind, payload);
        self.repair.finish_unwind();
    }

    async fn unwind_perp_short(&mut self) -> Result<Option<OrderOutcome>> {
        let short = self.perp_short_size().await?;
        let meta = self.perp.get_symbol_meta(&self.perp_symbol).await?;
        let qty = floor_to_step(short, meta.size_step());
        if qty <= Decimal::ZERO {
            return Ok(None);
        }
        let quote = self.perp.get_quote(&self.perp_symbol).await?;
        let price = aggressive_price(
            OrderSide::Buy,
            &quote,
            meta.tick_size,
            self.cfg.execution.price_offset_ticks,
        )
        .ok_or_else(|| anyhow!("no perp quote for unwind"))?;
        let req = OrderRequest::limit(&self.perp_symbol, OrderSide::Buy, qty, price)
            .with_tif(self.cfg.execution.hedge_repair_tif)
            .reduce_only(true);
        let outcome = self.perp.place_order(&req).await?;
        self.book_close(Leg::Perp, &outcome);
        self.sync_perp_size().await;
        Ok(Some(outcome))
    }

    async fn perp_short_size(&self) -> Result<Decimal, GatewayError> {
        let positions = self.perp.get_positions().await?;
        Ok(position_for(&positions, &self.perp_symbol)
            .map(|p| {
                if p.signed_size < Decimal::ZERO {
                    -p.signed_size
                } else {
                    Decimal::ZERO
                }
            })
            .unwrap_or(Decimal::ZERO))
    }

    async fn spot_base_balance(&self) -> Result<Decimal, GatewayError> {
        let balances = self.spot.get_balances().await?;
        Ok(balances.total_of(&self.base_asset))
    }

    async fn sync_perp_size(&mut self) {
        match self.perp_short_size().await {
            Ok(short) => {
                if short != self.ledger.size(Leg::Perp) {
                    self.ledger.overwrite_size(Leg::Perp, short, None);
                    self.persist_exposure();
                }
            }
            Err(err) => log::debug!("[CLOSE] perp size sync failed: {}", err),
        }
    }

    fn book_close(&mut self, leg: Leg, outcome: &OrderOutcome) {
        let Some(fill) = outcome.fill() else {
            return;
        };
        let rate = match leg {
            Leg::Spot => self.cfg.fees.spot_rate(fill.maker),
            Leg::Perp => self.cfg.fees.perp_rate(fill.maker),
        };
        let realized = self.ledger.record_close_fill(leg, fill, rate);
        if let Err(err) = self.risk.notional.apply(&self.perp_symbol, -fill.notional()) {
            log::warn!("[RISK] {}", err);
        }
        self.persist_exposure();
        self.record(
            EventKind::Close,
            json!({
                "leg": leg,
                "size": fill.size,
                "avg_price": fill.avg_price,
                "realized": realized,
                "fee": fill.notional() * rate,
                "remaining": self.ledger.size(leg),
            }),
        );
    }

    /// Reduce-only BUY at the ask for the live short size.
    pub async fn close_perp(&mut self) -> Result<Option<OrderOutcome>> {
        let quote = self.perp.get_quote(&self.perp_symbol).await?;
        let Some(mid) = quote.mid() else {
            return Ok(None);
        };
        let short = match self.perp_short_size().await {
            Ok(size) if size > Decimal::ZERO => size,
            _ => self.ledger.size(Leg::Perp),
        };
        let meta = self.perp.get_symbol_meta(&self.perp_symbol).await?;
        let qty = floor_to_step(short, meta.size_step());
        if qty <= Decimal::ZERO {
            return Ok(None);
        }
        let price = if quote.ask > Decimal::ZERO { quote.ask } else { mid };
        let req = OrderRequest::limit(&self.perp_symbol, OrderSide::Buy, qty, price)
            .with_tif(self.cfg.execution.time_in_force)
            .reduce_only(true);
        let outcome = self.perp.place_order(&req).await?;
        log::info!(
            "[CLOSE] leg=perp side=BUY qty={} px={} status={} response={:?}",
            qty,
            price,
            outcome.status_label(),
            outcome
        );
        self.book_close(Leg::Perp, &outcome);
        self.sync_perp_size().await;
        Ok(Some(outcome))
    }

    /// SELL the venue-reported base balance at the bid.
    pub async fn close_spot(&mut self) -> Result<Option<OrderOutcome>> {
        let base = self.spot_base_balance().await?;
        if base <= Decimal::ZERO {
            return Ok(None);
        }
        let meta = self.spot.get_symbol_meta(&self.spot_symbol).await?;
        let qty = floor_to_step(base, meta.size_step());
        if qty <= Decimal::ZERO {
            return Ok(None);
        }
        let quote = self.spot.get_quote(&self.spot_symbol).await?;
        if quote.bid <= Decimal::ZERO {
            return Ok(None);
        }
        let req = OrderRequest::limit(&self.spot_symbol, OrderSide::Sell, qty, quote.bid)
            .with_tif(self.cfg.execution.time_in_force);
        let outcome = self.spot.place_order(&req).await?;
        log::info!(
            "[CLOSE] leg=spot side=SELL qty={} px={} status={} response={:?}",
            qty,
            quote.bid,
            outcome.status_label(),
            outcome
        );
        self.book_close(Leg::Spot, &outcome);
        Ok(Some(outcome))
    }

    /// Cancel every open order on both venues. Returns how many cancels were sent.
    pub async fn cancel_all(&mut self) -> usize {
        let mut sent = 0;
        for (label, venue) in [("spot", self.spot.clone()), ("perp", self.perp.clone())] {
            let opens = match venue.get_open_orders().await {
                Ok(opens) => opens,
                Err(err) => {
                    log::warn!("[ORDER] failed to list {} orders: {}", label, err);
                    continue;
                }
            };
            for order in opens {
                sent += 1;
                match venue.cancel_order(&order.symbol, &order.order_id).await {
                    Ok(outcome) => log::info!(
                        "[ORDER] cancel venue={} symbol={} oid={} result={:?}",
                        label,
                        order.symbol,
                        order.order_id,
                        outcome
                    ),
                    Err(err) => log::warn!(
                        "[ORDER] cancel venue={} oid={} failed: {}",
                        label,
                        order.order_id,
                        err
                    ),
                }
            }
        }
        sent
    }

    async fn align(&mut self) {
        if !self.cfg.alignment.enabled {
            return;
        }
        let min_quanta = Decimal::from(self.cfg.alignment.min_diff_quanta);
        let force = self.cfg.alignment.mode == AlignmentMode::Force;
        let mut changed = false;

        let perp_meta = self.perp.get_symbol_meta(&self.perp_symbol).await;
        let positions = self.perp.get_positions().await;
        if let (Ok(meta), Ok(positions)) = (perp_meta, positions) {
            let (venue_size, entry_price) = position_for(&positions, &self.perp_symbol)
                .map(|p| (p.signed_size.abs(), p.entry_price))
                .unwrap_or((Decimal::ZERO, None));
            let local = self.ledger.size(Leg::Perp);
            let quanta = (local - venue_size).abs() / meta.size_step();
            if quanta >= min_quanta && quanta > Decimal::ZERO {
                log::warn!(
                    "[ALIGN] leg=perp local={} venue={} diff_quanta={} mode={}",
                    local,
                    venue_size,
                    quanta,
                    self.cfg.alignment.mode
                );
                if force {
                    self.ledger.overwrite_size(Leg::Perp, venue_size, entry_price);
                    changed = true;
                    self.record(
                        EventKind::Alignment,
                        json!({ "leg": Leg::Perp, "local": local, "venue": venue_size }),
                    );
                }
            }
        }

        let spot_meta = self.spot.get_symbol_meta(&self.spot_symbol).await;
        let base = self.spot_base_balance().await;
        let spot_mid = match self.spot.get_quote(&self.spot_symbol).await {
            Ok(q) => q.mid(),
            Err(_) => None,
        };
        if let (Ok(meta), Ok(venue_size)) = (spot_meta, base) {
            let local = self.ledger.size(Leg::Spot);
            let quanta = (local - venue_size).abs() / meta.size_step();
            if quanta >= min_quanta && quanta > Decimal::ZERO {
                log::warn!(
                    "[ALIGN] leg=spot local={} venue={} diff_quanta={} mode={}",
                    local,
                    venue_size,
                    quanta,
                    self.cfg.alignment.mode
                );
                if force {
                    // The spot venue reports no entry price; adopt at mid when untracked.
                    let basis = match self.ledger.exposure(Leg::Spot).avg_entry() {
                        Some(_) => None,
                        None => spot_mid,
                    };
                    self.ledger.overwrite_size(Leg::Spot, venue_size, basis);
                    changed = true;
                    self.record(
                        EventKind::Alignment,
                        json!({ "leg": Leg::Spot, "local": local, "venue": venue_size }),
                    );
                }
            }
        }

        if changed {
            self.persist_exposure();
        }
    }

    async fn mid_prices(&self, signal: Option<&FundingSignal>) -> (Decimal, Decimal) {
        let spot_mid = match self.spot.get_quote(&self.spot_symbol).await {
            Ok(q) => q.mid(),
            Err(_) => None,
        }
        .or_else(|| self.ledger.exposure(Leg::Spot).avg_entry())
        .unwrap_or(Decimal::ZERO);
        let perp_mid = match self.perp.get_quote(&self.perp_symbol).await {
            Ok(q) => q.mid(),
            Err(_) => None,
        }
        .or_else(|| signal.map(|s| s.mark_price))
        .or_else(|| self.ledger.exposure(Leg::Perp).avg_entry())
        .unwrap_or(Decimal::ZERO);
        (spot_mid, perp_mid)
    }

    fn maybe_log_pnl(
        &mut self,
        signal: &FundingSignal,
        spot_mid: Decimal,
        perp_mid: Decimal,
        now: Instant,
    ) {
        let interval = Duration::from_secs(self.cfg.execution.pnl_log_interval_s);
        if !elapsed_since(self.last_pnl_log, interval, now) {
            return;
        }
        self.last_pnl_log = Some(now);
        let summary = self.ledger.summary(spot_mid, perp_mid);
        let spot = self.ledger.exposure(Leg::Spot);
        let perp = self.ledger.exposure(Leg::Perp);
        log::info!(
            "[PNL] apr={} spot_size={} perp_size={} spot_cost={} perp_cost={} spot_mid={} perp_mid={} realized_spot={} realized_perp={} unrealized_spot={} unrealized_perp={} gross={} fees={} net={}",
            signal.apr,
            spot.size,
            perp.size,
            spot.cost_basis_quote,
            perp.cost_basis_quote,
            spot_mid,
            perp_mid,
            summary.realized_spot,
            summary.realized_perp,
            summary.unrealized_spot,
            summary.unrealized_perp,
            summary.gross(),
            summary.fees,
            summary.net()
        );
    }

    fn update_drawdown(&mut self, spot_mid: Decimal, perp_mid: Decimal) {
        let summary = self.ledger.summary(spot_mid, perp_mid);
        let equity = self.cfg.risk.starting_equity_usd + summary.net();
        if self.risk.drawdown.update_equity(equity) {
            self.counters.halts += 1;
            log::warn!(
                "[RISK] drawdown halt equity={} peak={:?} max_drawdown={}",
                equity,
                self.risk.drawdown.peak(),
                self.cfg.risk.max_drawdown_usd
            );
            self.record(
                EventKind::Halt,
                json!({
                    "equity": equity,
                    "peak": self.risk.drawdown.peak(),
                    "max_drawdown": self.cfg.risk.max_drawdown_usd,
                }),
            );
        }
    }

    async fn await_flatten(&mut self) -> bool {
        let wait = Duration::from_secs(self.cfg.execution.flatten_wait_s);
        let poll = Duration::from_millis(self.cfg.execution.flatten_poll_ms);
        let deadline = Instant::now() + wait;
        let perp_quantum = self
            .perp
            .get_symbol_meta(&self.perp_symbol)
            .await
            .map(|m| m.size_step())
            .unwrap_or(Decimal::ZERO);
        let spot_quantum = self
            .spot
            .get_symbol_meta(&self.spot_symbol)
            .await
            .map(|m| m.size_step())
            .unwrap_or(Decimal::ZERO);

        loop {
            let opens_spot = self.spot.get_open_orders().await.map(|o| o.len()).unwrap_or(0);
            let opens_perp = self.perp.get_open_orders().await.map(|o| o.len()).unwrap_or(0);
            let perp_abs = self
                .perp_short_size()
                .await
                .unwrap_or_else(|_| self.ledger.size(Leg::Perp));
            let spot_base = self
                .spot_base_balance()
                .await
                .unwrap_or_else(|_| self.ledger.size(Leg::Spot));
            log::info!(
                "[SHUTDOWN] flatten_progress perp_abs={} spot_base={} opens_spot={} opens_perp={}",
                perp_abs,
                spot_base,
                opens_spot,
                opens_perp
            );

            let perp_done = perp_abs <= perp_quantum;
            let spot_done = spot_base <= spot_quantum;
            if perp_done && spot_done && opens_spot == 0 && opens_perp == 0 {
                self.ledger.zero(Leg::Spot);
                self.ledger.zero(Leg::Perp);
                self.mark_flat(Instant::now());
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "[SHUTDOWN] flatten wait expired perp_abs={} spot_base={}",
                    perp_abs,
                    spot_base
                );
                return false;
            }

            if opens_spot > 0 || opens_perp > 0 {
                self.cancel_all().await;
            }
            if !perp_done {
                if let Err(err) = self.close_perp().await {
                    log::warn!("[SHUTDOWN] perp close failed: {:#}", err);
                }
            }
            if !spot_done {
                if let Err(err) = self.close_spot().await {
                    log::warn!("[SHUTDOWN] spot close failed: {:#}", err);
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel, close, wait for flat within the bounded window, then summarize.
    pub async fn shutdown(&mut self) -> PnlSummary {
        log::warn!("[SHUTDOWN] flatten start");
        self.abandon_repair("shutdown").await;
        self.cancel_all().await;
        if let Err(err) = self.close_perp().await {
            log::warn!("[SHUTDOWN] perp close failed: {:#}", err);
        }
        if let Err(err) = self.close_spot().await {
            log::warn!("[SHUTDOWN] spot close failed: {:#}", err);
        }
        let flat = self.await_flatten().await;

        let (spot_mid, perp_mid) = self.mid_prices(None).await;
        let summary = self.ledger.summary(spot_mid, perp_mid);
        log::info!(
            "[SHUTDOWN] summary flat={} realized_spot={} realized_perp={} unrealized_spot={} unrealized_perp={} fees={} net={} counters={:?}",
            flat,
            summary.realized_spot,
            summary.realized_perp,
            summary.unrealized_spot,
            summary.unrealized_perp,
            summary.fees,
            summary.net(),
            self.counters
        );
        let payload = json!({
            "flat": flat,
            "pnl": summary,
            "gross": summary.gross(),
            "net": summary.net(),
            "counters": self.counters,
        });
        self.record(EventKind::ShutdownSummary, payload);
        self.persist_exposure();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::RepairState;
    use crate::testkit::{quote, ScriptedGateway};
    use rust_decimal_macros::dec;

    const CONFIG: &str = r#"
markets:
  base: ASTER
  spot_symbol: ASTER/USDC
  perp_symbol: ASTER
strategy:
  enter_threshold_apr: 0.10
  exit_threshold_apr: 0.04
  target_usd_notional: 200
execution:
  price_offset_ticks: 1
  time_in_force: Gtc
  post_only: true
  flatten_wait_s: 1
  flatten_poll_ms: 10
risk:
  per_symbol_notional_cap: 500
  portfolio_notional_cap: 1000
  max_drawdown_usd: 50
  starting_equity_usd: 1000
runtime:
  replay_file: unused.jsonl
"#;

    struct Harness {
        engine: FundingCarryEngine,
        spot: Arc<ScriptedGateway>,
        perp: Arc<ScriptedGateway>,
        events: MemoryEventStore,
    }

    fn harness_with(cfg: FundCarryConfig, funding: Decimal) -> Harness {
        let spot = Arc::new(ScriptedGateway::spot("ASTER/USDC", dec!(1000)));
        let perp = Arc::new(ScriptedGateway::perp("ASTER", funding));
        let events = MemoryEventStore::new();
        let engine = FundingCarryEngine::with_gateways(
            cfg,
            spot.clone(),
            perp.clone(),
            Box::new(events.clone()),
        )
        .unwrap();
        Harness {
            engine,
            spot,
            perp,
            events,
        }
    }

    fn harness(funding: Decimal) -> Harness {
        harness_with(FundCarryConfig::from_yaml_str(CONFIG).unwrap(), funding)
    }

    #[tokio::test]
    async fn scenario_a_enters_both_legs() {
        let mut h = harness(dec!(0.20));
        let action = h.engine.step().await.unwrap();
        assert_eq!(action, CycleAction::Entry(EntryOutcome::Entered));
        let spot_orders = h.spot.placed();
        let perp_orders = h.perp.placed();
        assert_eq!(spot_orders.len(), 1);
        assert_eq!(perp_orders.len(), 1);
        assert_eq!(spot_orders[0].side, OrderSide::Buy);
        assert_eq!(perp_orders[0].side, OrderSide::Sell);
        assert_eq!(h.engine.ledger().size(Leg::Spot), dec!(19.98));
        assert_eq!(h.engine.ledger().size(Leg::Perp), dec!(19.98));
        assert_eq!(h.engine.counters().entries, 1);
        assert_eq!(h.events.count(EventKind::Entry), 1);
        assert_eq!(h.events.count(EventKind::Fee), 1);
        let entry = h
            .events
            .events()
            .into_iter()
            .find(|e| e.kind == EventKind::Entry)
            .unwrap();
        assert_eq!(entry.payload["entered"], json!(true));
        assert_eq!(entry.payload["spot"]["Filled"]["size"], json!("19.98"));
    }

    #[tokio::test]
    async fn scenario_b_low_funding_places_nothing() {
        let mut h = harness(dec!(0.01));
        let action = h.engine.step().await.unwrap();
        assert_eq!(action, CycleAction::Hold);
        assert!(h.spot.placed().is_empty());
        assert!(h.perp.placed().is_empty());
        assert!(!h.engine.ledger().has_exposure());
    }

    #[tokio::test]
    async fn scenario_c_spot_error_skips_perp() {
        let mut h = harness(dec!(0.20));
        h.spot.queue_outcome(OrderOutcome::Error {
            code: "margin".to_string(),
            message: "Insufficient balance".to_string(),
        });
        let action = h.engine.step().await.unwrap();
        assert_eq!(action, CycleAction::Entry(EntryOutcome::SpotLegFailed));
        assert_eq!(h.perp.placed().len(), 0);
        assert_eq!(h.engine.counters().failed_entries, 1);
        assert!(!h.engine.ledger().has_exposure());
    }

    #[tokio::test]
    async fn scenario_d_repair_completes_on_spot_fill() {
        let mut h = harness(dec!(0.20));
        h.spot.queue_outcome(OrderOutcome::Resting {
            order_id: "spot-1".to_string(),
        });
        h.spot.queue_outcome(OrderOutcome::Resting {
            order_id: "r-1".to_string(),
        });
        h.perp.queue_outcome(OrderOutcome::Filled {
            size: dec!(5),
            avg_price: dec!(10.01),
            maker: false,
            resting_order_id: None,
        });

        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        match h.engine.repair().state() {
            RepairState::Repairing {
                target_size,
                side,
                cancel_done,
                ..
            } => {
                assert_eq!(*target_size, dec!(5));
                assert_eq!(*side, OrderSide::Buy);
                assert!(*cancel_done);
            }
            other => panic!("unexpected repair state {:?}", other),
        }
        let cancels = h.spot.cancels();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].1, "spot-1");

        let action = h.engine.step_at(t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(action, CycleAction::Skip(SkipReason::RepairActive));
        assert_eq!(h.engine.repair().state(), &RepairState::Idle);
        assert_eq!(h.engine.ledger().size(Leg::Spot), dec!(5));
        assert!(h.spot.cancels().iter().any(|(_, id)| id == "r-1"));
        assert_eq!(h.engine.counters().repairs_completed, 1);
        assert_eq!(h.events.count(EventKind::RepairComplete), 1);
    }

    #[tokio::test]
    async fn repair_timeout_unwinds_perp_short() {
        let mut h = harness(dec!(0.20));
        h.spot.rest_by_default();
        h.perp.queue_outcome(OrderOutcome::Filled {
            size: dec!(5),
            avg_price: dec!(10.01),
            maker: false,
            resting_order_id: None,
        });

        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        assert!(h.engine.repair().is_active());
        assert_eq!(h.perp.position(), dec!(-5));

        h.engine.step_at(t0 + Duration::from_secs(6)).await.unwrap();
        assert_eq!(h.engine.repair().state(), &RepairState::Idle);
        let unwind = h.perp.placed().last().cloned().unwrap();
        assert_eq!(unwind.side, OrderSide::Buy);
        assert!(unwind.reduce_only);
        assert_eq!(unwind.qty, dec!(5));
        assert_eq!(unwind.tif, TimeInForce::Ioc);
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.engine.ledger().size(Leg::Perp), Decimal::ZERO);
        assert_eq!(h.events.count(EventKind::RepairUnwind), 1);
    }

    #[tokio::test]
    async fn exit_waits_for_cooldown_then_closes() {
        let mut h = harness(dec!(0.20));
        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        h.perp.set_funding(dec!(0.01));

        let early = h.engine.step_at(t0 + Duration::from_secs(10)).await.unwrap();
        assert_eq!(early, CycleAction::ExitSuppressed);
        assert_eq!(h.perp.placed().len(), 1);

        let later = h.engine.step_at(t0 + Duration::from_secs(301)).await.unwrap();
        assert_eq!(later, CycleAction::Exit);
        let close = h.perp.placed().last().cloned().unwrap();
        assert!(close.reduce_only);
        assert_eq!(close.price, dec!(10.02));
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.spot.base_balance(), Decimal::ZERO);
        assert!(!h.engine.ledger().has_exposure());
        assert_eq!(h.events.count(EventKind::Close), 2);
    }

    #[tokio::test]
    async fn no_reentry_inside_flatten_cooldown() {
        let mut h = harness(dec!(0.20));
        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        h.perp.set_funding(dec!(0.01));
        h.engine.step_at(t0 + Duration::from_secs(301)).await.unwrap();
        h.perp.set_funding(dec!(0.20));

        let action = h.engine.step_at(t0 + Duration::from_secs(302)).await.unwrap();
        assert_eq!(action, CycleAction::Hold);
        assert_eq!(h.spot.placed().len(), 2);

        let action = h.engine.step_at(t0 + Duration::from_secs(700)).await.unwrap();
        assert_eq!(action, CycleAction::Entry(EntryOutcome::Entered));
    }

    #[tokio::test]
    async fn drawdown_halt_closes_immediately() {
        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.risk.max_drawdown_usd = dec!(5);
        let mut h = harness_with(cfg, dec!(0.20));
        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        h.spot.set_quote(quote(dec!(9.00), dec!(9.02)));

        let action = h.engine.step_at(t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(action, CycleAction::Exit);
        assert!(h.engine.risk().drawdown.halted());
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.events.count(EventKind::Halt), 1);

        h.spot.set_quote(quote(dec!(10.00), dec!(10.02)));
        let action = h.engine.step_at(t0 + Duration::from_secs(900)).await.unwrap();
        assert_eq!(action, CycleAction::Skip(SkipReason::Halted));
    }

    #[tokio::test]
    async fn open_orders_block_entry() {
        let mut h = harness(dec!(0.20));
        h.perp.add_open_order("p-9", OrderSide::Sell, dec!(1));
        let action = h.engine.step().await.unwrap();
        assert_eq!(
            action,
            CycleAction::Skip(SkipReason::OpenOrders { spot: 0, perp: 1 })
        );
        assert!(h.spot.placed().is_empty());
    }

    #[tokio::test]
    async fn order_rate_ceiling_skips_entry() {
        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.execution.max_actions_per_min = 1;
        let mut h = harness_with(cfg, dec!(0.20));
        h.spot.queue_outcome(OrderOutcome::Error {
            code: "margin".to_string(),
            message: "Insufficient balance".to_string(),
        });

        let t0 = Instant::now();
        let first = h.engine.step_at(t0).await.unwrap();
        assert_eq!(first, CycleAction::Entry(EntryOutcome::SpotLegFailed));

        let second = h.engine.step_at(t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(second, CycleAction::Skip(SkipReason::RateLimited));
        assert_eq!(h.spot.placed().len(), 1);
        assert_eq!(h.events.count(EventKind::Skip), 1);

        let later = h.engine.step_at(t0 + Duration::from_secs(61)).await.unwrap();
        assert_eq!(later, CycleAction::Entry(EntryOutcome::Entered));
    }

    #[tokio::test]
    async fn venue_held_position_blocks_entry() {
        let mut h = harness(dec!(0.20));
        h.perp.set_position(dec!(-3));
        h.spot.set_base_balance(dec!(3));

        let action = h.engine.step().await.unwrap();
        assert_eq!(action, CycleAction::Hold);
        assert!(h.spot.placed().is_empty());
        assert!(h.perp.placed().is_empty());
        assert_eq!(h.perp.position(), dec!(-3));
    }

    #[tokio::test]
    async fn venue_held_position_exits_on_low_funding() {
        let mut h = harness(dec!(0.01));
        h.perp.set_position(dec!(-3));
        h.spot.set_base_balance(dec!(3));

        let action = h.engine.step().await.unwrap();
        assert_eq!(action, CycleAction::Exit);
        let close = h.perp.placed().last().cloned().unwrap();
        assert!(close.reduce_only);
        assert_eq!(close.qty, dec!(3));
        assert_eq!(h.spot.placed().last().map(|o| o.side), Some(OrderSide::Sell));
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.spot.base_balance(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn exit_ends_active_repair_without_rebuying() {
        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.execution.enter_exit_cooldown_s = 0;
        let mut h = harness_with(cfg, dec!(0.20));
        h.spot.queue_outcome(OrderOutcome::Resting {
            order_id: "spot-1".to_string(),
        });
        h.spot.queue_outcome(OrderOutcome::Resting {
            order_id: "r-1".to_string(),
        });
        h.perp.queue_outcome(OrderOutcome::Filled {
            size: dec!(5),
            avg_price: dec!(10.01),
            maker: false,
            resting_order_id: None,
        });

        let t0 = Instant::now();
        h.engine.step_at(t0).await.unwrap();
        assert!(h.engine.repair().is_active());
        assert_eq!(h.spot.placed().len(), 2);

        h.perp.set_funding(dec!(0.01));
        let action = h.engine.step_at(t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(action, CycleAction::Exit);
        assert_eq!(h.engine.repair().state(), &RepairState::Idle);
        assert_eq!(h.spot.placed().len(), 2);
        assert!(h.spot.cancels().iter().any(|(_, id)| id == "r-1"));
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.spot.base_balance(), Decimal::ZERO);
        assert_eq!(h.engine.counters().repairs_unwound, 1);
        assert_eq!(h.events.count(EventKind::RepairUnwind), 1);
    }

    #[tokio::test]
    async fn missing_funding_skips_cycle() {
        let mut h = harness(dec!(0.20));
        h.perp.fail_funding();
        assert_eq!(h.engine.step().await.unwrap(), CycleAction::NoSignal);
        assert_eq!(h.engine.counters().skipped_cycles, 1);
    }

    #[tokio::test]
    async fn shutdown_flattens_and_summarizes() {
        let mut h = harness(dec!(0.20));
        h.engine.startup().await.unwrap();
        h.engine.step().await.unwrap();
        let summary = h.engine.shutdown().await;
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(h.spot.base_balance(), Decimal::ZERO);
        assert!(summary.fees > Decimal::ZERO);
        assert_eq!(summary.unrealized_spot, Decimal::ZERO);
        assert_eq!(h.events.count(EventKind::ShutdownSummary), 1);
        assert_eq!(h.perp.leverage_calls(), vec![("ASTER".to_string(), 1, true)]);
    }

    #[tokio::test]
    async fn force_alignment_adopts_venue_sizes() {
        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.alignment.mode = AlignmentMode::Force;
        let mut h = harness_with(cfg, dec!(0.05));
        h.perp.set_position(dec!(-3));
        h.spot.set_base_balance(dec!(3));
        h.engine.step().await.unwrap();
        assert_eq!(h.engine.ledger().size(Leg::Perp), dec!(3));
        assert_eq!(h.engine.ledger().size(Leg::Spot), dec!(3));
        assert_eq!(h.events.count(EventKind::Alignment), 2);
    }

    #[tokio::test]
    async fn exposure_snapshot_is_restored() {
        let mut first = harness(dec!(0.20));
        first.engine.step().await.unwrap();
        let stored = first.events.clone();

        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.runtime.restore_exposure = true;
        let spot = Arc::new(ScriptedGateway::spot("ASTER/USDC", dec!(1000)));
        let perp = Arc::new(ScriptedGateway::perp("ASTER", dec!(0.20)));
        let mut engine =
            FundingCarryEngine::with_gateways(cfg, spot, perp, Box::new(stored)).unwrap();
        engine.startup().await.unwrap();
        assert_eq!(engine.ledger().size(Leg::Spot), dec!(19.98));
        assert_eq!(engine.ledger().size(Leg::Perp), dec!(19.98));
    }

    #[tokio::test]
    async fn run_once_steps_and_shuts_down() {
        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.runtime.once = true;
        let mut h = harness_with(cfg, dec!(0.20));
        let (_tx, rx) = watch::channel(false);
        h.engine.run(rx).await.unwrap();
        assert_eq!(h.engine.counters().entries, 1);
        assert_eq!(h.perp.position(), Decimal::ZERO);
        assert_eq!(
            h.events.kinds().first().copied(),
            Some(EventKind::Startup)
        );
        assert_eq!(
            h.events.kinds().last().copied(),
            Some(EventKind::ShutdownSummary)
        );
    }

    #[tokio::test]
    async fn replay_session_enters_exits_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let tape_path = dir.path().join("tape.jsonl");
        // Row two trades through both resting entry orders.
        let rows = [
            ("0.20", ("10.00", "10.02"), ("10.00", "10.02")),
            ("0.20", ("9.99", "10.00"), ("10.02", "10.03")),
            ("0.01", ("10.00", "10.02"), ("10.00", "10.02")),
            ("0.01", ("10.00", "10.02"), ("10.00", "10.02")),
        ];
        let tape: Vec<String> = rows
            .iter()
            .enumerate()
            .map(|(i, (funding, (spot_bid, spot_ask), (perp_bid, perp_ask)))| {
                format!(
                    r#"{{"timestamp": {}, "spot": {{"bid": "{spot_bid}", "ask": "{spot_ask}"}}, "perp": {{"bid": "{perp_bid}", "ask": "{perp_ask}", "funding": "{funding}"}}}}"#,
                    1_700_000_000_000i64 + i as i64 * 1000
                )
            })
            .collect();
        std::fs::write(&tape_path, tape.join("\n")).unwrap();

        let mut cfg = FundCarryConfig::from_yaml_str(CONFIG).unwrap();
        cfg.runtime.replay_file = Some(tape_path);
        cfg.runtime.event_log_dir = Some(dir.path().join("events"));
        cfg.runtime.interval_ms = 50;
        cfg.execution.enter_exit_cooldown_s = 0;
        cfg.alignment.mode = AlignmentMode::Force;

        let mut engine = FundingCarryEngine::new(cfg).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        engine.run(rx).await.unwrap();

        assert_eq!(engine.counters().entries, 1);
        assert_eq!(engine.counters().exits, 1);
        assert!(!engine.ledger().has_exposure());
        let log = std::fs::read_to_string(dir.path().join("events").join("events.jsonl")).unwrap();
        for kind in ["startup", "entry", "alignment", "exit", "close", "shutdown_summary"] {
            assert!(
                log.contains(&format!("\"kind\":\"{}\"", kind)),
                "missing {} in {}",
                kind,
                log
            );
        }
    }
}
