use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::FundCarryConfig;
use crate::gateway::{
    BalanceSnapshot, CancelOutcome, FundingInfo, GatewayError, OpenOrder, OrderOutcome,
    OrderRequest, PositionSnapshot, Quote, SymbolMeta, VenueGateway,
};
use crate::ports::replay_venue::{ReplaySettings, ReplayTape, ReplayVenue};
use crate::rate_limit_notifier::notify_rate_limit;
use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use std::env;
use std::sync::Arc;

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: Decimal = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::new(1, 0)),
            Err(_) => Decimal::new(1, 0),
        }
    };
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    match env::var(key) {
        Ok(val) => val.trim().parse::<Decimal>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Wraps a venue so every failed call is logged and HTTP 429s are reported.
pub struct GatewayBox {
    pub inner: Arc<dyn VenueGateway>,
}

impl GatewayBox {
    pub fn new(inner: Arc<dyn VenueGateway>) -> Self {
        Self { inner }
    }

    fn report_error(&self, operation: &str, detail: &str, err: &GatewayError) {
        let context = format!("{} {} ({})", self.inner.venue_name(), operation, detail);
        match err {
            GatewayError::RateLimited(_) => notify_rate_limit(&context, &err.to_string()),
            GatewayError::NotApplicable => {}
            other => {
                let text = other.to_string();
                if text.contains("429") || text.contains("Too Many Requests") {
                    notify_rate_limit(&context, &text);
                } else {
                    log::debug!("[GATEWAY] {} failed: {}", context, text);
                }
            }
        }
    }

    fn observe<T>(&self, operation: &str, detail: &str, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        if let Err(ref err) = result {
            self.report_error(operation, detail, err);
        }
        result
    }
}

#[async_trait]
impl VenueGateway for GatewayBox {
    fn venue_name(&self) -> &str {
        self.inner.venue_name()
    }

    fn normalize_symbol(&self, raw: &str) -> Result<String, GatewayError> {
        self.inner.normalize_symbol(raw)
    }

    async fn get_symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError> {
        let result = self.inner.get_symbol_meta(symbol).await;
        self.observe("get_symbol_meta", symbol, result)
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, GatewayError> {
        let result = self.inner.get_quote(symbol).await;
        self.observe("get_quote", symbol, result)
    }

    async fn get_balances(&self) -> Result<BalanceSnapshot, GatewayError> {
        let result = self.inner.get_balances().await;
        self.observe("get_balances", "account", result)
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let result = self.inner.get_positions().await;
        self.observe("get_positions", "account", result)
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let result = self.inner.get_open_orders().await;
        self.observe("get_open_orders", "account", result)
    }

    async fn get_funding(&self, symbol: &str) -> Result<Option<FundingInfo>, GatewayError> {
        let result = self.inner.get_funding(symbol).await;
        self.observe("get_funding", symbol, result)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderOutcome, GatewayError> {
        let result = self.inner.place_order(req).await;
        let detail = format!(
            "{} | side={} size={} price={} tif={} reduce_only={}",
            req.symbol, req.side, req.qty, req.price, req.tif, req.reduce_only
        );
        self.observe("place_order", &detail, result)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, GatewayError> {
        let result = self.inner.cancel_order(symbol, order_id).await;
        self.observe("cancel_order", &format!("{} | order_id={}", symbol, order_id), result)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        cross_margin: bool,
    ) -> Result<(), GatewayError> {
        let result = self.inner.set_leverage(symbol, leverage, cross_margin).await;
        self.observe(
            "set_leverage",
            &format!("{} | leverage={} cross={}", symbol, leverage, cross_margin),
            result,
        )
    }
}

/// Both venues plus the tape that drives them when replaying.
pub struct VenuePair {
    pub spot: Arc<dyn VenueGateway>,
    pub perp: Arc<dyn VenueGateway>,
    pub replay: Option<Arc<ReplayTape>>,
}

pub fn replay_settings_from_env() -> ReplaySettings {
    ReplaySettings {
        tick_size: env_decimal("REPLAY_TICK_SIZE", Decimal::new(1, 2)),
        size_decimals: env_u32("REPLAY_SIZE_DECIMALS", 2),
        quote_asset: env::var("REPLAY_QUOTE_ASSET").unwrap_or_else(|_| "USDC".to_string()),
        quote_balance: env_decimal("REPLAY_QUOTE_BALANCE", Decimal::new(10_000, 0)),
        fill_probability: *FILLED_PROBABILITY_IN_EMULATION,
    }
}

pub async fn create_gateways(cfg: &FundCarryConfig) -> Result<VenuePair> {
    match cfg.runtime.venue.as_str() {
        "replay" => {
            let path = cfg
                .runtime
                .replay_file
                .as_ref()
                .ok_or_else(|| anyhow!("runtime.replay_file is required for the replay venue"))?;
            let tape = Arc::new(
                ReplayTape::from_path(path)
                    .with_context(|| format!("failed to load replay tape {}", path.display()))?,
            );
            let mut settings = replay_settings_from_env();
            if let Some((_, quote)) = cfg.markets.spot_symbol.split_once('/') {
                settings.quote_asset = quote.trim().to_ascii_uppercase();
            }
            log::info!(
                "[REPLAY] tape={} rows={} tick={} size_decimals={} fill_probability={}",
                path.display(),
                tape.len(),
                settings.tick_size,
                settings.size_decimals,
                settings.fill_probability
            );
            let spot = ReplayVenue::spot(tape.clone(), &cfg.markets.spot_symbol, settings.clone());
            let perp = ReplayVenue::perp(tape.clone(), &cfg.markets.perp_symbol, settings);
            Ok(VenuePair {
                spot: Arc::new(GatewayBox::new(Arc::new(spot))),
                perp: Arc::new(GatewayBox::new(Arc::new(perp))),
                replay: Some(tape),
            })
        }
        other => Err(anyhow!(
            "Unsupported venue '{}': only 'replay' is built in; live venues plug in through the VenueGateway trait",
            other
        )),
    }
}
