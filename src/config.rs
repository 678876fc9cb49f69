use crate::gateway::TimeInForce;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_PATH: &str = "fundcarry.yaml";
const DEFAULT_BASE_URL: &str = "https://api.hyperliquid.xyz";
const DEFAULT_VENUE: &str = "replay";
const DEFAULT_HEDGE_RATIO: Decimal = dec!(1);
const DEFAULT_PRICE_OFFSET_TICKS: u32 = 1;
const DEFAULT_TIF: TimeInForce = TimeInForce::Gtc;
const DEFAULT_POST_ONLY: bool = true;
const DEFAULT_REPRICE_INTERVAL_MS: u64 = 800;
const DEFAULT_MAX_ACTIONS_PER_MIN: usize = 20;
const DEFAULT_HEDGE_REPAIR_TIMEOUT_MS: u64 = 5000;
const DEFAULT_HEDGE_REPAIR_STAGE_MS: u64 = 1500;
const DEFAULT_HEDGE_REPAIR_TIF: TimeInForce = TimeInForce::Ioc;
const DEFAULT_LEVERAGE: u32 = 1;
const DEFAULT_CROSS_MARGIN: bool = true;
const DEFAULT_ENTER_EXIT_COOLDOWN_S: u64 = 300;
const DEFAULT_EXIT_RETRIGGER_S: u64 = 5;
const DEFAULT_FLATTEN_WAIT_S: u64 = 20;
const DEFAULT_FLATTEN_POLL_MS: u64 = 1000;
const DEFAULT_PNL_LOG_INTERVAL_S: u64 = 60;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 2000;
const DEFAULT_MIN_SPREAD_TICKS: u32 = 0;
const DEFAULT_SPOT_MAKER_FEE: Decimal = dec!(0.0004);
const DEFAULT_SPOT_TAKER_FEE: Decimal = dec!(0.0007);
const DEFAULT_PERP_MAKER_FEE: Decimal = dec!(0.00015);
const DEFAULT_PERP_TAKER_FEE: Decimal = dec!(0.00045);
const DEFAULT_MIN_DIFF_QUANTA: u32 = 1;
const DEFAULT_INTERVAL_MS: u64 = 1000;
const MIN_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Missing(String),
    Invalid(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "Missing config key: {}", key),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> ConfigError {
        ConfigError::Parse(err.to_string())
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    /// Log divergence only.
    Observe,
    /// Overwrite local sizes with the venue's figures.
    Force,
}

impl FromStr for AlignmentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observe" | "log" => Ok(AlignmentMode::Observe),
            "force" => Ok(AlignmentMode::Force),
            other => Err(ConfigError::Invalid(format!(
                "alignment.mode must be 'observe' or 'force', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlignmentMode::Observe => write!(f, "observe"),
            AlignmentMode::Force => write!(f, "force"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub address: String,
    pub secret_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Markets {
    pub base: String,
    pub spot_symbol: String,
    pub perp_symbol: String,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub enter_threshold_apr: Decimal,
    pub exit_threshold_apr: Decimal,
    pub target_usd_notional: Decimal,
    pub hedge_ratio: Decimal,
    pub funding_periods_per_year: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub price_offset_ticks: u32,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub reprice_interval_ms: u64,
    pub max_actions_per_min: usize,
    pub hedge_repair_timeout_ms: u64,
    pub hedge_repair_stage_ms: u64,
    pub hedge_repair_tif: TimeInForce,
    pub leverage: u32,
    pub cross_margin: bool,
    pub enter_exit_cooldown_s: u64,
    pub exit_retrigger_s: u64,
    pub flatten_wait_s: u64,
    pub flatten_poll_ms: u64,
    pub pnl_log_interval_s: u64,
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub per_symbol_notional_cap: Decimal,
    pub portfolio_notional_cap: Decimal,
    pub max_drawdown_usd: Decimal,
    pub min_spread_ticks: u32,
    pub starting_equity_usd: Decimal,
}

#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub spot_maker: Decimal,
    pub spot_taker: Decimal,
    pub perp_maker: Decimal,
    pub perp_taker: Decimal,
}

impl FeeConfig {
    pub fn spot_rate(&self, maker: bool) -> Decimal {
        if maker {
            self.spot_maker
        } else {
            self.spot_taker
        }
    }

    pub fn perp_rate(&self, maker: bool) -> Decimal {
        if maker {
            self.perp_maker
        } else {
            self.perp_taker
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlignmentConfig {
    pub enabled: bool,
    pub mode: AlignmentMode,
    pub min_diff_quanta: u32,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub venue: String,
    pub dry_run: bool,
    pub interval_ms: u64,
    pub once: bool,
    pub event_log_dir: Option<PathBuf>,
    pub replay_file: Option<PathBuf>,
    pub restore_exposure: bool,
}

#[derive(Debug, Clone)]
pub struct FundCarryConfig {
    pub credentials: Credentials,
    pub markets: Markets,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub fees: FeeConfig,
    pub alignment: AlignmentConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CredentialsYaml {
    address: Option<String>,
    secret_key: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MarketsYaml {
    base: Option<String>,
    spot_symbol: Option<String>,
    perp_symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StrategyYaml {
    enter_threshold_apr: Option<Decimal>,
    exit_threshold_apr: Option<Decimal>,
    target_usd_notional: Option<Decimal>,
    hedge_ratio: Option<Decimal>,
    funding_periods_per_year: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExecutionYaml {
    price_offset_ticks: Option<u32>,
    time_in_force: Option<String>,
    post_only: Option<bool>,
    reprice_interval_ms: Option<u64>,
    max_actions_per_min: Option<usize>,
    hedge_repair_timeout_ms: Option<u64>,
    hedge_repair_stage_ms: Option<u64>,
    hedge_repair_tif: Option<String>,
    leverage: Option<u32>,
    cross_margin: Option<bool>,
    enter_exit_cooldown_s: Option<u64>,
    exit_retrigger_s: Option<u64>,
    flatten_wait_s: Option<u64>,
    flatten_poll_ms: Option<u64>,
    pnl_log_interval_s: Option<u64>,
    error_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RiskYaml {
    per_symbol_notional_cap: Option<Decimal>,
    portfolio_notional_cap: Option<Decimal>,
    max_drawdown_usd: Option<Decimal>,
    min_spread_ticks: Option<u32>,
    starting_equity_usd: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeesYaml {
    spot_maker: Option<Decimal>,
    spot_taker: Option<Decimal>,
    perp_maker: Option<Decimal>,
    perp_taker: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlignmentYaml {
    enabled: Option<bool>,
    mode: Option<String>,
    min_diff_quanta: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuntimeYaml {
    venue: Option<String>,
    dry_run: Option<bool>,
    interval_ms: Option<u64>,
    once: Option<bool>,
    event_log_dir: Option<PathBuf>,
    replay_file: Option<PathBuf>,
    restore_exposure: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FundCarryYaml {
    credentials: CredentialsYaml,
    markets: MarketsYaml,
    strategy: StrategyYaml,
    execution: ExecutionYaml,
    risk: RiskYaml,
    fees: FeesYaml,
    alignment: AlignmentYaml,
    runtime: RuntimeYaml,
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn parse_tif(raw: Option<String>, default: TimeInForce, key: &str) -> Result<TimeInForce, ConfigError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|e: String| ConfigError::Invalid(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl FundCarryConfig {
    /// Load from `FUNDCARRY_CONFIG` (or `fundcarry.yaml`), then apply env overrides.
    pub fn from_env_or_yaml() -> Result<Self> {
        let path = env_nonempty("FUNDCARRY_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_yaml_path(&path)?;
        cfg.apply_env_overrides();
        cfg.validate()
            .with_context(|| format!("invalid config {}", path))?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: FundCarryYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        Self::from_yaml(yaml).with_context(|| format!("failed to load config {}", path_ref.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let yaml: FundCarryYaml = serde_yaml::from_str(raw)?;
        Self::from_yaml(yaml)
    }

    fn from_yaml(yaml: FundCarryYaml) -> Result<Self, ConfigError> {
        let FundCarryYaml {
            credentials,
            markets,
            strategy,
            execution,
            risk,
            fees,
            alignment,
            runtime,
        } = yaml;

        let credentials = Credentials {
            address: credentials.address.unwrap_or_default(),
            secret_key: credentials.secret_key.unwrap_or_default(),
            base_url: credentials
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        };

        let markets = Markets {
            base: required(markets.base, "markets.base")?,
            spot_symbol: required(markets.spot_symbol, "markets.spot_symbol")?,
            perp_symbol: required(markets.perp_symbol, "markets.perp_symbol")?,
        };

        let strategy = StrategyConfig {
            enter_threshold_apr: required(
                strategy.enter_threshold_apr,
                "strategy.enter_threshold_apr",
            )?,
            exit_threshold_apr: required(strategy.exit_threshold_apr, "strategy.exit_threshold_apr")?,
            target_usd_notional: required(
                strategy.target_usd_notional,
                "strategy.target_usd_notional",
            )?,
            hedge_ratio: strategy.hedge_ratio.unwrap_or(DEFAULT_HEDGE_RATIO),
            funding_periods_per_year: strategy.funding_periods_per_year,
        };

        let execution = ExecutionConfig {
            price_offset_ticks: execution
                .price_offset_ticks
                .unwrap_or(DEFAULT_PRICE_OFFSET_TICKS),
            time_in_force: parse_tif(execution.time_in_force, DEFAULT_TIF, "execution.time_in_force")?,
            post_only: execution.post_only.unwrap_or(DEFAULT_POST_ONLY),
            reprice_interval_ms: execution
                .reprice_interval_ms
                .unwrap_or(DEFAULT_REPRICE_INTERVAL_MS),
            max_actions_per_min: execution
                .max_actions_per_min
                .unwrap_or(DEFAULT_MAX_ACTIONS_PER_MIN),
            hedge_repair_timeout_ms: execution
                .hedge_repair_timeout_ms
                .unwrap_or(DEFAULT_HEDGE_REPAIR_TIMEOUT_MS),
            hedge_repair_stage_ms: execution
                .hedge_repair_stage_ms
                .unwrap_or(DEFAULT_HEDGE_REPAIR_STAGE_MS),
            hedge_repair_tif: parse_tif(
                execution.hedge_repair_tif,
                DEFAULT_HEDGE_REPAIR_TIF,
                "execution.hedge_repair_tif",
            )?,
            leverage: execution.leverage.unwrap_or(DEFAULT_LEVERAGE),
            cross_margin: execution.cross_margin.unwrap_or(DEFAULT_CROSS_MARGIN),
            enter_exit_cooldown_s: execution
                .enter_exit_cooldown_s
                .unwrap_or(DEFAULT_ENTER_EXIT_COOLDOWN_S),
            exit_retrigger_s: execution.exit_retrigger_s.unwrap_or(DEFAULT_EXIT_RETRIGGER_S),
            flatten_wait_s: execution.flatten_wait_s.unwrap_or(DEFAULT_FLATTEN_WAIT_S),
            flatten_poll_ms: execution.flatten_poll_ms.unwrap_or(DEFAULT_FLATTEN_POLL_MS),
            pnl_log_interval_s: execution
                .pnl_log_interval_s
                .unwrap_or(DEFAULT_PNL_LOG_INTERVAL_S),
            error_backoff_ms: execution.error_backoff_ms.unwrap_or(DEFAULT_ERROR_BACKOFF_MS),
        };

        let risk = RiskConfig {
            per_symbol_notional_cap: required(
                risk.per_symbol_notional_cap,
                "risk.per_symbol_notional_cap",
            )?,
            portfolio_notional_cap: required(
                risk.portfolio_notional_cap,
                "risk.portfolio_notional_cap",
            )?,
            max_drawdown_usd: required(risk.max_drawdown_usd, "risk.max_drawdown_usd")?,
            min_spread_ticks: risk.min_spread_ticks.unwrap_or(DEFAULT_MIN_SPREAD_TICKS),
            starting_equity_usd: risk.starting_equity_usd.unwrap_or(Decimal::ZERO),
        };

        let fees = FeeConfig {
            spot_maker: fees.spot_maker.unwrap_or(DEFAULT_SPOT_MAKER_FEE),
            spot_taker: fees.spot_taker.unwrap_or(DEFAULT_SPOT_TAKER_FEE),
            perp_maker: fees.perp_maker.unwrap_or(DEFAULT_PERP_MAKER_FEE),
            perp_taker: fees.perp_taker.unwrap_or(DEFAULT_PERP_TAKER_FEE),
        };

        let alignment = AlignmentConfig {
            enabled: alignment.enabled.unwrap_or(true),
            mode: match alignment.mode {
                Some(mode) => mode.parse()?,
                None => AlignmentMode::Observe,
            },
            min_diff_quanta: alignment.min_diff_quanta.unwrap_or(DEFAULT_MIN_DIFF_QUANTA),
        };

        let runtime = RuntimeConfig {
            venue: runtime.venue.unwrap_or_else(|| DEFAULT_VENUE.to_string()),
            dry_run: runtime.dry_run.unwrap_or(true),
            interval_ms: runtime.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS),
            once: runtime.once.unwrap_or(false),
            event_log_dir: runtime.event_log_dir,
            replay_file: runtime.replay_file,
            restore_exposure: runtime.restore_exposure.unwrap_or(false),
        };

        Ok(FundCarryConfig {
            credentials,
            markets,
            strategy,
            execution,
            risk,
            fees,
            alignment,
            runtime,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("DRY_RUN") {
            self.runtime.dry_run = env_flag(&value);
        }
        if let Ok(value) = env::var("RUN_ONCE") {
            self.runtime.once = env_flag(&value);
        }
        if let Some(value) = env_nonempty("INTERVAL_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.runtime.interval_ms = ms,
                Err(_) => log::warn!("[CONFIG] ignoring INTERVAL_MS={}", value),
            }
        }
        if let Some(value) = env_nonempty("VENUE") {
            self.runtime.venue = value.trim().to_ascii_lowercase();
        }
        if let Some(value) = env_nonempty("REPLAY_FILE") {
            self.runtime.replay_file = Some(PathBuf::from(value));
        }
        if let Some(value) = env_nonempty("EVENT_LOG_DIR") {
            self.runtime.event_log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_nonempty("FUNDCARRY_ACCOUNT_ADDRESS") {
            self.credentials.address = value;
        }
        if let Some(value) = env_nonempty("FUNDCARRY_SECRET_KEY") {
            self.credentials.secret_key = value;
        }
        if let Some(value) = env_nonempty("FUNDCARRY_BASE_URL") {
            self.credentials.base_url = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.runtime.venue != DEFAULT_VENUE {
            if self.credentials.address.trim().is_empty() {
                return Err(ConfigError::Missing("credentials.address".to_string()));
            }
            if self.credentials.secret_key.trim().is_empty() {
                return Err(ConfigError::Missing("credentials.secret_key".to_string()));
            }
        }
        if !self.credentials.base_url.starts_with("http") {
            return invalid("credentials.base_url must be http(s)");
        }
        if self.markets.spot_symbol.matches('/').count() != 1 {
            return invalid("markets.spot_symbol must be formatted like BASE/QUOTE");
        }
        if self.strategy.enter_threshold_apr < Decimal::ZERO {
            return invalid("strategy.enter_threshold_apr must be non-negative");
        }
        if self.strategy.exit_threshold_apr > self.strategy.enter_threshold_apr {
            return invalid("strategy.exit_threshold_apr must not exceed enter_threshold_apr");
        }
        if self.strategy.target_usd_notional <= Decimal::ZERO {
            return invalid("strategy.target_usd_notional must be positive");
        }
        if self.strategy.hedge_ratio <= Decimal::ZERO {
            return invalid("strategy.hedge_ratio must be positive");
        }
        if let Some(periods) = self.strategy.funding_periods_per_year {
            if periods <= Decimal::ZERO {
                return invalid("strategy.funding_periods_per_year must be positive");
            }
        }
        if self.execution.leverage < 1 {
            return invalid("execution.leverage must be >= 1");
        }
        if self.execution.max_actions_per_min == 0 {
            return invalid("execution.max_actions_per_min must be positive");
        }
        if self.risk.per_symbol_notional_cap <= Decimal::ZERO
            || self.risk.portfolio_notional_cap <= Decimal::ZERO
        {
            return invalid("risk notional caps must be positive");
        }
        if self.risk.max_drawdown_usd <= Decimal::ZERO {
            return invalid("risk.max_drawdown_usd must be positive");
        }
        if self.runtime.venue == DEFAULT_VENUE && self.runtime.replay_file.is_none() {
            return Err(ConfigError::Missing("runtime.replay_file".to_string()));
        }
        Ok(())
    }

    /// Loop cadence with the lower bound applied.
    pub fn interval_ms(&self) -> u64 {
        self.runtime.interval_ms.max(MIN_INTERVAL_MS)
    }
}
