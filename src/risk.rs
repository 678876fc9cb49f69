use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum RiskError {
    CapacityExceeded {
        symbol: String,
        delta: Decimal,
        symbol_used: Decimal,
        portfolio_used: Decimal,
    },
}

impl fmt::Display for RiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskError::CapacityExceeded {
                symbol,
                delta,
                symbol_used,
                portfolio_used,
            } => write!(
                f,
                "notional cap exceeded for {}: delta={} symbol_used={} portfolio_used={}",
                symbol, delta, symbol_used, portfolio_used
            ),
        }
    }
}

impl std::error::Error for RiskError {}

/// Per-symbol and portfolio notional budget, in quote currency.
#[derive(Debug, Clone)]
pub struct NotionalLimiter {
    per_symbol_cap: Decimal,
    portfolio_cap: Decimal,
    used: HashMap<String, Decimal>,
}

impl NotionalLimiter {
    pub fn new(per_symbol_cap: Decimal, portfolio_cap: Decimal) -> Self {
        Self {
            per_symbol_cap,
            portfolio_cap,
            used: HashMap::new(),
        }
    }

    pub fn used(&self, symbol: &str) -> Decimal {
        self.used.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn total(&self) -> Decimal {
        self.used.values().copied().sum()
    }

    pub fn can_add(&self, symbol: &str, delta: Decimal) -> bool {
        let next_symbol = (self.used(symbol) + delta).max(Decimal::ZERO);
        let next_total = (self.total() + delta).max(Decimal::ZERO);
        next_symbol <= self.per_symbol_cap && next_total <= self.portfolio_cap
    }

    /// Commit `delta`. Negative deltas release budget and clamp at zero.
    pub fn apply(&mut self, symbol: &str, delta: Decimal) -> Result<(), RiskError> {
        if !self.can_add(symbol, delta) {
            return Err(RiskError::CapacityExceeded {
                symbol: symbol.to_string(),
                delta,
                symbol_used: self.used(symbol),
                portfolio_used: self.total(),
            });
        }
        let slot = self.used.entry(symbol.to_string()).or_insert(Decimal::ZERO);
        *slot = (*slot + delta).max(Decimal::ZERO);
        Ok(())
    }

    pub fn reset(&mut self, symbol: &str) {
        self.used.remove(symbol);
    }
}

/// Sliding one-minute action budget.
#[derive(Debug, Clone)]
pub struct OrderRateLimiter {
    max_actions_per_min: usize,
    times: VecDeque<Instant>,
}

impl OrderRateLimiter {
    pub fn new(max_actions_per_min: usize) -> Self {
        Self {
            max_actions_per_min,
            times: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.times.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        if self.times.len() < self.max_actions_per_min {
            self.times.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn in_window(&self) -> usize {
        self.times.len()
    }
}

/// Peak-to-current equity halt. Once halted it stays halted for the process.
#[derive(Debug, Clone)]
pub struct DrawdownGuard {
    max_drawdown: Decimal,
    peak: Option<Decimal>,
    halted: bool,
}

impl DrawdownGuard {
    pub fn new(max_drawdown: Decimal) -> Self {
        Self {
            max_drawdown,
            peak: None,
            halted: false,
        }
    }

    /// Returns true when this update tripped the halt.
    pub fn update_equity(&mut self, equity: Decimal) -> bool {
        let peak = match self.peak {
            Some(p) if p >= equity => p,
            _ => equity,
        };
        self.peak = Some(peak);
        if !self.halted && peak - equity >= self.max_drawdown {
            self.halted = true;
            return true;
        }
        false
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn peak(&self) -> Option<Decimal> {
        self.peak
    }
}

/// The three gates consulted before any new entry.
#[derive(Debug, Clone)]
pub struct RiskGuardLayer {
    pub notional: NotionalLimiter,
    pub rate: OrderRateLimiter,
    pub drawdown: DrawdownGuard,
}

impl RiskGuardLayer {
    pub fn new(
        per_symbol_cap: Decimal,
        portfolio_cap: Decimal,
        max_actions_per_min: usize,
        max_drawdown: Decimal,
    ) -> Self {
        Self {
            notional: NotionalLimiter::new(per_symbol_cap, portfolio_cap),
            rate: OrderRateLimiter::new(max_actions_per_min),
            drawdown: DrawdownGuard::new(max_drawdown),
        }
    }
}
