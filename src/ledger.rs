use crate::gateway::Fill;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Spot,
    Perp,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Spot => write!(f, "spot"),
            Leg::Perp => write!(f, "perp"),
        }
    }
}

/// Per-leg bookkeeping. Spot is always held long and perp always short, so
/// `size` is an unsigned base quantity on both legs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub size: Decimal,
    pub cost_basis_quote: Decimal,
    pub realized_pnl_quote: Decimal,
    pub fees_quote: Decimal,
}

impl Exposure {
    pub fn avg_entry(&self) -> Option<Decimal> {
        if self.size > Decimal::ZERO && self.cost_basis_quote > Decimal::ZERO {
            Some(self.cost_basis_quote / self.size)
        } else {
            None
        }
    }

    fn enforce_flat_basis(&mut self) {
        if self.size <= Decimal::ZERO {
            self.size = Decimal::ZERO;
            self.cost_basis_quote = Decimal::ZERO;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PnlSummary {
    pub realized_spot: Decimal,
    pub realized_perp: Decimal,
    pub unrealized_spot: Decimal,
    pub unrealized_perp: Decimal,
    pub fees: Decimal,
}

impl PnlSummary {
    pub fn gross(&self) -> Decimal {
        self.realized_spot + self.realized_perp + self.unrealized_spot + self.unrealized_perp
    }

    pub fn net(&self) -> Decimal {
        self.gross() - self.fees
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureLedger {
    spot: Exposure,
    perp: Exposure,
}

impl ExposureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exposure(&self, leg: Leg) -> &Exposure {
        match leg {
            Leg::Spot => &self.spot,
            Leg::Perp => &self.perp,
        }
    }

    fn exposure_mut(&mut self, leg: Leg) -> &mut Exposure {
        match leg {
            Leg::Spot => &mut self.spot,
            Leg::Perp => &mut self.perp,
        }
    }

    pub fn size(&self, leg: Leg) -> Decimal {
        self.exposure(leg).size
    }

    pub fn has_exposure(&self) -> bool {
        self.spot.size > Decimal::ZERO || self.perp.size > Decimal::ZERO
    }

    /// Fill that grows the leg (spot buy, perp sell). Returns the fee charged.
    pub fn record_open_fill(&mut self, leg: Leg, fill: Fill, fee_rate: Decimal) -> Decimal {
        if fill.size <= Decimal::ZERO || fill.avg_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let notional = fill.notional();
        let fee = notional * fee_rate;
        let exp = self.exposure_mut(leg);
        exp.size += fill.size;
        exp.cost_basis_quote += notional;
        exp.fees_quote += fee;
        fee
    }

    /// Fill that shrinks the leg (spot sell, perp buy). Returns the realized
    /// P&L; the fee is charged on the full fill even if it exceeds the tracked size.
    pub fn record_close_fill(&mut self, leg: Leg, fill: Fill, fee_rate: Decimal) -> Decimal {
        if fill.size <= Decimal::ZERO || fill.avg_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let exp = self.exposure_mut(leg);
        exp.fees_quote += fill.notional() * fee_rate;
        let used = fill.size.min(exp.size);
        if used <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let Some(entry) = exp.avg_entry() else {
            exp.size -= used;
            exp.enforce_flat_basis();
            return Decimal::ZERO;
        };
        let realized = match leg {
            Leg::Spot => (fill.avg_price - entry) * used,
            Leg::Perp => (entry - fill.avg_price) * used,
        };
        exp.realized_pnl_quote += realized;
        exp.cost_basis_quote -= entry * used;
        exp.size -= used;
        exp.enforce_flat_basis();
        realized
    }

    /// Replace the tracked size with the venue's figure. The cost basis is
    /// rebuilt from `basis_price` when given, else from the current average.
    pub fn overwrite_size(&mut self, leg: Leg, size: Decimal, basis_price: Option<Decimal>) {
        let exp = self.exposure_mut(leg);
        let prior_avg = exp.avg_entry();
        exp.size = size.max(Decimal::ZERO);
        exp.cost_basis_quote = match (basis_price, prior_avg) {
            (Some(px), _) if px > Decimal::ZERO => px * exp.size,
            (_, Some(avg)) => avg * exp.size,
            _ => Decimal::ZERO,
        };
        exp.enforce_flat_basis();
    }

    pub fn zero(&mut self, leg: Leg) {
        let exp = self.exposure_mut(leg);
        exp.size = Decimal::ZERO;
        exp.cost_basis_quote = Decimal::ZERO;
    }

    pub fn unrealized(&self, leg: Leg, mid: Decimal) -> Decimal {
        let exp = self.exposure(leg);
        if exp.size <= Decimal::ZERO || exp.cost_basis_quote <= Decimal::ZERO || mid <= Decimal::ZERO
        {
            return Decimal::ZERO;
        }
        match leg {
            Leg::Spot => mid * exp.size - exp.cost_basis_quote,
            Leg::Perp => exp.cost_basis_quote - mid * exp.size,
        }
    }

    pub fn summary(&self, spot_mid: Decimal, perp_mid: Decimal) -> PnlSummary {
        PnlSummary {
            realized_spot: self.spot.realized_pnl_quote,
            realized_perp: self.perp.realized_pnl_quote,
            unrealized_spot: self.unrealized(Leg::Spot, spot_mid),
            unrealized_perp: self.unrealized(Leg::Perp, perp_mid),
            fees: self.spot.fees_quote + self.perp.fees_quote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(size: Decimal, px: Decimal) -> Fill {
        Fill {
            size,
            avg_price: px,
            maker: false,
        }
    }

    #[test]
    fn weighted_average_tracks_same_direction_fills() {
        let mut ledger = ExposureLedger::new();
        ledger.record_open_fill(Leg::Spot, fill(dec!(2), dec!(10.00)), Decimal::ZERO);
        ledger.record_open_fill(Leg::Spot, fill(dec!(1), dec!(10.30)), Decimal::ZERO);
        ledger.record_open_fill(Leg::Spot, fill(dec!(1.5), dec!(9.90)), Decimal::ZERO);
        let exp = ledger.exposure(Leg::Spot);
        let expected = (dec!(2) * dec!(10.00) + dec!(1) * dec!(10.30) + dec!(1.5) * dec!(9.90))
            / dec!(4.5);
        let avg = exp.avg_entry().unwrap();
        assert!((avg - expected).abs() <= dec!(0.01));
        assert_eq!(exp.size, dec!(4.5));
    }

    #[test]
    fn closing_short_perp_realizes_against_average() {
        let mut ledger = ExposureLedger::new();
        ledger.record_open_fill(Leg::Perp, fill(dec!(5), dec!(10.02)), Decimal::ZERO);
        let realized = ledger.record_close_fill(Leg::Perp, fill(dec!(5), dec!(9.98)), Decimal::ZERO);
        assert_eq!(realized, dec!(0.20));
        let exp = ledger.exposure(Leg::Perp);
        assert_eq!(exp.size, Decimal::ZERO);
        assert_eq!(exp.cost_basis_quote, Decimal::ZERO);
        assert_eq!(exp.realized_pnl_quote, dec!(0.20));
    }

    #[test]
    fn over_close_is_capped_and_keeps_flat_invariant() {
        let mut ledger = ExposureLedger::new();
        ledger.record_open_fill(Leg::Spot, fill(dec!(1), dec!(10)), Decimal::ZERO);
        let realized = ledger.record_close_fill(Leg::Spot, fill(dec!(3), dec!(11)), dec!(0.001));
        assert_eq!(realized, dec!(1));
        let exp = ledger.exposure(Leg::Spot);
        assert_eq!(exp.size, Decimal::ZERO);
        assert_eq!(exp.cost_basis_quote, Decimal::ZERO);
        assert_eq!(exp.fees_quote, dec!(0.033));
    }

    #[test]
    fn fees_accumulate_into_summary() {
        let mut ledger = ExposureLedger::new();
        let fee = ledger.record_open_fill(Leg::Spot, fill(dec!(10), dec!(10)), dec!(0.0007));
        assert_eq!(fee, dec!(0.07));
        ledger.record_open_fill(Leg::Perp, fill(dec!(10), dec!(10)), dec!(0.00045));
        let summary = ledger.summary(dec!(11), dec!(11));
        assert_eq!(summary.unrealized_spot, dec!(10));
        assert_eq!(summary.unrealized_perp, dec!(-10));
        assert_eq!(summary.fees, dec!(0.115));
        assert_eq!(summary.net(), dec!(-0.115));
    }

    #[test]
    fn overwrite_to_zero_clears_basis() {
        let mut ledger = ExposureLedger::new();
        ledger.record_open_fill(Leg::Perp, fill(dec!(2), dec!(10)), Decimal::ZERO);
        ledger.overwrite_size(Leg::Perp, dec!(3), None);
        assert_eq!(ledger.exposure(Leg::Perp).cost_basis_quote, dec!(30));
        ledger.overwrite_size(Leg::Perp, Decimal::ZERO, Some(dec!(10)));
        assert_eq!(ledger.exposure(Leg::Perp).cost_basis_quote, Decimal::ZERO);
        assert!(!ledger.has_exposure());
    }
}
