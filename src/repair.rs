use crate::gateway::{OrderSide, TimeInForce};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RepairPolicy {
    pub timeout: Duration,
    pub stage: Duration,
    pub default_tif: TimeInForce,
    pub escalated_tif: TimeInForce,
    /// Ticks beyond the touch once the stage has elapsed.
    pub escalation_ticks: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairState {
    Idle,
    Repairing {
        target_size: Decimal,
        side: OrderSide,
        started_at: Instant,
        cancel_done: bool,
    },
    TimedOut {
        residual: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    Passive,
    Escalated,
}

/// What the control loop must do for the repair episode this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairAction {
    Nothing,
    CancelSpotOrders,
    Submit {
        side: OrderSide,
        qty: Decimal,
        tif: TimeInForce,
        extra_ticks: u32,
        stage: RepairStage,
    },
    Unwind {
        residual: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RepairProgress {
    Pending { remaining: Decimal },
    Completed,
    Inactive,
}

pub struct HedgeRepairMachine {
    policy: RepairPolicy,
    state: RepairState,
    resting_order: Option<String>,
}

impl HedgeRepairMachine {
    pub fn new(policy: RepairPolicy) -> Self {
        Self {
            policy,
            state: RepairState::Idle,
            resting_order: None,
        }
    }

    pub fn state(&self) -> &RepairState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, RepairState::Idle)
    }

    pub fn target_size(&self) -> Decimal {
        match &self.state {
            RepairState::Repairing { target_size, .. } => *target_size,
            RepairState::TimedOut { residual } => *residual,
            RepairState::Idle => Decimal::ZERO,
        }
    }

    /// Open an episode for an unmatched hedge. Ignored unless idle and `target > 0`.
    pub fn begin(&mut self, target: Decimal, side: OrderSide, now: Instant) -> bool {
        if self.is_active() || target <= Decimal::ZERO {
            return false;
        }
        self.state = RepairState::Repairing {
            target_size: target,
            side,
            started_at: now,
            cancel_done: false,
        };
        self.resting_order = None;
        true
    }

    pub fn mark_cancel_done(&mut self) {
        if let RepairState::Repairing { cancel_done, .. } = &mut self.state {
            *cancel_done = true;
        }
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            RepairState::Repairing { started_at, .. } => {
                Some(now.saturating_duration_since(*started_at))
            }
            _ => None,
        }
    }

    pub fn next_action(&mut self, now: Instant) -> RepairAction {
        match self.state.clone() {
            RepairState::Idle => RepairAction::Nothing,
            RepairState::TimedOut { residual } => RepairAction::Unwind { residual },
            RepairState::Repairing {
                target_size,
                side,
                started_at,
                cancel_done,
            } => {
                let age = now.saturating_duration_since(started_at);
                if age > self.policy.timeout {
                    self.state = RepairState::TimedOut {
                        residual: target_size,
                    };
                    return RepairAction::Unwind {
                        residual: target_size,
                    };
                }
                if !cancel_done {
                    return RepairAction::CancelSpotOrders;
                }
                if age >= self.policy.stage {
                    RepairAction::Submit {
                        side,
                        qty: target_size,
                        tif: self.policy.escalated_tif,
                        extra_ticks: self.policy.escalation_ticks,
                        stage: RepairStage::Escalated,
                    }
                } else {
                    RepairAction::Submit {
                        side,
                        qty: target_size,
                        tif: self.policy.default_tif,
                        extra_ticks: 0,
                        stage: RepairStage::Passive,
                    }
                }
            }
        }
    }

    /// Book a fill against the outstanding target.
    pub fn record_fill(&mut self, filled: Decimal) -> RepairProgress {
        let RepairState::Repairing { target_size, .. } = &mut self.state else {
            return RepairProgress::Inactive;
        };
        if filled > Decimal::ZERO {
            *target_size = (*target_size - filled).max(Decimal::ZERO);
        }
        if *target_size <= Decimal::ZERO {
            self.state = RepairState::Idle;
            self.resting_order = None;
            RepairProgress::Completed
        } else {
            RepairProgress::Pending {
                remaining: *target_size,
            }
        }
    }

    /// Remember a resting repair order so the next submission replaces it.
    pub fn set_resting_order(&mut self, order_id: Option<String>) {
        self.resting_order = order_id;
    }

    pub fn take_resting_order(&mut self) -> Option<String> {
        self.resting_order.take()
    }

    /// The unwind has been attempted; the episode ends regardless of its result.
    pub fn finish_unwind(&mut self) {
        self.state = RepairState::Idle;
        self.resting_order = None;
    }
}
