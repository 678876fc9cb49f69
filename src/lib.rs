// src/lib.rs
pub mod ports {
    pub mod replay_venue;
}
pub mod trade {
    pub mod execution {
        pub mod gateway_box;
    }
}
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod rate_limit_notifier;
pub mod repair;
pub mod risk;
pub mod shutdown;
pub mod strategy;

#[cfg(test)]
mod testkit;
