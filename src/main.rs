use chrono::{DateTime, FixedOffset, Offset, Utc};
use env_logger::Builder;
use fundcarry::config::FundCarryConfig;
use fundcarry::engine::FundingCarryEngine;
use fundcarry::shutdown::{spawn_signal_listener, stop_channel};
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::str::FromStr;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    let offset = FixedOffset::east_opt(offset_seconds).unwrap_or_else(|| Utc.fix());
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let git_hash = option_env!("FUNDCARRY_GIT_HASH").unwrap_or("unknown");
    log::info!("fundcarry git: {}", git_hash);
    log::info!("Starting funding carry loop...");

    let cfg = FundCarryConfig::from_env_or_yaml()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:#}", e)))?;
    let mut engine = FundingCarryEngine::new(cfg)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)))?;

    let (stop, stop_rx) = stop_channel();
    spawn_signal_listener(stop);

    let summary = engine
        .run(stop_rx)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)))?;
    log::info!("Funding carry loop finished net={}", summary.net());
    Ok(())
}
