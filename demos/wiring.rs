#![deny(clippy::all)]

//! Minimal demonstration of wiring up [`sim800l::Sim800l`] against a real
//! serial port. Not a reference implementation of an application — just
//! shows the startup order: load config, start the driver, subscribe to
//! events, queue an SMS.
//!
//! ```text
//! SIM800L_SERIAL_PATH=/dev/ttyUSB2 cargo run --bin wiring
//! ```

use sim800l::{Config, ModemEvent, Sim800l};
use tracing::info;

#[tokio::main]
async fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let config = Config::load(None);
    info!("wiring demo: opening {}", config.serial.path);

    let (driver, _tasks) = Sim800l::start(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to start modem driver: {e}"));

    let mut events = driver.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ModemEvent::Initialized => info!("modem initialized"),
                ModemEvent::Brownout => info!("brownout detected"),
                ModemEvent::StatusChange { sms_id, part_status, .. } => {
                    info!(?sms_id, ?part_status, "sms status changed");
                }
                other => info!(?other, "event"),
            }
        }
    });

    driver
        .sms
        .create_sms("+15550001234", "hello from sim800l-rs")
        .await;

    // Keep the demo alive long enough to watch the send and any delivery report.
    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
}
