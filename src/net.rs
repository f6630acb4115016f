//! WiFi connection maintenance.
//!
//! Keeps the station associated, with a full radio power-cycle after
//! repeated failures; some access points leave the driver in a state only
//! a stop/start clears. The embassy-net stack runs in its own task and
//! picks the link up whenever association returns.

use embassy_time::{Instant, Timer};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};

use crate::config::KioskConfig;

const CONNECT_TIMEOUT_MS: u64 = 10_000;
const MAX_RETRIES_BEFORE_RESET: u8 = 3;
const RESET_COOLDOWN_MS: u64 = 5_000;

/// Drive the WiFi controller forever.
pub async fn maintain_wifi(mut controller: WifiController<'static>, config: &'static KioskConfig) -> ! {
    use alloc::string::ToString;

    let mut retry_count: u8 = 0;

    loop {
        log::info!("wifi: connecting to {}", config.ssid);

        // Stop before (re)configuring to avoid driver errors on a half-up
        // interface.
        let _ = controller.stop();
        Timer::after_millis(10).await;

        let client = ClientConfig::default()
            .with_ssid(config.ssid.to_string())
            .with_password(config.password.to_string());
        if let Err(e) = controller.set_config(&ModeConfig::Client(client)) {
            log::error!("wifi: set_config failed: {:?}", e);
        }
        if let Err(e) = controller.start() {
            log::error!("wifi: start failed: {:?}", e);
        }
        if let Err(e) = controller.connect() {
            log::error!("wifi: connect failed: {:?}", e);
        }

        let started = Instant::now();
        let connected = loop {
            if controller.is_connected().unwrap_or(false) {
                break true;
            }
            if started.elapsed().as_millis() > CONNECT_TIMEOUT_MS {
                break false;
            }
            Timer::after_millis(250).await;
        };

        if connected {
            log::info!("wifi: connected");
            retry_count = 0;

            while controller.is_connected().unwrap_or(false) {
                Timer::after_millis(1_000).await;
            }
            log::warn!("wifi: disconnected, power-cycling radio");
            power_cycle(&mut controller).await;
            Timer::after_millis(RESET_COOLDOWN_MS).await;
        } else {
            retry_count = retry_count.saturating_add(1);
            log::warn!(
                "wifi: connection timeout (attempt {}/{})",
                retry_count,
                MAX_RETRIES_BEFORE_RESET
            );
            if retry_count >= MAX_RETRIES_BEFORE_RESET {
                log::warn!("wifi: power-cycling radio after {} failures", retry_count);
                power_cycle(&mut controller).await;
                retry_count = 0;
                Timer::after_millis(RESET_COOLDOWN_MS).await;
            }
        }
    }
}

async fn power_cycle(controller: &mut WifiController<'static>) {
    if let Err(e) = controller.disconnect() {
        log::warn!("wifi: disconnect failed: {:?}", e);
    }
    if let Err(e) = controller.stop() {
        log::warn!("wifi: stop failed: {:?}", e);
    }
    crate::feed_watchdog();
    Timer::after_millis(100).await;
}
