//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building to configure the firmware:
//!
//!   KIOSK_ID=K1 \
//!   KIOSK_LOCKERS=30 \
//!   KIOSK_VIP=4,12 \
//!   KIOSK_SSID=MyWiFi \
//!   KIOSK_PASSWORD=secret123 \
//!   KIOSK_HOST=192.168.1.68 \
//!   KIOSK_PORT=8080 \
//!   cargo build --release

fn main() {
    // Re-run build script if these environment variables change
    println!("cargo::rerun-if-env-changed=KIOSK_ID");
    println!("cargo::rerun-if-env-changed=KIOSK_LOCKERS");
    println!("cargo::rerun-if-env-changed=KIOSK_VIP");
    println!("cargo::rerun-if-env-changed=KIOSK_SSID");
    println!("cargo::rerun-if-env-changed=KIOSK_PASSWORD");
    println!("cargo::rerun-if-env-changed=KIOSK_HOST");
    println!("cargo::rerun-if-env-changed=KIOSK_PORT");
    println!("cargo::rerun-if-env-changed=KIOSK_BAUD");
}
