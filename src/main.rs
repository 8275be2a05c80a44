use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

mod attestation;
mod bench;
mod channel;
mod config;
mod crypto;
mod ctap2;
mod dispatch;
mod hal;
mod presence;
mod server;
mod store;
mod wire;

use bench::BenchmarkLog;
use config::Config;
use ctap2::Authenticator;
use hal::{GadgetEndpoint, NullLed, StatusLed, SysfsButton, SysfsLed};
use server::Server;
use store::CredentialStore;

const CONFIG_PATH: &str = "/etc/fido2_security_key/config.json";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("cryptane starting, version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(Path::new(CONFIG_PATH))?;

    // The data directory lives under /etc and may not be writable until the
    // system finishes coming up; keep trying like the deployment always has.
    let store = loop {
        match CredentialStore::load(&config.store_path()) {
            Ok(store) => break store,
            Err(e) => {
                log::warn!("credential store not ready: {:#}", e);
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    };
    let auth = Authenticator::new(store);

    let bench = if config.benchmarking {
        match BenchmarkLog::create(&config.data_dir) {
            Ok(log) => Some(log),
            Err(e) => {
                log::warn!("benchmarking disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let button = SysfsButton::new(config.button_pin)
        .with_context(|| format!("failed to set up button on GPIO {}", config.button_pin))?;
    let led: Arc<dyn StatusLed> = match SysfsLed::new(config.led_pin) {
        Ok(led) => Arc::new(led),
        Err(e) => {
            log::warn!("LED unavailable, continuing without: {:#}", e);
            Arc::new(NullLed)
        }
    };

    let endpoint = Arc::new(GadgetEndpoint::open_blocking(&config.hid_device));

    // Visible sign of life once the endpoint is up.
    led.set(true);
    std::thread::sleep(Duration::from_secs(2));
    led.set(false);

    Server::new(endpoint, Arc::new(button), led, auth, bench).run()
}
