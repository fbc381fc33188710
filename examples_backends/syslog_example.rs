use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_log_targets::init::init_tracing;
use tracing_log_targets::settings::{SYSLOG_ENABLED, SYSLOG_FORMAT, SYSLOG_HOST, SYSLOG_PORT, SYSLOG_PROTOCOL};
use tracing_log_targets::Manager;

#[tokio::main]
async fn main() {
    // Example: SYSLOG_ADDR=127.0.0.1:514 (listen with `nc -ul 514`)
    let addr = std::env::var("SYSLOG_ADDR").unwrap_or_else(|_| "127.0.0.1:514".to_string());
    let (host, port) = addr.rsplit_once(':').expect("SYSLOG_ADDR must be host:port");

    let settings: HashMap<String, String> = [
        (SYSLOG_ENABLED, "true"),
        (SYSLOG_HOST, host),
        (SYSLOG_PORT, port),
        (SYSLOG_PROTOCOL, "udp"),
        (SYSLOG_FORMAT, "rfc5424"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let manager = Manager::new();
    init_tracing(&manager).expect("install subscriber");
    manager
        .set_settings_manager(Arc::new(settings))
        .await
        .expect("apply syslog settings");

    info!(bucket = "photos", action = "PutObject", "syslog example started");
    warn!(bucket = "photos", usage = 0.93, "bucket quota nearly exhausted");
    error!(code = 503, "simulated error sent via syslog");

    manager.close().await;
}
