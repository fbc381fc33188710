use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};
use tracing_log_targets::init::init_tracing;
use tracing_log_targets::settings::EnvSettings;
use tracing_log_targets::{Manager, TargetConfig};

#[tokio::main]
async fn main() {
    // Example: LOG_TARGETS_HTTP_LOG_URL=http://localhost:8080/logs
    let url = std::env::var("LOG_TARGETS_HTTP_LOG_URL").unwrap_or_else(|_| "http://localhost:8080/logs".to_string());

    let manager = Manager::new();
    init_tracing(&manager).expect("install subscriber");
    manager
        .set_settings_manager(Arc::new(EnvSettings::default()))
        .await
        .expect("read legacy settings");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open sqlite");
    let store = manager.init_target_store(pool).await.expect("init target store");

    if store.count().await.expect("count targets") == 0 {
        let cfg = TargetConfig::http("webhook", url).with_batching(10, 2);
        if let Err(e) = manager.test_target_config(&cfg).await {
            eprintln!("webhook test failed: {}", e);
        }
        store.create(&cfg).await.expect("create target");
        manager.reconfigure().await.expect("reconfigure");
    }

    info!("http backend example started");
    for i in 0..25 {
        error!(request = i, "simulated error sent via HTTP batching");
    }

    // close flushes whatever is still buffered
    manager.close().await;
}
