use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::time::{sleep, Duration};
use tracing::error;

use tracing_log_targets::backend::OutputFactory;
use tracing_log_targets::init::{init_tracing_with_config, LayerConfig};
use tracing_log_targets::output::Output;
use tracing_log_targets::{FilterLevel, LogRecord, Manager, OutputError, TargetConfig};

/// Output that only counts what reaches it.
#[derive(Default)]
struct CountingOutput {
    written: AtomicU64,
}

#[async_trait]
impl Output for CountingOutput {
    async fn write(&self, _record: &LogRecord) -> Result<(), OutputError> {
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), OutputError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "counting"
    }
}

struct CountingFactory(Arc<CountingOutput>);

#[async_trait]
impl OutputFactory for CountingFactory {
    async fn build(&self, _cfg: &TargetConfig) -> Result<Arc<dyn Output>, OutputError> {
        Ok(self.0.clone() as Arc<dyn Output>)
    }
}

#[tokio::main]
async fn main() {
    let counter = Arc::new(CountingOutput::default());
    let manager = Manager::with_factory(Arc::new(CountingFactory(counter.clone()))).with_queue_capacity(50_000);

    init_tracing_with_config(
        &manager,
        LayerConfig {
            enable_stdout: false,
            ..LayerConfig::default()
        },
    )
    .expect("install subscriber");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open sqlite");
    let store = manager.init_target_store(pool).await.expect("init target store");
    store
        .create(&TargetConfig::http("load", "http://127.0.0.1:9/ingest").with_filter_level(FilterLevel::Error))
        .await
        .expect("create target");
    manager.reconfigure().await.expect("reconfigure");

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "dispatch load test error");
    }

    let elapsed = start.elapsed();
    println!(
        "dispatched {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // let the delivery worker drain its queue
    sleep(Duration::from_secs(2)).await;
    let hook = manager.dispatch_hook();
    println!(
        "written: {}, dropped: {}",
        counter.written.load(Ordering::Relaxed),
        hook.dropped_events.load(Ordering::Relaxed)
    );

    manager.close().await;
}
