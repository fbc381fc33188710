#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing_log_targets::backend::OutputFactory;
use tracing_log_targets::output::Output;
use tracing_log_targets::{LogRecord, OutputError, TargetConfig};

/// Single-connection in-memory database; every pooled connection would
/// otherwise see its own empty database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite")
}

/// Output that keeps every record it is given, optionally taking
/// `delay` for each write.
#[derive(Default)]
pub struct MemoryOutput {
    pub records: Mutex<Vec<LogRecord>>,
    pub closed: AtomicBool,
    pub delay: Option<Duration>,
}

impl MemoryOutput {
    pub fn messages(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.message.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Output for MemoryOutput {
    async fn write(&self, record: &LogRecord) -> Result<(), OutputError> {
        if self.is_closed() {
            return Err(OutputError::Closed);
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Factory handing out [`MemoryOutput`]s and remembering every build.
/// Targets whose host or url is listed in `unreachable` fail to build.
/// Outputs built while `write_delay` is set are slow.
#[derive(Default)]
pub struct RecordingFactory {
    pub built: Mutex<Vec<(String, Arc<MemoryOutput>)>>,
    pub unreachable: Mutex<HashSet<String>>,
    pub write_delay: Mutex<Option<Duration>>,
}

impl RecordingFactory {
    pub fn builds_for(&self, id: &str) -> usize {
        self.built.lock().iter().filter(|(i, _)| i == id).count()
    }

    pub fn latest(&self, id: &str) -> Option<Arc<MemoryOutput>> {
        self.built
            .lock()
            .iter()
            .rev()
            .find(|(i, _)| i == id)
            .map(|(_, o)| Arc::clone(o))
    }

    pub fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }
}

#[async_trait]
impl OutputFactory for RecordingFactory {
    async fn build(&self, cfg: &TargetConfig) -> Result<Arc<dyn Output>, OutputError> {
        {
            let unreachable = self.unreachable.lock();
            if unreachable.contains(&cfg.host) || unreachable.contains(&cfg.url) {
                return Err(OutputError::Connect {
                    addr: format!("{}:{}", cfg.host, cfg.port),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
        }
        let output = Arc::new(MemoryOutput {
            delay: *self.write_delay.lock(),
            ..MemoryOutput::default()
        });
        self.built.lock().push((cfg.id.clone(), Arc::clone(&output)));
        Ok(output as Arc<dyn Output>)
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    timeout(limit, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
