use crate::dispatch::delivering;
use crate::error::{OutputError, ValidationError};
use crate::output::Output;
use crate::record::LogRecord;
use crate::target::{TargetConfig, TargetType};
use crate::INTERNAL_TARGET;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`HttpOutput`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpSettings {
    /// Webhook endpoint receiving `POST`ed JSON arrays.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub auth_token: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl HttpSettings {
    pub fn from_config(cfg: &TargetConfig) -> Result<Self, OutputError> {
        if cfg.target_type()? != TargetType::Http {
            return Err(ValidationError::invalid("type", "expected an http target").into());
        }
        if cfg.url.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "url" }.into());
        }
        let auth_token = Some(cfg.auth_token.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Ok(Self {
            url: cfg.url.trim().to_string(),
            auth_token,
            batch_size: cfg.effective_batch_size(),
            flush_interval: Duration::from_secs(cfg.effective_flush_interval_secs()),
        })
    }
}

struct Shared {
    client: Client,
    settings: HttpSettings,
    buffer: Mutex<Vec<LogRecord>>,
    flush_now: Notify,
}

impl Shared {
    /// Swap the buffer for an empty one and POST what was in it.
    async fn flush(&self) -> Result<usize, OutputError> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let body = serde_json::to_vec(&batch)?;
        let mut request = self
            .client
            .post(&self.settings.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &self.settings.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(batch.len())
        } else {
            Err(OutputError::Status { status: status.as_u16() })
        }
    }

    /// Flush from the background task; a failed batch is dropped.
    async fn flush_logged(&self) {
        if let Err(e) = self.flush().await {
            tracing::warn!(
                target: INTERNAL_TARGET,
                url = %self.settings.url,
                error = %e,
                "dropping log batch after failed delivery"
            );
        }
    }
}

/// Batching webhook implementation of [`Output`].
///
/// `write` only appends to an in-memory buffer. A background flusher
/// sends the buffer when it reaches `batch_size` or when the flush
/// interval elapses, and once more on `close`.
pub struct HttpOutput {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HttpOutput {
    /// Build the client and spawn the flusher. Must be called inside a
    /// Tokio runtime.
    pub fn new(settings: HttpSettings) -> Result<Self, OutputError> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let settings = HttpSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        let flush_interval = settings.flush_interval.max(Duration::from_millis(10));

        let shared = Arc::new(Shared {
            client,
            settings,
            buffer: Mutex::new(Vec::new()),
            flush_now: Notify::new(),
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let bg = Arc::clone(&shared);
        let handle = tokio::spawn(delivering(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        bg.flush_logged().await;
                        break;
                    }
                    _ = bg.flush_now.notified() => bg.flush_logged().await,
                    _ = ticker.tick() => bg.flush_logged().await,
                }
            }
        }));

        Ok(Self {
            shared,
            shutdown,
            flusher: tokio::sync::Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(cfg: &TargetConfig) -> Result<Self, OutputError> {
        Self::new(HttpSettings::from_config(cfg)?)
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.shared.settings
    }

    /// Records waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.buffer.lock().len()
    }
}

#[async_trait]
impl Output for HttpOutput {
    async fn write(&self, record: &LogRecord) -> Result<(), OutputError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }

        let full = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push(record.clone());
            buffer.len() >= self.shared.settings.batch_size
        };
        if full {
            self.shared.flush_now.notify_one();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.shared.flush().await.map(|_| ())
    }

    async fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            // the flusher performs the final flush before it exits
            let _ = handle.await;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_config() {
        let cfg = TargetConfig::http("hook", " https://hooks.example.com/logs ")
            .with_auth_token("tok")
            .with_batching(0, 3);
        let settings = HttpSettings::from_config(&cfg).unwrap();
        assert_eq!(settings.url, "https://hooks.example.com/logs");
        assert_eq!(settings.auth_token.as_deref(), Some("tok"));
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.flush_interval, Duration::from_secs(3));
    }

    #[test]
    fn blank_token_is_omitted() {
        let cfg = TargetConfig::http("hook", "http://x").with_auth_token("  ");
        assert_eq!(HttpSettings::from_config(&cfg).unwrap().auth_token, None);
    }

    #[test]
    fn settings_reject_syslog_target() {
        let cfg = TargetConfig::syslog("siem", "h", 514);
        assert!(HttpSettings::from_config(&cfg).is_err());
    }
}
