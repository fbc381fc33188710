use crate::error::OutputError;
use crate::record::LogRecord;
use async_trait::async_trait;

/// Live destination backing one enabled target.
///
/// Implementations transport records to a concrete backend (a syslog
/// collector, a webhook). The dispatch layer calls `write` from a
/// per-output background task and never awaits it on the thread that
/// emitted the log event.
#[async_trait]
pub trait Output: Send + Sync {
    /// Deliver or enqueue a single record.
    ///
    /// **Returns**
    /// - `Ok(())` if the record was accepted.
    /// - `Err(..)` if delivery failed. Callers treat this as best-effort;
    ///   the error is logged and the record is not retried.
    ///
    /// Must not block indefinitely and must not panic on records with
    /// missing or unusual fields.
    async fn write(&self, record: &LogRecord) -> Result<(), OutputError>;

    /// Push any buffered records out now and report whether delivery
    /// succeeded.
    ///
    /// Default implementation is a no-op.
    async fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }

    /// Release sockets and background tasks. After `close`, `write`
    /// returns [`OutputError::Closed`]. Closing twice is harmless.
    async fn close(&self) -> Result<(), OutputError>;

    /// Short label used in diagnostics.
    fn kind(&self) -> &'static str;
}
