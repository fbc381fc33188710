use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OutputError;
use crate::output::Output;
use crate::syslog::SyslogOutput;
use crate::target::{TargetConfig, TargetType};

/// Create a concrete [`Output`] for a target configuration.
///
/// Syslog targets dial their collector here, so this fails when the
/// collector is unreachable. HTTP targets only build a client and start
/// their flusher; they must be built inside a Tokio runtime.
pub async fn build_output(cfg: &TargetConfig) -> Result<Arc<dyn Output>, OutputError> {
    match cfg.target_type()? {
        TargetType::Syslog => {
            let output = SyslogOutput::from_config(cfg).await?;
            Ok(Arc::new(output) as Arc<dyn Output>)
        }
        TargetType::Http => {
            #[cfg(feature = "http")]
            {
                use crate::http::HttpOutput;

                let output = HttpOutput::from_config(cfg)?;
                Ok(Arc::new(output) as Arc<dyn Output>)
            }

            #[cfg(not(feature = "http"))]
            {
                let _ = cfg;
                Err(OutputError::FeatureDisabled("http"))
            }
        }
    }
}

/// Seam through which the manager turns configs into outputs.
#[async_trait]
pub trait OutputFactory: Send + Sync {
    async fn build(&self, cfg: &TargetConfig) -> Result<Arc<dyn Output>, OutputError>;
}

/// Factory producing the real syslog and HTTP outputs via [`build_output`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOutputFactory;

#[async_trait]
impl OutputFactory for DefaultOutputFactory {
    async fn build(&self, cfg: &TargetConfig) -> Result<Arc<dyn Output>, OutputError> {
        build_output(cfg).await
    }
}
