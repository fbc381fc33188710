//! Target configuration model and validation.
//!
//! A [`TargetConfig`] mirrors one persisted row. Enumerated columns stay as
//! text so that operator input can be rejected with a message naming the
//! field; [`validate`] parses them into the typed enums below.

use crate::error::ValidationError;
use crate::record::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u32 = 10;
pub const DEFAULT_SYSLOG_TAG: &str = "objectstore";

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        concat!("unsupported ", $what, " '{}' (expected one of: {})"),
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

text_enum!(
    /// Kind of destination a target forwards to.
    TargetType, "target type" {
        Syslog => "syslog",
        Http => "http",
    }
);

text_enum!(
    /// Transport used by a syslog target.
    SyslogProtocol, "protocol" {
        Tcp => "tcp",
        Udp => "udp",
        TcpTls => "tcp+tls",
    }
);

text_enum!(
    /// Syslog message framing.
    SyslogFormat, "format" {
        Rfc3164 => "rfc3164",
        Rfc5424 => "rfc5424",
    }
);

text_enum!(
    /// Minimum severity a target accepts.
    FilterLevel, "filter level" {
        Debug => "debug",
        Info => "info",
        Warn => "warn",
        Error => "error",
    }
);

impl FilterLevel {
    /// `debug` admits everything, `error` admits only error, fatal and panic.
    pub fn admits(&self, level: Level) -> bool {
        level >= self.min_level()
    }

    pub fn min_level(&self) -> Level {
        match self {
            FilterLevel::Debug => Level::Debug,
            FilterLevel::Info => Level::Info,
            FilterLevel::Warn => Level::Warn,
            FilterLevel::Error => Level::Error,
        }
    }
}

/// Persisted configuration for one log destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub enabled: bool,

    // syslog
    pub protocol: String,
    pub host: String,
    pub port: u32,
    pub tag: String,
    pub format: String,
    pub tls_enabled: bool,
    pub tls_cert: String,
    pub tls_key: String,
    pub tls_ca: String,
    pub tls_skip_verify: bool,

    // http
    pub url: String,
    pub auth_token: String,
    pub batch_size: u32,
    pub flush_interval_seconds: u32,

    pub filter_level: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TargetConfig {
    /// An enabled syslog target over UDP with RFC 5424 framing and an
    /// `info` filter.
    pub fn syslog(name: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        Self {
            name: name.into(),
            target_type: TargetType::Syslog.as_str().to_string(),
            enabled: true,
            protocol: SyslogProtocol::Udp.as_str().to_string(),
            host: host.into(),
            port,
            tag: DEFAULT_SYSLOG_TAG.to_string(),
            format: SyslogFormat::Rfc5424.as_str().to_string(),
            filter_level: FilterLevel::Info.as_str().to_string(),
            ..Default::default()
        }
    }

    /// An enabled HTTP target with default batching and an `info` filter.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_type: TargetType::Http.as_str().to_string(),
            enabled: true,
            url: url.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_seconds: DEFAULT_FLUSH_INTERVAL_SECS,
            filter_level: FilterLevel::Info.as_str().to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_filter_level(mut self, level: FilterLevel) -> Self {
        self.filter_level = level.as_str().to_string();
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: SyslogProtocol) -> Self {
        self.protocol = protocol.as_str().to_string();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: SyslogFormat) -> Self {
        self.format = format.as_str().to_string();
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    #[must_use]
    pub fn with_batching(mut self, batch_size: u32, flush_interval_seconds: u32) -> Self {
        self.batch_size = batch_size;
        self.flush_interval_seconds = flush_interval_seconds;
        self
    }

    pub fn target_type(&self) -> Result<TargetType, ValidationError> {
        parse_field("type", &self.target_type)
    }

    pub fn filter_level(&self) -> Result<FilterLevel, ValidationError> {
        parse_field("filterLevel", &self.filter_level)
    }

    /// Batch size with the default applied when unset.
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE as usize
        } else {
            self.batch_size as usize
        }
    }

    /// Flush interval with the default applied when unset.
    pub fn effective_flush_interval_secs(&self) -> u64 {
        if self.flush_interval_seconds == 0 {
            u64::from(DEFAULT_FLUSH_INTERVAL_SECS)
        } else {
            u64::from(self.flush_interval_seconds)
        }
    }
}

fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField { field })
    } else {
        Ok(())
    }
}

fn parse_field<T>(field: &'static str, value: &str) -> Result<T, ValidationError>
where
    T: FromStr<Err = String>,
{
    required(field, value)?;
    value.parse().map_err(|reason| ValidationError::invalid(field, reason))
}

/// Check a config before it is persisted. Stops at the first violation.
pub fn validate(cfg: &TargetConfig) -> Result<(), ValidationError> {
    required("name", &cfg.name)?;

    match cfg.target_type()? {
        TargetType::Syslog => {
            required("host", &cfg.host)?;
            if cfg.port == 0 {
                return Err(ValidationError::MissingField { field: "port" });
            }
            if cfg.port > u32::from(u16::MAX) {
                return Err(ValidationError::invalid("port", "must be between 1 and 65535"));
            }
            parse_field::<SyslogProtocol>("protocol", &cfg.protocol)?;
            parse_field::<SyslogFormat>("format", &cfg.format)?;
        }
        TargetType::Http => {
            required("url", &cfg.url)?;
            let url = cfg.url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ValidationError::invalid("url", "must start with http:// or https://"));
            }
        }
    }

    cfg.filter_level()?;
    Ok(())
}

/// Whether `new` differs from `old` in a way that requires tearing the
/// output down and building a fresh one. `filterLevel`, `name`,
/// `enabled` and timestamps are not connection-relevant.
pub fn target_config_changed(old: &TargetConfig, new: &TargetConfig) -> bool {
    old.target_type != new.target_type
        || old.protocol != new.protocol
        || old.host != new.host
        || old.port != new.port
        || old.tag != new.tag
        || old.format != new.format
        || old.tls_enabled != new.tls_enabled
        || old.tls_cert != new.tls_cert
        || old.tls_key != new.tls_key
        || old.tls_ca != new.tls_ca
        || old.tls_skip_verify != new.tls_skip_verify
        || old.url != new.url
        || old.auth_token != new.auth_token
        || old.batch_size != new.batch_size
        || old.flush_interval_seconds != new.flush_interval_seconds
}
