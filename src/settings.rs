//! Legacy single-target settings.
//!
//! Before targets lived in their own table, the server carried exactly one
//! syslog destination and one HTTP destination as flat settings. These
//! keys are read through [`SettingsReader`] to migrate them into
//! [`TargetConfig`] rows, and to serve them while no store is attached.

use crate::target::{
    FilterLevel, SyslogFormat, SyslogProtocol, TargetConfig, TargetType, DEFAULT_BATCH_SIZE,
    DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_SYSLOG_TAG,
};
use std::collections::HashMap;

pub const SYSLOG_ENABLED: &str = "syslog_enabled";
pub const SYSLOG_PROTOCOL: &str = "syslog_protocol";
pub const SYSLOG_HOST: &str = "syslog_host";
pub const SYSLOG_PORT: &str = "syslog_port";
pub const SYSLOG_TAG: &str = "syslog_tag";
pub const SYSLOG_FORMAT: &str = "syslog_format";
pub const SYSLOG_TLS_ENABLED: &str = "syslog_tls_enabled";
pub const SYSLOG_TLS_CERT: &str = "syslog_tls_cert";
pub const SYSLOG_TLS_KEY: &str = "syslog_tls_key";
pub const SYSLOG_TLS_CA: &str = "syslog_tls_ca";
pub const SYSLOG_TLS_SKIP_VERIFY: &str = "syslog_tls_skip_verify";
pub const SYSLOG_FILTER_LEVEL: &str = "syslog_filter_level";

pub const HTTP_LOG_ENABLED: &str = "http_log_enabled";
pub const HTTP_LOG_URL: &str = "http_log_url";
pub const HTTP_LOG_AUTH_TOKEN: &str = "http_log_auth_token";
pub const HTTP_LOG_BATCH_SIZE: &str = "http_log_batch_size";
pub const HTTP_LOG_FLUSH_INTERVAL: &str = "http_log_flush_interval";
pub const HTTP_LOG_FILTER_LEVEL: &str = "http_log_filter_level";

/// Ids given to legacy targets while they are served straight from
/// settings, so repeated reconciliation keeps the same outputs.
pub const LEGACY_SYSLOG_ID: &str = "legacy-syslog";
pub const LEGACY_HTTP_ID: &str = "legacy-http";

/// Read access to the server's flat key/value settings.
pub trait SettingsReader: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }
}

impl SettingsReader for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Settings read from environment variables: key `syslog_host` with
/// prefix `LOG_TARGETS_` is looked up as `LOG_TARGETS_SYSLOG_HOST`.
#[derive(Clone, Debug)]
pub struct EnvSettings {
    prefix: String,
}

pub const DEFAULT_ENV_PREFIX: &str = "LOG_TARGETS_";

impl EnvSettings {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_ascii_uppercase())
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl SettingsReader for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

fn get_or(settings: &dyn SettingsReader, key: &str, default: &str) -> String {
    settings
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn get_u32(settings: &dyn SettingsReader, key: &str, default: u32) -> u32 {
    settings
        .get_int(key)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

/// Legacy syslog target, if enabled and pointing at a host.
pub fn legacy_syslog_target(settings: &dyn SettingsReader) -> Option<TargetConfig> {
    if !settings.get_bool(SYSLOG_ENABLED) {
        return None;
    }
    let host = settings.get(SYSLOG_HOST).unwrap_or_default();
    if host.trim().is_empty() {
        return None;
    }

    Some(TargetConfig {
        id: LEGACY_SYSLOG_ID.to_string(),
        name: "syslog (migrated)".to_string(),
        target_type: TargetType::Syslog.as_str().to_string(),
        enabled: true,
        protocol: get_or(settings, SYSLOG_PROTOCOL, SyslogProtocol::Udp.as_str()),
        host,
        port: get_u32(settings, SYSLOG_PORT, 514),
        tag: get_or(settings, SYSLOG_TAG, DEFAULT_SYSLOG_TAG),
        format: get_or(settings, SYSLOG_FORMAT, SyslogFormat::Rfc3164.as_str()),
        tls_enabled: settings.get_bool(SYSLOG_TLS_ENABLED),
        tls_cert: settings.get(SYSLOG_TLS_CERT).unwrap_or_default(),
        tls_key: settings.get(SYSLOG_TLS_KEY).unwrap_or_default(),
        tls_ca: settings.get(SYSLOG_TLS_CA).unwrap_or_default(),
        tls_skip_verify: settings.get_bool(SYSLOG_TLS_SKIP_VERIFY),
        filter_level: get_or(settings, SYSLOG_FILTER_LEVEL, FilterLevel::Info.as_str()),
        ..Default::default()
    })
}

/// Legacy HTTP target, if enabled and pointing at a URL.
pub fn legacy_http_target(settings: &dyn SettingsReader) -> Option<TargetConfig> {
    if !settings.get_bool(HTTP_LOG_ENABLED) {
        return None;
    }
    let url = settings.get(HTTP_LOG_URL).unwrap_or_default();
    if url.trim().is_empty() {
        return None;
    }

    Some(TargetConfig {
        id: LEGACY_HTTP_ID.to_string(),
        name: "http (migrated)".to_string(),
        target_type: TargetType::Http.as_str().to_string(),
        enabled: true,
        url,
        auth_token: settings.get(HTTP_LOG_AUTH_TOKEN).unwrap_or_default(),
        batch_size: get_u32(settings, HTTP_LOG_BATCH_SIZE, DEFAULT_BATCH_SIZE),
        flush_interval_seconds: get_u32(settings, HTTP_LOG_FLUSH_INTERVAL, DEFAULT_FLUSH_INTERVAL_SECS),
        filter_level: get_or(settings, HTTP_LOG_FILTER_LEVEL, FilterLevel::Info.as_str()),
        ..Default::default()
    })
}

/// Every enabled legacy target, syslog first.
pub fn legacy_targets(settings: &dyn SettingsReader) -> Vec<TargetConfig> {
    legacy_syslog_target(settings)
        .into_iter()
        .chain(legacy_http_target(settings))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn reader_helpers() {
        let s = settings(&[("a", " 42 "), ("b", "TRUE"), ("c", "no"), ("d", "x")]);
        assert_eq!(s.get_int("a"), Some(42));
        assert_eq!(s.get_int("d"), None);
        assert!(s.get_bool("b"));
        assert!(!s.get_bool("c"));
        assert!(!s.get_bool("missing"));
    }

    #[test]
    fn disabled_legacy_settings_yield_nothing() {
        let s = settings(&[(SYSLOG_HOST, "10.0.0.1"), (HTTP_LOG_URL, "http://x")]);
        assert!(legacy_targets(&s).is_empty());

        let s = settings(&[(SYSLOG_ENABLED, "true")]);
        assert!(legacy_targets(&s).is_empty());
    }

    #[test]
    fn legacy_values_are_copied() {
        let s = settings(&[
            (SYSLOG_ENABLED, "true"),
            (SYSLOG_HOST, "siem.internal"),
            (SYSLOG_PORT, "6514"),
            (SYSLOG_PROTOCOL, "tcp+tls"),
            (SYSLOG_TAG, "minio"),
            (SYSLOG_FORMAT, "rfc5424"),
            (SYSLOG_TLS_SKIP_VERIFY, "1"),
            (HTTP_LOG_ENABLED, "on"),
            (HTTP_LOG_URL, "https://hooks.example.com"),
            (HTTP_LOG_AUTH_TOKEN, "tok"),
            (HTTP_LOG_BATCH_SIZE, "25"),
        ]);

        let targets = legacy_targets(&s);
        assert_eq!(targets.len(), 2);

        let syslog = &targets[0];
        assert_eq!(syslog.id, LEGACY_SYSLOG_ID);
        assert_eq!(syslog.host, "siem.internal");
        assert_eq!(syslog.port, 6514);
        assert_eq!(syslog.protocol, "tcp+tls");
        assert_eq!(syslog.tag, "minio");
        assert!(syslog.tls_skip_verify);
        assert_eq!(syslog.filter_level, "info");

        let http = &targets[1];
        assert_eq!(http.id, LEGACY_HTTP_ID);
        assert_eq!(http.url, "https://hooks.example.com");
        assert_eq!(http.auth_token, "tok");
        assert_eq!(http.batch_size, 25);
        assert_eq!(http.flush_interval_seconds, DEFAULT_FLUSH_INTERVAL_SECS);
        assert!(crate::target::validate(http).is_ok());
    }

    #[test]
    fn env_var_names() {
        let env = EnvSettings::default();
        assert_eq!(env.var_name(SYSLOG_HOST), "LOG_TARGETS_SYSLOG_HOST");
        assert_eq!(EnvSettings::new("S3_").var_name(HTTP_LOG_URL), "S3_HTTP_LOG_URL");
    }
}
