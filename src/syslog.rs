//! Syslog output over UDP, TCP or TLS-wrapped TCP.
//!
//! Each record is rendered as JSON and framed as RFC 3164 or RFC 5424.
//! The output keeps one persistent connection; a failed write closes it,
//! redials once and retries the frame once before giving up.

use crate::error::{OutputError, ValidationError};
use crate::output::Output;
use crate::record::{value_text, Level, LogRecord};
use crate::target::{SyslogFormat, SyslogProtocol, TargetConfig, TargetType, DEFAULT_SYSLOG_TAG};
use crate::INTERNAL_TARGET;
use async_trait::async_trait;
use chrono::SecondsFormat;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// `daemon` facility.
pub const FACILITY_DAEMON: u8 = 3;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for the goodbye on `close`; a connection that cannot be
/// shut down in time is dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Syslog severity for a level name. Unknown names map to `info` (6).
pub fn severity_for(level: &str) -> u8 {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => 7,
        "info" => 6,
        "notice" => 5,
        "warn" | "warning" => 4,
        "error" => 3,
        "fatal" | "panic" => 2,
        _ => 6,
    }
}

pub fn priority(level: Level) -> u8 {
    FACILITY_DAEMON * 8 + severity_for(level.as_str())
}

/// Escape an SD-PARAM value: backslash, double quote and closing bracket
/// are prefixed with a backslash.
pub fn escape_sd_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `[tag@0 key="value" ...]` built from the record's fields, or `-` when
/// there are none.
pub fn structured_data(tag: &str, record: &LogRecord) -> String {
    if record.fields.is_empty() {
        return "-".to_string();
    }

    let mut sd = format!("[{}@0", tag);
    for (key, value) in &record.fields {
        sd.push(' ');
        sd.push_str(key);
        sd.push_str("=\"");
        sd.push_str(&escape_sd_value(&value_text(value)));
        sd.push('"');
    }
    sd.push(']');
    sd
}

fn render_body(record: &LogRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| record.message.clone())
}

/// `<priority>Mmm dd HH:MM:SS tag[pid]: body\n`
pub fn format_rfc3164(record: &LogRecord, tag: &str, pid: u32) -> String {
    format!(
        "<{}>{} {}[{}]: {}\n",
        priority(record.level),
        record.timestamp.format("%b %e %H:%M:%S"),
        tag,
        pid,
        render_body(record)
    )
}

/// `<priority>1 timestamp hostname tag pid msgid structured-data body\n`
///
/// `msgid` is the `action` field when present.
pub fn format_rfc5424(record: &LogRecord, tag: &str, hostname: &str, pid: u32) -> String {
    let msgid = record
        .field_text("action")
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "<{}>1 {} {} {} {} {} {} {}\n",
        priority(record.level),
        record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        hostname,
        tag,
        pid,
        msgid,
        structured_data(tag, record),
        render_body(record)
    )
}

/// Parsed, validated connection parameters for a syslog target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyslogSettings {
    pub protocol: SyslogProtocol,
    pub host: String,
    pub port: u16,
    pub tag: String,
    pub format: SyslogFormat,
    pub tls_enabled: bool,
    pub tls_cert: String,
    pub tls_key: String,
    pub tls_ca: String,
    pub tls_skip_verify: bool,
}

impl SyslogSettings {
    pub fn from_config(cfg: &TargetConfig) -> Result<Self, OutputError> {
        if cfg.target_type()? != TargetType::Syslog {
            return Err(ValidationError::invalid("type", "expected a syslog target").into());
        }
        if cfg.host.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "host" }.into());
        }
        let port = u16::try_from(cfg.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ValidationError::invalid("port", "must be between 1 and 65535"))?;
        let protocol = cfg
            .protocol
            .parse()
            .map_err(|reason| ValidationError::invalid("protocol", reason))?;
        let format = cfg
            .format
            .parse()
            .map_err(|reason| ValidationError::invalid("format", reason))?;
        let tag = if cfg.tag.trim().is_empty() {
            DEFAULT_SYSLOG_TAG.to_string()
        } else {
            cfg.tag.clone()
        };

        Ok(Self {
            protocol,
            host: cfg.host.trim().to_string(),
            port,
            tag,
            format,
            tls_enabled: cfg.tls_enabled,
            tls_cert: cfg.tls_cert.clone(),
            tls_key: cfg.tls_key.clone(),
            tls_ca: cfg.tls_ca.clone(),
            tls_skip_verify: cfg.tls_skip_verify,
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls_enabled || self.protocol == SyslogProtocol::TcpTls
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn tls_err(context: &str, err: impl std::fmt::Debug) -> OutputError {
    OutputError::Tls(format!("{}: {:?}", context, err))
}

fn parse_certs(field: &str, pem: &str) -> Result<Vec<CertificateDer<'static>>, OutputError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(field, e))?;
    if certs.is_empty() {
        return Err(OutputError::Tls(format!("{}: no PEM certificates found", field)));
    }
    Ok(certs)
}

/// Build the TLS client configuration for a syslog target: CA bundle (or
/// the platform roots), optional client certificate, optional
/// verification bypass.
pub fn build_tls_config(settings: &SyslogSettings) -> Result<Arc<ClientConfig>, OutputError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    if settings.tls_ca.trim().is_empty() {
        let native = rustls_native_certs::load_native_certs();
        roots.add_parsable_certificates(native.certs);
    } else {
        for cert in parse_certs("tlsCA", &settings.tls_ca)? {
            roots.add(cert).map_err(|e| tls_err("tlsCA", e))?;
        }
    }

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?
        .with_root_certificates(roots);

    let has_client_pair = !settings.tls_cert.trim().is_empty() && !settings.tls_key.trim().is_empty();
    let mut config = if has_client_pair {
        let certs = parse_certs("tlsCert", &settings.tls_cert)?;
        let key = PrivateKeyDer::from_pem_slice(settings.tls_key.as_bytes()).map_err(|e| tls_err("tlsKey", e))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_err("client certificate", e))?
    } else {
        builder.with_no_client_auth()
    };

    if settings.tls_skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    }

    Ok(Arc::new(config))
}

/// Accepts any server certificate while still checking handshake
/// signatures. Only installed when `tlsSkipVerify` is set.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

enum Connection {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Udp(socket) => socket.send(frame).await.map(|_| ()),
            Connection::Tcp(stream) => {
                stream.write_all(frame).await?;
                stream.flush().await
            }
            Connection::Tls(stream) => {
                stream.write_all(frame).await?;
                stream.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Udp(_) => Ok(()),
            Connection::Tcp(stream) => stream.shutdown().await,
            Connection::Tls(stream) => stream.shutdown().await,
        }
    }
}

struct TlsParams {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Syslog implementation of [`Output`].
pub struct SyslogOutput {
    settings: SyslogSettings,
    tls: Option<TlsParams>,
    hostname: String,
    pid: u32,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    /// Flipped by `close` to abandon a write stuck on a dead peer.
    closing: watch::Sender<bool>,
}

impl SyslogOutput {
    /// Resolve, optionally build TLS parameters, and dial the collector.
    /// Fails if the initial connection cannot be established.
    pub async fn connect(settings: SyslogSettings) -> Result<Self, OutputError> {
        let tls = if settings.uses_tls() {
            let config = build_tls_config(&settings)?;
            let server_name = ServerName::try_from(settings.host.clone()).map_err(|e| tls_err("server name", e))?;
            Some(TlsParams {
                connector: TlsConnector::from(config),
                server_name,
            })
        } else {
            None
        };

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "-".to_string());

        let output = Self {
            settings,
            tls,
            hostname,
            pid: std::process::id(),
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: watch::Sender::new(false),
        };

        let conn = output.dial().await?;
        *output.conn.lock().await = Some(conn);
        Ok(output)
    }

    pub async fn from_config(cfg: &TargetConfig) -> Result<Self, OutputError> {
        Self::connect(SyslogSettings::from_config(cfg)?).await
    }

    pub fn settings(&self) -> &SyslogSettings {
        &self.settings
    }

    /// Render a record as one framed syslog line.
    pub fn format(&self, record: &LogRecord) -> String {
        match self.settings.format {
            SyslogFormat::Rfc3164 => format_rfc3164(record, &self.settings.tag, self.pid),
            SyslogFormat::Rfc5424 => format_rfc5424(record, &self.settings.tag, &self.hostname, self.pid),
        }
    }

    /// Whether a connection is currently held. False after a failed
    /// reconnect until the next write dials again.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn dial(&self) -> Result<Connection, OutputError> {
        let secs = CONNECT_TIMEOUT.as_secs();
        timeout(CONNECT_TIMEOUT, self.dial_inner())
            .await
            .map_err(|_| OutputError::Timeout { operation: "connect", secs })?
    }

    async fn dial_inner(&self) -> Result<Connection, OutputError> {
        let addr = self.settings.addr();
        let connect_err = |source: std::io::Error| OutputError::Connect {
            addr: addr.clone(),
            source,
        };
        let host = self.settings.host.as_str();
        let port = self.settings.port;

        if let Some(tls) = &self.tls {
            let tcp = TcpStream::connect((host, port)).await.map_err(connect_err)?;
            tcp.set_nodelay(true)?;
            let stream = tls
                .connector
                .connect(tls.server_name.clone(), tcp)
                .await
                .map_err(connect_err)?;
            return Ok(Connection::Tls(Box::new(stream)));
        }

        match self.settings.protocol {
            SyslogProtocol::Udp => {
                let target = lookup_host((host, port))
                    .await
                    .map_err(connect_err)?
                    .next()
                    .ok_or_else(|| {
                        connect_err(std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"))
                    })?;
                let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind).await.map_err(connect_err)?;
                socket.connect(target).await.map_err(connect_err)?;
                Ok(Connection::Udp(socket))
            }
            SyslogProtocol::Tcp | SyslogProtocol::TcpTls => {
                let tcp = TcpStream::connect((host, port)).await.map_err(connect_err)?;
                tcp.set_nodelay(true)?;
                Ok(Connection::Tcp(tcp))
            }
        }
    }
}

impl SyslogOutput {
    async fn send_or_redial(&self, frame: &[u8]) -> Result<(), OutputError> {
        let mut conn = self.conn.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }

        let first = match conn.as_mut() {
            Some(c) => send_frame(c, frame).await,
            None => Err(OutputError::NotConnected),
        };
        let first_err = match first {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tracing::debug!(
            target: INTERNAL_TARGET,
            addr = %self.settings.addr(),
            error = %first_err,
            "syslog write failed, reconnecting"
        );

        if let Some(mut broken) = conn.take() {
            let _ = timeout(CLOSE_TIMEOUT, broken.shutdown()).await;
        }

        // One reconnect and one retry; on failure the connection stays empty.
        let mut fresh = self.dial().await?;
        send_frame(&mut fresh, frame).await?;
        *conn = Some(fresh);
        Ok(())
    }
}

async fn send_frame(conn: &mut Connection, frame: &[u8]) -> Result<(), OutputError> {
    match timeout(WRITE_TIMEOUT, conn.send(frame)).await {
        Ok(result) => result.map_err(OutputError::from),
        Err(_) => Err(OutputError::Timeout {
            operation: "write",
            secs: WRITE_TIMEOUT.as_secs(),
        }),
    }
}

#[async_trait]
impl Output for SyslogOutput {
    async fn write(&self, record: &LogRecord) -> Result<(), OutputError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed);
        }

        let frame = self.format(record);
        let mut closing = self.closing.subscribe();
        tokio::select! {
            biased;
            _ = closing.wait_for(|c| *c) => Err(OutputError::Closed),
            result = self.send_or_redial(frame.as_bytes()) => result,
        }
    }

    async fn close(&self) -> Result<(), OutputError> {
        self.closed.store(true, Ordering::Release);
        self.closing.send_replace(true);

        let mut conn = self.conn.lock().await;
        if let Some(mut c) = conn.take() {
            if let Ok(result) = timeout(CLOSE_TIMEOUT, c.shutdown()).await {
                result?;
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "syslog"
    }
}
