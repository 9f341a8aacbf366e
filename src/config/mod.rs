//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{ClearArgs, CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "panelcache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    /// Where the `clear` command reaches the admin API.
    pub admin_url: Url,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PANELCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Clear(args)) => raw.apply_clear_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    upstream: RawUpstreamSettings,
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

/// Replaces `slot` when the override is present.
fn overlay<T: Clone>(slot: &mut T, value: Option<&T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        let (server, upstream, logging, cache) = (
            &mut self.server,
            &mut self.upstream,
            &mut self.logging,
            &mut self.cache,
        );
        server.host = overrides.server_host.clone().or(server.host.take());
        server.admin_host = overrides.server_admin_host.clone().or(server.admin_host.take());
        server.public_port = overrides.public_port.or(server.public_port);
        server.admin_port = overrides.admin_port.or(server.admin_port);
        logging.level = overrides.log_level.clone().or(logging.level.take());
        logging.json = overrides.log_json.or(logging.json);
        upstream.url = overrides.upstream_url.clone().or(upstream.url.take());
        upstream.timeout_seconds = overrides
            .upstream_timeout_seconds
            .or(upstream.timeout_seconds);

        overlay(&mut cache.enabled, overrides.cache_enabled.as_ref());
        overlay(&mut cache.max_entries, overrides.cache_max_entries.as_ref());
        overlay(
            &mut cache.default_ttl_seconds,
            overrides.cache_default_ttl_seconds.as_ref(),
        );
        overlay(&mut cache.aggressive_mode, overrides.cache_aggressive.as_ref());
    }

    fn apply_clear_overrides(&mut self, args: &ClearArgs) {
        self.server.admin_url = args.admin_url.clone().or(self.server.admin_url.take());
        self.logging.level = args.log_level.clone().or(self.logging.level.take());
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            upstream,
            logging,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let upstream = build_upstream_settings(upstream)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            upstream,
            logging,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let public_port = listener_port("server.public_port", server.public_port, DEFAULT_PUBLIC_PORT)?;
    let admin_port = listener_port("server.admin_port", server.admin_port, DEFAULT_ADMIN_PORT)?;

    let public_addr = parse_socket_addr(server.host.as_deref().unwrap_or(DEFAULT_HOST), public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(
        server.admin_host.as_deref().unwrap_or(DEFAULT_ADMIN_HOST),
        admin_port,
    )
    .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    // The admin API is reachable on its own listener unless pointed elsewhere.
    let admin_url = server
        .admin_url
        .unwrap_or_else(|| format!("http://{admin_addr}"));
    let admin_url = parse_http_url(admin_url.trim())
        .map_err(|reason| LoadError::invalid("server.admin_url", reason))?;

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        admin_url,
    })
}

fn listener_port(key: &'static str, port: Option<u16>, default: u16) -> Result<u16, LoadError> {
    match port.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "port must be greater than zero")),
        port => Ok(port),
    }
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let url = parse_http_url(raw_url.trim())
        .map_err(|reason| LoadError::invalid("upstream.url", reason))?;

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = logging
        .level
        .as_deref()
        .map(|raw| LevelFilter::from_str(raw.trim()))
        .transpose()
        .map_err(|err| LoadError::invalid("logging.level", format!("failed to parse: {err}")))?
        .unwrap_or(LevelFilter::INFO);

    let format = match logging.json {
        Some(true) => LogFormat::Json,
        Some(false) | None => LogFormat::Compact,
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    let positive = [
        ("cache.max_entries", cache.max_entries),
        ("cache.index_max_keys", cache.index_max_keys),
        (
            "cache.aggressive_multiplier",
            cache.aggressive_multiplier as usize,
        ),
    ];
    if let Some(&(key, _)) = positive.iter().find(|(_, value)| *value == 0) {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }

    if cache.max_cache_size < cache.min_cache_size {
        return Err(LoadError::invalid(
            "cache.max_cache_size",
            format!(
                "{} is smaller than cache.min_cache_size ({})",
                cache.max_cache_size, cache.min_cache_size
            ),
        ));
    }

    HeaderName::from_bytes(cache.actor_header.trim().as_bytes()).map_err(|_| {
        LoadError::invalid(
            "cache.actor_header",
            format!("`{}` is not a valid header name", cache.actor_header),
        )
    })?;
    Ok(cache)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    admin_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|err| format!("invalid url `{raw}`: {err}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}` in `{raw}`")),
    }
}
