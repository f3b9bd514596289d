//! Runtime configuration.
//!
//! Values come from flags, then environment variables, then a `.env` file
//! loaded by [`load_dotenv`] before parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};
use tracing::{debug, info};

use crate::data_service::Transport;
use crate::error::{Error, Result};

/// Load `.env` into the process environment if one exists.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => debug!("loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => info!("ignoring unreadable .env: {e}"),
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Args, Debug, Clone, Default)]
pub struct LogConfig {
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub format: LogFormat,

    /// Also write daily-rolled log files here
    #[arg(long = "log-dir", env = "LOG_DIR")]
    pub dir: Option<PathBuf>,
}

/// Edge proxy settings.
#[derive(Parser, Debug, Clone)]
#[command(name = "club_edge", about = "Edge proxy in front of the club data service")]
pub struct ProxyConfig {
    /// Data service base URL; the envelope's endpoint is appended verbatim
    #[arg(long, env = "DATA_SERVICE_URL")]
    pub service_url: String,

    /// Server-held key injected as `apikey` and bearer token
    #[arg(long, env = "DATA_SERVICE_KEY", hide_env_values = true)]
    pub service_key: String,

    #[arg(long, env = "PROXY_BIND", default_value = "0.0.0.0:11111")]
    pub bind: SocketAddr,

    #[command(flatten)]
    pub logging: LogConfig,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.service_url.trim().is_empty() {
            return Err(Error::config("DATA_SERVICE_URL is empty"));
        }
        if self.service_key.trim().is_empty() {
            return Err(Error::config("DATA_SERVICE_KEY is empty"));
        }
        Ok(())
    }
}

/// Settings for processes that talk to the data service as a signed-in user.
#[derive(Args, Debug, Clone)]
pub struct ClientConfig {
    /// Ignored when routing through the proxy
    #[arg(long, env = "DATA_SERVICE_URL", default_value = "")]
    pub service_url: String,

    /// Public key sent with direct calls
    #[arg(long, env = "DATA_SERVICE_ANON_KEY", hide_env_values = true, default_value = "")]
    pub anon_key: String,

    /// Route every call through this edge proxy instead of calling the service directly
    #[arg(long, env = "EDGE_PROXY_URL")]
    pub proxy_url: Option<String>,

    #[arg(long, env = "SESSION_STORE_PATH", default_value = ".club_session")]
    pub session_store: String,

    /// Verify access-token signatures with this secret
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,
}

impl ClientConfig {
    pub fn transport(&self) -> Result<Transport> {
        match self.proxy_url.as_deref().map(str::trim) {
            Some(proxy) if !proxy.is_empty() => Ok(Transport::Proxied {
                proxy_url: proxy.to_string(),
            }),
            _ => {
                let base_url = self.service_url.trim().trim_end_matches('/').to_string();
                if base_url.is_empty() {
                    return Err(Error::config("DATA_SERVICE_URL is empty"));
                }
                if self.anon_key.is_empty() {
                    return Err(Error::config(
                        "DATA_SERVICE_ANON_KEY is required unless EDGE_PROXY_URL is set",
                    ));
                }
                Ok(Transport::Direct {
                    base_url,
                    anon_key: self.anon_key.clone(),
                })
            }
        }
    }

    pub fn jwt_secret(&self) -> Option<&[u8]> {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(proxy: Option<&str>, anon: &str) -> ClientConfig {
        ClientConfig {
            service_url: "https://db.example.org/".into(),
            anon_key: anon.into(),
            proxy_url: proxy.map(String::from),
            session_store: ".club_session".into(),
            jwt_secret: Some(String::new()),
        }
    }

    #[test]
    fn direct_transport_needs_anon_key() {
        assert!(matches!(client(None, "").transport(), Err(Error::Config(_))));
        match client(None, "anon").transport().unwrap() {
            Transport::Direct { base_url, .. } => assert_eq!(base_url, "https://db.example.org"),
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn proxy_url_selects_proxied_transport() {
        let t = client(Some("http://localhost:11111"), "").transport().unwrap();
        assert!(matches!(t, Transport::Proxied { ref proxy_url, .. } if proxy_url == "http://localhost:11111"));
    }

    #[test]
    fn empty_jwt_secret_means_unverified() {
        assert!(client(None, "anon").jwt_secret().is_none());
    }

    #[test]
    fn proxy_config_parses_flags() {
        let cfg = ProxyConfig::try_parse_from([
            "club_edge",
            "--service-url",
            "https://db.example.org",
            "--service-key",
            "secret",
            "--bind",
            "127.0.0.1:8080",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }
}
