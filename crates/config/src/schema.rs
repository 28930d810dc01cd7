//! Config schema types (server listener, tls, authentication gate).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8086;
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_CHANNEL_TTL_SECS: u64 = 60 * 60;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NaclgateConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
}

/// Listener settings and the process key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Origins allowed by CORS. `"*"` allows any origin.
    pub allowed_origins: Vec<String>,

    /// Hex-encoded static private key. A fresh key is generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// When present the server speaks `wss://`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            private_key: None,
            tls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Authentication gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Full-match regexes on the request path that bypass authentication.
    pub exclude_routes: Vec<String>,

    /// HTTP methods that bypass authentication (exact match).
    pub exclude_methods: Vec<String>,

    /// Maximum number of cached peer channels.
    pub channel_cache_capacity: usize,

    /// Idle lifetime of a cached channel. `0` keeps channels until evicted by capacity.
    pub channel_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            exclude_routes: vec!["/getpublickey".into()],
            exclude_methods: Vec::new(),
            channel_cache_capacity: DEFAULT_CACHE_CAPACITY,
            channel_ttl_secs: DEFAULT_CHANNEL_TTL_SECS,
        }
    }
}

impl AuthConfig {
    pub fn channel_ttl(&self) -> Option<Duration> {
        (self.channel_ttl_secs > 0).then(|| Duration::from_secs(self.channel_ttl_secs))
    }
}

impl ServerConfig {
    /// Transport scheme clients should use for the streaming endpoint.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "wss://"
        } else {
            "ws://"
        }
    }

    /// Decode the configured private key, if any.
    pub fn private_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(raw) = self.private_key.as_deref() else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let bytes = hex::decode(raw).map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ConfigError::InvalidPrivateKey(format!("got {} bytes", b.len())))?;
        Ok(Some(key))
    }
}

impl NaclgateConfig {
    /// Check everything that would otherwise fail later at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidAddress(format!(
                "{}:{}",
                self.server.host, self.server.port
            )));
        }

        self.server.private_key_bytes()?;

        if let Some(tls) = &self.server.tls {
            if tls.cert_path.as_os_str().is_empty() {
                return Err(ConfigError::IncompleteTls("cert_path"));
            }
            if tls.key_path.as_os_str().is_empty() {
                return Err(ConfigError::IncompleteTls("key_path"));
            }
        }

        for pattern in &self.auth.exclude_routes {
            regex::Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                ConfigError::InvalidExcludePattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                }
            })?;
        }

        if let Some(method) = self
            .auth
            .exclude_methods
            .iter()
            .find(|method| !is_method_token(method))
        {
            return Err(ConfigError::InvalidExcludeMethod(method.clone()));
        }

        Ok(())
    }
}

/// RFC 9110 `token`: what an HTTP method name may contain.
fn is_method_token(method: &str) -> bool {
    !method.is_empty()
        && method
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exclude_public_key_route() {
        let cfg = NaclgateConfig::default();
        assert_eq!(cfg.auth.exclude_routes, vec!["/getpublickey".to_string()]);
        assert_eq!(cfg.server.scheme(), "ws://");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tls_switches_scheme() {
        let mut cfg = ServerConfig::default();
        cfg.tls = Some(TlsConfig {
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        });
        assert_eq!(cfg.scheme(), "wss://");
    }

    #[test]
    fn private_key_must_be_32_bytes() {
        let mut cfg = ServerConfig::default();
        cfg.private_key = Some("abcd".into());
        assert!(matches!(
            cfg.private_key_bytes(),
            Err(ConfigError::InvalidPrivateKey(_))
        ));

        cfg.private_key = Some("zz".repeat(32));
        assert!(cfg.private_key_bytes().is_err());

        cfg.private_key = Some("11".repeat(32));
        assert_eq!(cfg.private_key_bytes().unwrap(), Some([0x11; 32]));
    }

    #[test]
    fn blank_private_key_means_generate() {
        let mut cfg = ServerConfig::default();
        cfg.private_key = Some("  ".into());
        assert_eq!(cfg.private_key_bytes().unwrap(), None);
    }

    #[test]
    fn invalid_exclude_pattern_is_rejected() {
        let mut cfg = NaclgateConfig::default();
        cfg.auth.exclude_routes.push("/broken(".into());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidExcludePattern { .. })
        ));
    }

    #[test]
    fn invalid_exclude_method_is_rejected() {
        let mut cfg = NaclgateConfig::default();
        cfg.auth.exclude_methods = vec!["OPTIONS".into(), "get".into()];
        assert!(cfg.validate().is_ok());

        cfg.auth.exclude_methods.push("bad method".into());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidExcludeMethod(m)) if m == "bad method"
        ));

        cfg.auth.exclude_methods = vec![String::new()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let mut auth = AuthConfig::default();
        assert_eq!(auth.channel_ttl(), Some(Duration::from_secs(3600)));
        auth.channel_ttl_secs = 0;
        assert_eq!(auth.channel_ttl(), None);
    }
}
