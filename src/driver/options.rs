//! Connection options.
//!
//! Built in code with the builder methods, or loaded from TOML:
//!
//! ```toml
//! database = "default"
//! user = "default"
//! compression = "lz4"
//! read_timeout = 30000   # milliseconds
//!
//! [limits]
//! max_rows = 1000000
//!
//! [tls]
//! ca_file = "/etc/ssl/ca.pem"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::protocol::block::DecodeLimits;
use crate::protocol::compress::Method;
use crate::protocol::feature::CLIENT_REVISION;

/// Block compression for data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Disabled,
    /// Framed, but stored uncompressed.
    None,
    Lz4,
    Lz4hc,
    Zstd,
}

impl Compression {
    /// Frame method, or `None` when blocks are sent unframed.
    pub fn method(self) -> Option<Method> {
        match self {
            Compression::Disabled => None,
            Compression::None => Some(Method::None),
            Compression::Lz4 => Some(Method::Lz4),
            Compression::Lz4hc => Some(Method::Lz4Hc),
            Compression::Zstd => Some(Method::Zstd),
        }
    }
}

/// TLS settings. PEM contents, not paths.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// Trusted roots; the system store when `None`.
    pub ca_cert_pem: Option<Vec<u8>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    /// Name checked against the server certificate. Defaults to the host.
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_pem", &self.ca_cert_pem.is_some())
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsConfig {
    pub fn from_files(files: &TlsFiles) -> std::io::Result<Self> {
        let read = |p: &Option<PathBuf>| p.as_ref().map(std::fs::read).transpose();
        Ok(Self {
            ca_cert_pem: read(&files.ca_file)?,
            client_cert_pem: read(&files.cert_file)?,
            client_key_pem: read(&files.key_file)?,
            server_name: files.server_name.clone(),
        })
    }
}

/// `[tls]` table of a TOML config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub server_name: Option<String>,
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

/// Client connection options. Zero timeouts disable the deadline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub database: String,
    pub user: String,
    pub password: String,
    pub quota_key: String,
    pub client_name: String,
    /// Revision announced in the handshake.
    pub revision: u64,
    pub compression: Compression,
    pub compression_level: i32,
    /// Verify frame checksums on decode.
    pub verify_checksum: bool,
    #[serde(deserialize_with = "millis")]
    pub dial_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub read_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub write_timeout: Duration,
    pub limits: DecodeLimits,
    #[serde(skip)]
    pub tls: Option<TlsConfig>,
    #[serde(rename = "tls")]
    tls_files: Option<TlsFiles>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            quota_key: String::new(),
            client_name: "ch-native".to_string(),
            revision: CLIENT_REVISION,
            compression: Compression::Disabled,
            compression_level: 0,
            verify_checksum: true,
            dial_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            limits: DecodeLimits::default(),
            tls: None,
            tls_files: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML. Durations are milliseconds; `[tls]` paths are read here.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut opts: Options =
            toml::from_str(s).map_err(|e| Error::InvalidInput(format!("config: {}", e)))?;
        if let Some(files) = opts.tls_files.take() {
            opts.tls = Some(TlsConfig::from_files(&files)?);
        }
        Ok(opts)
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn quota_key(mut self, key: impl Into<String>) -> Self {
        self.quota_key = key.into();
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Announce a different protocol revision.
    pub fn revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Level for LZ4HC and ZSTD; ignored by the other methods.
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}
