use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::chunked_cipher::{ChunkSize, RsaPadding};
use crate::integrity::DigestAlgorithm;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub certificate: CertificateDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    /// Echo request diagnostics in error bodies. Development only.
    #[serde(default)]
    pub debug: bool,
    /// Sessions unused this long are destroyed with their key material.
    #[serde(default = "default_session_idle")]
    pub session_idle_secs: u64,
    #[serde(default = "default_session_sweep")]
    pub session_sweep_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            endpoint: default_endpoint(),
            web_root: default_web_root(),
            tls_cert_path: None,
            tls_key_path: None,
            debug: false,
            session_idle_secs: default_session_idle(),
            session_sweep_secs: default_session_sweep(),
        }
    }
}

impl ServerConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn session_sweep(&self) -> Duration {
        Duration::from_secs(self.session_sweep_secs)
    }
}

fn default_session_idle() -> u64 {
    1800
}

fn default_session_sweep() -> u64 {
    60
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_endpoint() -> String {
    "/proxy".to_string()
}

fn default_web_root() -> PathBuf {
    PathBuf::from("web_root")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntegrityConfig {
    #[serde(default = "default_marker_header")]
    pub marker_header: String,
    #[serde(default = "default_marker_value")]
    pub marker_value: String,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    /// Token bound to every new session.
    #[serde(default = "default_app_token")]
    pub app_token: String,
    #[serde(default = "default_checksum_header")]
    pub checksum_header: String,
    #[serde(default)]
    pub digest: DigestAlgorithm,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            marker_header: default_marker_header(),
            marker_value: default_marker_value(),
            token_header: default_token_header(),
            app_token: default_app_token(),
            checksum_header: default_checksum_header(),
            digest: DigestAlgorithm::default(),
        }
    }
}

fn default_marker_header() -> String {
    "x-requested-with".to_string()
}

fn default_marker_value() -> String {
    "XMLHttpRequest".to_string()
}

fn default_token_header() -> String {
    "x-alt-referer".to_string()
}

fn default_app_token() -> String {
    "formseal".to_string()
}

fn default_checksum_header() -> String {
    "content-md5".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeyConfig {
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: u32,
    #[serde(default)]
    pub chunk_size: ChunkSize,
    #[serde(default)]
    pub padding: RsaPadding,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            rsa_bits: default_rsa_bits(),
            chunk_size: ChunkSize::default(),
            padding: RsaPadding::default(),
        }
    }
}

fn default_rsa_bits() -> u32 {
    2048
}

/// Distinguished name and validity used for session certificates.
#[derive(Debug, Deserialize, Clone)]
pub struct CertificateDefaults {
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_locality")]
    pub locality: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_organizational_unit")]
    pub organizational_unit: String,
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default = "default_email")]
    pub email: String,
    #[serde(default = "default_validity")]
    pub validity_days: u32,
    #[serde(default = "default_friendly_name")]
    pub friendly_name: String,
}

impl Default for CertificateDefaults {
    fn default() -> Self {
        Self {
            country: default_country(),
            state: default_state(),
            locality: default_locality(),
            organization: default_organization(),
            organizational_unit: default_organizational_unit(),
            common_name: default_common_name(),
            email: default_email(),
            validity_days: default_validity(),
            friendly_name: default_friendly_name(),
        }
    }
}

fn default_country() -> String {
    "US".to_string()
}

fn default_state() -> String {
    "Utah".to_string()
}

fn default_locality() -> String {
    "Salt Lake City".to_string()
}

fn default_organization() -> String {
    "formseal".to_string()
}

fn default_organizational_unit() -> String {
    "Encrypted form submission".to_string()
}

fn default_common_name() -> String {
    "formseal session".to_string()
}

fn default_email() -> String {
    "noreply@localhost".to_string()
}

fn default_validity() -> u32 {
    365
}

fn default_friendly_name() -> String {
    "formseal".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Startup validation of the recognized DN fields and key parameters.
    pub fn validate(&self) -> Result<()> {
        let dn = &self.certificate;
        let required = [
            ("country", &dn.country),
            ("state", &dn.state),
            ("locality", &dn.locality),
            ("organization", &dn.organization),
            ("organizational_unit", &dn.organizational_unit),
            ("common_name", &dn.common_name),
            ("email", &dn.email),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                bail!("certificate.{} must not be empty", name);
            }
        }
        if dn.country.len() != 2 || !dn.country.chars().all(|c| c.is_ascii_alphabetic()) {
            bail!("certificate.country must be a two-letter ISO code");
        }
        if dn.validity_days == 0 {
            bail!("certificate.validity_days must be positive");
        }
        if self.keys.rsa_bits < 1024 {
            bail!("keys.rsa_bits must be at least 1024");
        }
        if let ChunkSize::Fixed(0) = self.keys.chunk_size {
            bail!("keys.chunk_size must be positive");
        }
        if self.integrity.app_token.is_empty() {
            bail!("integrity.app_token must not be empty");
        }
        if self.server.session_idle_secs == 0 || self.server.session_sweep_secs == 0 {
            bail!("server.session_idle_secs and server.session_sweep_secs must be positive");
        }
        if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
            bail!("server.tls_cert_path and server.tls_key_path must be set together");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 8443
            debug = true

            [keys]
            rsa_bits = 4096
            chunk_size = "key-capacity"

            [integrity]
            digest = "md5"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8443);
        assert!(config.server.debug);
        assert_eq!(config.server.endpoint, "/proxy");
        assert_eq!(config.keys.rsa_bits, 4096);
        assert_eq!(config.keys.chunk_size, ChunkSize::KeyCapacity);
        assert_eq!(config.integrity.digest, DigestAlgorithm::Md5);
        assert_eq!(config.certificate.validity_days, 365);
        assert_eq!(config.server.session_idle(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_chunk_size_from_toml() {
        let config: AppConfig = toml::from_str("[keys]\nchunk_size = 64\n").unwrap();
        assert_eq!(config.keys.chunk_size, ChunkSize::Fixed(64));
    }

    #[test]
    fn test_empty_dn_field_rejected() {
        let mut config = AppConfig::default();
        config.certificate.locality = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("locality"));
    }

    #[test]
    fn test_bad_country_rejected() {
        let mut config = AppConfig::default();
        config.certificate.country = "USA".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_session_sweep_rejected() {
        let mut config = AppConfig::default();
        config.server.session_sweep_secs = 0;
        assert!(config.validate().is_err());
    }
}
