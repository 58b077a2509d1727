//! Configuration loading and management
//!
//! All configuration lives in one TOML file: the frontend listener, the
//! backend list (only the first entry is consumed), and the quota store
//! settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8119
}

// ARTICLE and STAT only: their replies are fully handled on the forward
// path. HEAD and BODY answer with multi-line 221/222 and stay opt-in.
fn default_allowed_commands() -> Vec<String> {
    vec!["article".to_string(), "stat".to_string()]
}

fn default_database_url() -> String {
    "sqlite://nntp-gate.db".to_string()
}

fn default_backend_conns() -> u32 {
    10
}

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub frontend: FrontendConfig,
    /// Backend NNTP servers; the proxy consumes the first entry
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Frontend listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrontendConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,
    /// Commands forwarded upstream; matched case-insensitively
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl FrontendConfig {
    /// Case-insensitive allow-list check for a command token
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.allowed_commands
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(command))
    }
}

/// Configuration for a single backend server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    /// Verify the backend certificate; most article providers front
    /// their farms with certificates that do not match, so this stays
    /// an explicit opt-in
    #[serde(default)]
    pub tls_verify_cert: bool,
    pub user: String,
    pub pass: String,
    /// Advisory connection count; the pool enforces its own cap
    #[serde(default = "default_backend_conns")]
    pub conns: u32,
}

/// Quota store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub password_scheme: PasswordScheme,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            password_scheme: PasswordScheme::default(),
        }
    }
}

/// How stored credentials are compared
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PasswordScheme {
    /// Stored value is the password itself; compared in constant time
    #[default]
    Plain,
    /// Stored value is an argon2 hash
    Argon2,
}

impl Config {
    /// Check cross-field requirements that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("no backends configured");
        }
        if self.frontend.tls_enabled
            && (self.frontend.tls_cert_path.is_none() || self.frontend.tls_key_path.is_none())
        {
            anyhow::bail!("frontend TLS requires tls_cert_path and tls_key_path");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(config_path: &str) -> Result<Config> {
    let config_content = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", config_path, e))?;

    let config: Config = toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", config_path, e))?;

    config.validate()?;
    Ok(config)
}

/// Create a default configuration for examples/testing
pub fn create_default_config() -> Config {
    Config {
        frontend: FrontendConfig {
            addr: default_addr(),
            port: default_port(),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            allowed_commands: default_allowed_commands(),
        },
        backends: vec![BackendConfig {
            name: "Example News Server".to_string(),
            addr: "news.example.com".to_string(),
            port: 119,
            tls_enabled: false,
            tls_verify_cert: false,
            user: "proxyuser".to_string(),
            pass: "proxypass".to_string(),
            conns: default_backend_conns(),
        }],
        store: StoreConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
[frontend]
addr = "127.0.0.1"
port = 1119
allowed_commands = ["article", "body"]

[[backend]]
name = "Primary"
addr = "news.example.com"
port = 563
tls_enabled = true
user = "u"
pass = "p"
conns = 20

[store]
database_url = "sqlite://test.db"
password_scheme = "argon2"
"#,
        );

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.frontend.addr, "127.0.0.1");
        assert_eq!(config.frontend.port, 1119);
        assert_eq!(config.backends.len(), 1);
        assert!(config.backends[0].tls_enabled);
        assert!(!config.backends[0].tls_verify_cert);
        assert_eq!(config.backends[0].conns, 20);
        assert_eq!(config.store.password_scheme, PasswordScheme::Argon2);
    }

    #[test]
    fn test_defaults_fill_in() {
        let file = write_config(
            r#"
[frontend]

[[backend]]
name = "Primary"
addr = "news.example.com"
port = 119
user = "u"
pass = "p"
"#,
        );

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.frontend.addr, "0.0.0.0");
        assert_eq!(config.frontend.port, 8119);
        assert!(!config.frontend.tls_enabled);
        assert_eq!(config.store.password_scheme, PasswordScheme::Plain);
        assert!(config.frontend.is_command_allowed("ARTICLE"));
    }

    #[test]
    fn test_load_config_nonexistent_file() {
        let result = load_config("/nonexistent/path/config.toml");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read config file"));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let file = write_config("invalid toml content [[[");
        let result = load_config(file.path().to_str().unwrap());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[test]
    fn test_no_backends_rejected() {
        let file = write_config("[frontend]\n");
        let result = load_config(file.path().to_str().unwrap());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no backends"));
    }

    #[test]
    fn test_frontend_tls_requires_cert_and_key() {
        let file = write_config(
            r#"
[frontend]
tls_enabled = true

[[backend]]
name = "Primary"
addr = "news.example.com"
port = 119
user = "u"
pass = "p"
"#,
        );
        let result = load_config(file.path().to_str().unwrap());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("tls_cert_path"));
    }

    #[test]
    fn test_multiple_backends_parse() {
        let file = write_config(
            r#"
[frontend]

[[backend]]
name = "Primary"
addr = "one.example.com"
port = 119
user = "u"
pass = "p"

[[backend]]
name = "Spare"
addr = "two.example.com"
port = 119
user = "u"
pass = "p"
"#,
        );
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].name, "Primary");
    }

    #[test]
    fn test_command_matching_is_case_insensitive() {
        let config = create_default_config();
        assert!(config.frontend.is_command_allowed("article"));
        assert!(config.frontend.is_command_allowed("Article"));
        assert!(config.frontend.is_command_allowed("STAT"));
        assert!(!config.frontend.is_command_allowed("post"));
        assert!(!config.frontend.is_command_allowed(""));
    }

    #[test]
    fn test_default_allow_list_is_conservative() {
        // HEAD and BODY are an explicit operator choice, not a default
        let config = create_default_config();
        assert!(!config.frontend.is_command_allowed("head"));
        assert!(!config.frontend.is_command_allowed("body"));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = create_default_config();
        let toml_string = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(deserialized, config);
    }
}
