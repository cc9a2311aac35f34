use error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub identity: IdentityConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    pub stream_receive_window: usize,
    pub max_stream_bytes_in_flight: usize,
    pub msg_receive_window: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Hex-encoded X25519 static private key; a fresh one is generated
    /// into the default config.
    pub private_key: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { address: "0.0.0.0:32017".to_string() }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stream_receive_window: 1 << 20,
            max_stream_bytes_in_flight: 1 << 19,
            msg_receive_window: 1 << 16,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { private_key: hex::encode(rand::random::<[u8; 32]>()) }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            transport: TransportConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.network.address).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid network address '{}', expected IP:PORT",
                self.network.address
            )));
        }

        if self.transport.stream_receive_window == 0 {
            return Err(ConfigError::Validation(
                "stream receive window must be non-zero".to_string(),
            ));
        }

        if self.transport.max_stream_bytes_in_flight == 0 {
            return Err(ConfigError::Validation(
                "max stream bytes in flight must be non-zero".to_string(),
            ));
        }

        if self.private_key().is_none() {
            return Err(ConfigError::Validation(
                "private key must be 64 hex characters".to_string(),
            ));
        }

        Ok(())
    }

    pub fn private_key(&self) -> Option<lazurite::PrivateKey> {
        let bytes = hex::decode(&self.identity.private_key).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(lazurite::PrivateKey::from_bytes(bytes))
    }

    /// The transport config this file describes.
    pub fn transport_config(&self, listen: bool) -> lazurite::Config {
        lazurite::Config {
            stream_receive_window: self.transport.stream_receive_window,
            max_stream_bytes_in_flight: self.transport.max_stream_bytes_in_flight,
            private_key: self.private_key().expect("validated"),
            listen,
        }
    }
}

pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn bad_address_rejected() {
        let mut config = Config::default();
        config.network.address = "not an address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bad_key_rejected() {
        let mut config = Config::default();
        config.identity.private_key = "abcdef".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.identity.private_key, config.identity.private_key);
    }
}
