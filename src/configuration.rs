//! Gateway runtime configuration.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Representation of the configuration file consumed by the gateway.
///
/// ```toml
/// [rpc]
/// listen_ip = "0.0.0.0"
/// listen_port = 20200
/// thread_count = 8
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GatewayConfig {
	pub rpc: RpcSection,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RpcSection {
	/// Listen address of the HTTP/WebSocket server. (default: "0.0.0.0")
	pub listen_ip: String,
	/// Listen port; must be in (1024, 65535]. (default: 20200)
	pub listen_port: u16,
	/// Size of the worker pool driving session callbacks and request handlers. (default: 8)
	pub thread_count: usize,
}

impl Default for RpcSection {
	fn default() -> Self {
		RpcSection {
			listen_ip: "0.0.0.0".to_string(),
			listen_port: 20200,
			thread_count: 8,
		}
	}
}

impl GatewayConfig {
	/// Loads and validates the configuration; an invalid listen port is a
	/// fatal start-up error carried as an error value.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let config: GatewayConfig = confy::load_path(path.as_ref())
			.map_err(|error| eyre!("failed to load configuration from {:?}: {error}", path.as_ref()))?;
		config.validate()?;
		info!(
			listen_ip = config.rpc.listen_ip,
			listen_port = config.rpc.listen_port,
			thread_count = config.rpc.thread_count,
			"Configuration loaded"
		);
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.rpc.listen_port <= 1024 {
			return Err(eyre!(
				"invalid rpc listen port, port={}",
				self.rpc.listen_port
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test]
	fn defaults() {
		let config = GatewayConfig::default();
		assert_eq!(config.rpc.listen_ip, "0.0.0.0");
		assert_eq!(config.rpc.listen_port, 20200);
		assert_eq!(config.rpc.thread_count, 8);
		assert!(config.validate().is_ok());
	}

	#[test_case(0 ; "port zero")]
	#[test_case(1024 ; "privileged boundary")]
	fn invalid_port_is_fatal(port: u16) {
		let mut config = GatewayConfig::default();
		config.rpc.listen_port = port;
		assert!(config.validate().is_err());
	}

	#[test]
	fn upper_boundary_port_is_valid() {
		let mut config = GatewayConfig::default();
		config.rpc.listen_port = 65535;
		assert!(config.validate().is_ok());
	}

	#[test]
	fn load_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("gateway.toml");
		std::fs::write(
			&path,
			"[rpc]\nlisten_ip = \"127.0.0.1\"\nlisten_port = 30300\nthread_count = 4\n",
		)
		.unwrap();

		let config = GatewayConfig::load(&path).unwrap();
		assert_eq!(config.rpc.listen_ip, "127.0.0.1");
		assert_eq!(config.rpc.listen_port, 30300);
		assert_eq!(config.rpc.thread_count, 4);
	}

	#[test]
	fn load_rejects_invalid_port() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("gateway.toml");
		std::fs::write(&path, "[rpc]\nlisten_port = 80\n").unwrap();
		assert!(GatewayConfig::load(&path).is_err());
	}
}
