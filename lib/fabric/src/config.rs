//! Configuration surface for the coordinator and client roles.
//!
//! The on-disk format is an INI-style TOML file with `[GENERAL]`, `[SERVER]`
//! and `[CLIENT]` sections. Every option carries a usable default; a missing
//! or malformed file is fatal at startup.

use crate::coordinator::MAX_CLIENTS;
use crate::result::{Error, Result};
use crate::{ClientId, PeriodId, DEFAULT_CLIENT_PORT, DEFAULT_SERVER_PORT};
use serde_derive::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub mode: Mode,
}

impl Default for GeneralConfig {
    fn default() -> GeneralConfig {
        GeneralConfig { mode: Mode::Server }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP port the coordinator listens on.
    pub server_port: u16,
    /// Destination port for grants when broadcast delivery is configured.
    pub client_port: u16,
    /// When set, grants are sent as a single datagram to this address instead
    /// of one unicast per registered client.
    pub broadcast_address: Option<Ipv4Addr>,
    /// Slice run-time authorized by every grant, in microseconds.
    pub barrier_interval: u32,
    /// Number of registered clients required before the first grant.
    pub min_clients: usize,
    /// Stop after reaching this period. 0 runs forever.
    pub max_period: PeriodId,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server_port: DEFAULT_SERVER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            broadcast_address: None,
            barrier_interval: 1000,
            min_clients: 1,
            max_period: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where Register/Finished/Unregister datagrams are sent.
    pub server_address: IpAddr,
    pub server_port: u16,
    /// Local bind address. Broadcast-capable when co-hosted clients share it.
    pub client_address: IpAddr,
    pub client_port: u16,
    pub client_id: ClientId,
    pub description: String,
    /// Seconds to wait for a run permission before resending the last
    /// datagram. 0 disables retransmission (pure blocking receive).
    pub recv_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            server_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: DEFAULT_SERVER_PORT,
            client_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port: DEFAULT_CLIENT_PORT,
            client_id: 13,
            description: String::from("simulation client"),
            recv_timeout: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "GENERAL", default)]
    pub general: GeneralConfig,
    #[serde(rename = "SERVER", default)]
    pub server: ServerConfig,
    #[serde(rename = "CLIENT", default)]
    pub client: ClientConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let config: Config = serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Config> {
        let config: Config =
            serdeconv::from_toml_str(toml).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.barrier_interval == 0 {
            return Err(Error::Config(String::from(
                "SERVER.barrier_interval must be greater than zero",
            )));
        }
        if self.server.min_clients == 0 {
            return Err(Error::Config(String::from(
                "SERVER.min_clients must be greater than zero",
            )));
        }
        if usize::from(self.client.client_id) >= MAX_CLIENTS {
            return Err(Error::Config(format!(
                "CLIENT.client_id must be below {}",
                MAX_CLIENTS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config.general.mode, Mode::Server);
        assert_eq!(config.server.server_port, 17543);
        assert_eq!(config.server.client_port, 17544);
        assert_eq!(config.server.broadcast_address, None);
        assert_eq!(config.server.barrier_interval, 1000);
        assert_eq!(config.server.min_clients, 1);
        assert_eq!(config.server.max_period, 0);
        assert_eq!(config.client.client_id, 13);
        assert_eq!(config.client.recv_timeout, 0);
    }

    #[test]
    fn test_sections_parse() {
        let config = Config::from_toml_str(
            r#"
            [GENERAL]
            mode = "client"

            [SERVER]
            server_port = 20001
            barrier_interval = 2500
            min_clients = 2
            max_period = 100
            broadcast_address = "192.168.1.255"

            [CLIENT]
            server_address = "192.168.1.1"
            client_id = 7
            description = "vm host"
            recv_timeout = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.general.mode, Mode::Client);
        assert_eq!(config.server.server_port, 20001);
        assert_eq!(config.server.barrier_interval, 2500);
        assert_eq!(config.server.min_clients, 2);
        assert_eq!(config.server.max_period, 100);
        assert_eq!(
            config.server.broadcast_address,
            Some("192.168.1.255".parse().unwrap())
        );
        assert_eq!(config.client.server_address, "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.client.client_id, 7);
        assert_eq!(config.client.description, "vm host");
        assert_eq!(config.client.recv_timeout, 3);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = Config::from_toml_str("[SERVER]\nbarrier_interval = 0\n");

        match result {
            Err(Error::Config(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_quorum() {
        let result = Config::from_toml_str("[SERVER]\nmin_clients = 0\n");

        match result {
            Err(Error::Config(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_rejects_client_id_out_of_range() {
        let toml = format!("[CLIENT]\nclient_id = {}\n", MAX_CLIENTS);
        let result = Config::from_toml_str(&toml);

        match result {
            Err(Error::Config(_)) => (),
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
