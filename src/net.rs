use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no route to {0} within the probe timeout")]
    Timeout(String),
    #[error("cannot derive a probe address from {0}")]
    BadUrl(String),
}

/// The node's uplink. Association mechanics live behind `try_connect`.
pub trait Link {
    async fn try_connect(&mut self) -> Result<(), LinkError>;
}

/// Uplink of a host-run node: "associated" once the store host accepts TCP.
pub struct HostLink {
    ssid: String,
    probe_addr: String,
    probe_timeout: Duration,
}

impl HostLink {
    pub fn from_config(config: &Config) -> Result<Self, LinkError> {
        let url =
            Url::parse(&config.api_url).map_err(|_| LinkError::BadUrl(config.api_url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| LinkError::BadUrl(config.api_url.clone()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| LinkError::BadUrl(config.api_url.clone()))?;

        debug!(ssid = %config.ssid, secured = !config.password.is_empty(), "Uplink configured");
        Ok(Self {
            ssid: config.ssid.clone(),
            probe_addr: format!("{host}:{port}"),
            probe_timeout: Duration::from_secs(2),
        })
    }

    #[cfg(test)]
    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }
}

impl Link for HostLink {
    async fn try_connect(&mut self) -> Result<(), LinkError> {
        debug!(ssid = %self.ssid, addr = %self.probe_addr, "Probing uplink");
        match time::timeout(self.probe_timeout, TcpStream::connect(&self.probe_addr)).await {
            Ok(Ok(_stream)) => {
                info!(ssid = %self.ssid, "Uplink connected");
                Ok(())
            }
            Ok(Err(source)) => Err(LinkError::Unreachable {
                addr: self.probe_addr.clone(),
                source,
            }),
            Err(_) => Err(LinkError::Timeout(self.probe_addr.clone())),
        }
    }
}
