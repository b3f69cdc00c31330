use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, warn};

use crate::types::TimeReading;

pub const NTP_PACKET_LEN: usize = 48;
/// Seconds between the NTP era (1900) and the Unix epoch.
pub const NTP_DELTA: i64 = 2_208_988_800;
const TRANSMIT_SECONDS_OFFSET: usize = 40;
/// LI = 0, version 3, mode 3 (client).
const CLIENT_MODE_HEADER: u8 = 0x1b;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time server unreachable: {0}")]
    Io(#[from] std::io::Error),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("response too short ({0} bytes)")]
    ShortResponse(usize),
    #[error("timestamp {0} out of range")]
    OutOfRange(u32),
}

/// One attempt at reading network time.
pub trait TimeQuery {
    async fn query(&self) -> Result<DateTime<Utc>, ClockError>;
}

pub fn request_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = CLIENT_MODE_HEADER;
    packet
}

pub fn decode_response(packet: &[u8]) -> Result<DateTime<Utc>, ClockError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(ClockError::ShortResponse(packet.len()));
    }
    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&packet[TRANSMIT_SECONDS_OFFSET..TRANSMIT_SECONDS_OFFSET + 4]);
    let ntp_seconds = u32::from_be_bytes(seconds);
    DateTime::from_timestamp(i64::from(ntp_seconds) - NTP_DELTA, 0)
        .ok_or(ClockError::OutOfRange(ntp_seconds))
}

/// SNTP client over a fresh UDP socket per query.
pub struct NtpClient {
    server: String,
    timeout: Duration,
}

impl NtpClient {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

impl TimeQuery for NtpClient {
    async fn query(&self) -> Result<DateTime<Utc>, ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.server).await?;
        socket.send(&request_packet()).await?;

        let mut buf = [0u8; NTP_PACKET_LEN];
        let len = time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ClockError::Timeout(self.timeout))??;
        decode_response(&buf[..len])
    }
}

pub struct ClockSource<Q> {
    query: Q,
    backoff: Duration,
}

impl<Q: TimeQuery> ClockSource<Q> {
    pub fn new(query: Q, backoff: Duration) -> Self {
        Self { query, backoff }
    }

    /// Network time if any of `retries` attempts answers, local device time otherwise.
    ///
    /// Never fails; callers check [`TimeReading::is_degraded`] if they care.
    pub async fn resolve_time(&self, retries: u32) -> TimeReading {
        for attempt in 1..=retries {
            match self.query.query().await {
                Ok(at) => {
                    debug!(attempt, %at, "Network time resolved");
                    return TimeReading::network(at);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to get network time");
                    if attempt < retries {
                        time::sleep(self.backoff).await;
                    }
                }
            }
        }
        warn!(retries, "Failed to get network time after retries, using device time");
        TimeReading::local_now()
    }
}
