use super::cipher::{decode_frame, encode_frame, LENGTH_PREFIX_LEN};
use crate::sample::Fields;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_PORT: u16 = 9999;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);
pub const REALTIME_QUERY: &[u8] = br#"{"emeter":{"get_realtime":{}}}"#;
const MAX_RESPONSE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailure { addr: String, reason: String },
    #[error("undecodable plug response: {0}")]
    DecodeFailure(String),
}

/// Real-time energy meter values in SI-ish units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmeterReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy_total: f64,
    pub error_code: i64,
}

impl EmeterReading {
    pub fn fields(&self) -> Fields {
        Fields::from([
            ("voltage".to_string(), Some(self.voltage)),
            ("current".to_string(), Some(self.current)),
            ("power".to_string(), Some(self.power)),
            ("energy_total".to_string(), Some(self.energy_total)),
            ("error_code".to_string(), Some(self.error_code as f64)),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct RealtimeResponse {
    emeter: EmeterSection,
}

#[derive(Debug, Deserialize)]
struct EmeterSection {
    get_realtime: RawRealtime,
}

#[derive(Debug, Deserialize)]
struct RawRealtime {
    voltage_mv: f64,
    current_ma: f64,
    power_mw: f64,
    total_wh: f64,
    err_code: i64,
}

/// Parses a decrypted `get_realtime` payload and converts mV/mA/mW/Wh to
/// V/A/W/kWh.
pub fn parse_realtime(payload: &[u8]) -> Result<EmeterReading, ProtocolError> {
    let response: RealtimeResponse = serde_json::from_slice(payload)
        .map_err(|err| ProtocolError::DecodeFailure(err.to_string()))?;
    let raw = response.emeter.get_realtime;
    Ok(EmeterReading {
        voltage: raw.voltage_mv / 1000.0,
        current: raw.current_ma / 1000.0,
        power: raw.power_mw / 1000.0,
        energy_total: raw.total_wh / 1000.0,
        error_code: raw.err_code,
    })
}

/// Decodes a complete response frame as received from the plug.
pub fn decode_response(frame: &[u8]) -> Result<EmeterReading, ProtocolError> {
    let payload = decode_frame(frame).ok_or_else(|| {
        ProtocolError::DecodeFailure(format!("frame of {} bytes has no length prefix", frame.len()))
    })?;
    parse_realtime(&payload)
}

/// One request/response exchange per call, each over a fresh connection.
#[derive(Debug, Clone)]
pub struct TpLinkClient {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TpLinkClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host.trim(), port),
            connect_timeout: CONNECT_TIMEOUT,
            io_timeout: IO_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, io_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.io_timeout = io_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn realtime(&self) -> Result<EmeterReading, ProtocolError> {
        let frame = self.exchange(REALTIME_QUERY).await?;
        decode_response(&frame)
    }

    /// Sends `payload` framed and encrypted; returns the raw response frame
    /// including its length prefix.
    pub async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(self.connection_failure(err.to_string())),
            Err(_) => {
                return Err(self.connection_failure(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };

        match timeout(self.io_timeout, round_trip(&mut stream, payload)).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(ExchangeError::Io(err))) => Err(self.connection_failure(err.to_string())),
            Ok(Err(ExchangeError::Malformed(reason))) => Err(ProtocolError::DecodeFailure(reason)),
            Err(_) => Err(self.connection_failure(format!(
                "no response within {:?}",
                self.io_timeout
            ))),
        }
    }

    fn connection_failure(&self, reason: String) -> ProtocolError {
        ProtocolError::ConnectionFailure {
            addr: self.addr.clone(),
            reason,
        }
    }
}

enum ExchangeError {
    Io(io::Error),
    Malformed(String),
}

impl From<io::Error> for ExchangeError {
    fn from(err: io::Error) -> Self {
        ExchangeError::Io(err)
    }
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    stream.write_all(&encode_frame(payload)).await?;
    stream.flush().await?;

    let mut header = [0u8; LENGTH_PREFIX_LEN];
    if let Err(err) = stream.read_exact(&mut header).await {
        return Err(truncated_or_io(err, "response ended inside the length prefix"));
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_RESPONSE_LEN {
        return Err(ExchangeError::Malformed(format!(
            "declared response length {len} exceeds {MAX_RESPONSE_LEN}"
        )));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + len);
    frame.extend_from_slice(&header);
    frame.resize(LENGTH_PREFIX_LEN + len, 0);
    if let Err(err) = stream.read_exact(&mut frame[LENGTH_PREFIX_LEN..]).await {
        return Err(truncated_or_io(err, "response shorter than its length prefix"));
    }
    let _ = stream.shutdown().await;
    Ok(frame)
}

fn truncated_or_io(err: io::Error, context: &str) -> ExchangeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ExchangeError::Malformed(context.to_string())
    } else {
        ExchangeError::Io(err)
    }
}
