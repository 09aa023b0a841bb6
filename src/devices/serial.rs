//! Serial device endpoint.
//!
//! Commands:
//! - `connect` `{ device | port, baud? }`
//! - `disconnect` `{ device | port }`, or neither to close every link
//! - `send_hex` `{ hex | data, device | port, flush?, read_len?, read_until?, max_bytes? }`
//!
//! Sends are fire-and-optionally-read; nothing here tracks completion.
//! Port I/O is blocking and runs on the blocking pool, one command at a
//! time.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::LinkError;
use crate::config::SerialConfig;
use crate::message::{Request, Response};
use crate::worker::CommandHandler;

/// Default `max_bytes` for `read_until`, and the cap on any read-back size.
pub const DEFAULT_MAX_BYTES: usize = 4096;

pub mod msg {
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const DISCONNECTED_ALL: &str = "disconnected_all";
    pub const SENT: &str = "sent";
    pub const FAILED: &str = "failed";
    pub const MISSING_PORT: &str = "Missing port/device";
    pub const MISSING_TARGET: &str = "Missing device/port";
    pub const MISSING_HEX: &str = "Missing hex";
    pub const INVALID_HEX: &str = "Invalid hex";
    pub const UNKNOWN_COMMAND: &str = "Unknown command";
}

// ============================================================================
// Link
// ============================================================================

/// An open serial port. Calls block.
pub trait SerialLink: Send {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Discard pending input.
    fn clear_input(&mut self) -> std::io::Result<()>;

    /// Read up to `n` bytes; fewer when the port's read timeout expires.
    fn read(&mut self, n: usize) -> std::io::Result<Vec<u8>>;

    /// Read until the buffer ends with `pattern`, `max_bytes` were read, or
    /// a read comes back empty.
    fn read_until(&mut self, pattern: &[u8], max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        if pattern.is_empty() {
            return Ok(buffer);
        }
        while buffer.len() < max_bytes {
            let chunk = self.read(1)?;
            if chunk.is_empty() {
                break;
            }
            buffer.extend_from_slice(&chunk);
            if buffer.ends_with(pattern) {
                break;
            }
        }
        Ok(buffer)
    }

    fn close(&mut self) {}
}

/// Opens serial links. Blocking.
pub trait SerialOpener: Send + Sync {
    fn open(&self, port: &str, baud: u32, timeout: Duration)
        -> Result<Box<dyn SerialLink>, LinkError>;
}

impl<F> SerialOpener for F
where
    F: Fn(&str, u32, Duration) -> Result<Box<dyn SerialLink>, LinkError> + Send + Sync,
{
    fn open(
        &self,
        port: &str,
        baud: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, LinkError> {
        self(port, baud, timeout)
    }
}

/// Link that echoes every written byte back as input.
#[derive(Debug, Default)]
pub struct LoopbackSerial {
    pending: VecDeque<u8>,
}

impl SerialLink for LoopbackSerial {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.pending.extend(bytes);
        Ok(())
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn read(&mut self, n: usize) -> std::io::Result<Vec<u8>> {
        let take = n.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }
}

/// Opener producing [`LoopbackSerial`] links for any non-empty port name.
pub fn loopback_opener() -> Arc<dyn SerialOpener> {
    Arc::new(
        |port: &str, baud: u32, _timeout: Duration| -> Result<Box<dyn SerialLink>, LinkError> {
            if port.trim().is_empty() {
                return Err(LinkError::InvalidArgument("empty port".into()));
            }
            debug!(port, baud, "Opened loopback serial link");
            Ok(Box::new(LoopbackSerial::default()))
        },
    )
}

// ============================================================================
// Hex helpers
// ============================================================================

/// Strip separators and `0x` prefixes, left-padding odd lengths with `0`.
pub fn clean_hex(raw: &str) -> String {
    let cleaned: String = raw
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .collect();
    if cleaned.len() % 2 == 1 {
        format!("0{cleaned}")
    } else {
        cleaned
    }
}

pub fn parse_hex(raw: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(clean_hex(raw))
}

/// Upper-case, space-separated: `[0xaa, 0x05]` -> `"AA 05"`.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Handler
// ============================================================================

/// Command handler owning a pool of serial links keyed by device name or
/// port.
pub struct SerialHandler {
    opener: Arc<dyn SerialOpener>,
    config: SerialConfig,
    pool: BTreeMap<String, Box<dyn SerialLink>>,
}

impl SerialHandler {
    pub fn new(opener: Arc<dyn SerialOpener>, config: SerialConfig) -> Self {
        Self {
            opener,
            config,
            pool: BTreeMap::new(),
        }
    }

    /// Names of open links.
    pub fn connected(&self) -> Vec<String> {
        self.pool.keys().cloned().collect()
    }

    /// Port and baud for a request, from its own fields or the device table.
    fn resolve_port(&self, request: &Request) -> Option<(String, u32)> {
        let requested_baud = request
            .u64_field("baud")
            .and_then(|b| u32::try_from(b).ok());
        if let Some(port) = request.str_field("port") {
            return Some((
                port.to_string(),
                requested_baud.unwrap_or(self.config.default_baud),
            ));
        }
        let device = self.config.devices.get(request.str_field("device")?)?;
        if device.port.is_empty() {
            return None;
        }
        Some((
            device.port.clone(),
            requested_baud
                .or(device.baud)
                .unwrap_or(self.config.default_baud),
        ))
    }

    fn pool_key(request: &Request) -> Option<String> {
        request
            .str_field("device")
            .or_else(|| request.str_field("port"))
            .map(str::to_string)
    }

    /// Open `port` on the blocking pool. The returned future owns what it
    /// needs and does not borrow the handler.
    fn open(
        &self,
        port: String,
        baud: u32,
    ) -> impl Future<Output = Result<Box<dyn SerialLink>, LinkError>> + Send + 'static {
        let opener = self.opener.clone();
        let timeout = self.config.default_timeout();
        async move {
            match tokio::task::spawn_blocking(move || opener.open(&port, baud, timeout)).await {
                Ok(opened) => opened,
                Err(e) => Err(LinkError::call("open", e.to_string())),
            }
        }
    }

    async fn connect(&mut self, request: &Request) -> Response {
        let (Some(key), Some((port, baud))) = (Self::pool_key(request), self.resolve_port(request))
        else {
            return Response::reply(request, false, msg::MISSING_PORT);
        };

        if let Some(mut old) = self.pool.remove(&key) {
            old.close();
        }
        match self.open(port.clone(), baud).await {
            Ok(link) => {
                info!(device = %key, %port, baud, "Serial link connected");
                self.pool.insert(key, link);
                Response::reply(request, true, msg::CONNECTED)
            }
            Err(e) => {
                warn!(device = %key, %port, error = %e, "Serial open failed");
                Response::reply(request, false, msg::FAILED).with_extra("detail", e.to_string())
            }
        }
    }

    fn disconnect(&mut self, request: &Request) -> Response {
        match Self::pool_key(request) {
            Some(key) => {
                if let Some(mut link) = self.pool.remove(&key) {
                    link.close();
                    info!(device = %key, "Serial link closed");
                }
                Response::reply(request, true, msg::DISCONNECTED)
            }
            None => {
                for (key, mut link) in std::mem::take(&mut self.pool) {
                    link.close();
                    info!(device = %key, "Serial link closed");
                }
                Response::reply(request, true, msg::DISCONNECTED_ALL)
            }
        }
    }

    async fn send_hex(&mut self, request: &Request) -> Response {
        let Some(raw) = request.str_field("hex").or_else(|| request.str_field("data")) else {
            return Response::reply(request, false, msg::MISSING_HEX);
        };
        let Some(key) = Self::pool_key(request) else {
            return Response::reply(request, false, msg::MISSING_TARGET);
        };
        let bytes = match parse_hex(raw) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Response::reply(request, false, msg::INVALID_HEX)
                    .with_extra("detail", e.to_string())
            }
        };
        let read_back = match ReadBack::from_request(request) {
            Ok(read_back) => read_back,
            Err(e) => {
                return Response::reply(request, false, msg::INVALID_HEX)
                    .with_extra("field", "read_until")
                    .with_extra("detail", e.to_string())
            }
        };

        let link = match self.pool.remove(&key) {
            Some(link) => link,
            None => {
                let Some((port, baud)) = self.resolve_port(request) else {
                    return Response::reply(request, false, msg::MISSING_PORT);
                };
                match self.open(port, baud).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(device = %key, error = %e, "Serial auto-connect failed");
                        return Response::reply(request, false, msg::FAILED)
                            .with_extra("detail", e.to_string());
                    }
                }
            }
        };

        let flush = request.bool_field("flush").unwrap_or(false);
        let exchange = tokio::task::spawn_blocking(move || {
            let mut link = link;
            let result = transfer(link.as_mut(), &bytes, flush, &read_back);
            (link, result)
        })
        .await;

        match exchange {
            Ok((link, result)) => {
                self.pool.insert(key.clone(), link);
                match result {
                    Ok(received) => {
                        debug!(device = %key, sent = raw, received = received.len(), "Sent hex");
                        let response = Response::reply(request, true, msg::SENT);
                        if received.is_empty() {
                            response
                        } else {
                            response.with_extra("received", format_hex(&received))
                        }
                    }
                    Err(e) => {
                        warn!(device = %key, error = %e, "Serial transfer failed");
                        Response::reply(request, false, msg::FAILED)
                            .with_extra("detail", e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!(device = %key, error = %e, "Serial transfer task failed, link dropped");
                Response::reply(request, false, msg::FAILED).with_extra("detail", e.to_string())
            }
        }
    }
}

/// What to read after a send.
#[derive(Debug, Clone, PartialEq)]
enum ReadBack {
    None,
    Exactly(usize),
    Until { pattern: Vec<u8>, max_bytes: usize },
}

impl ReadBack {
    /// Sizes are capped at [`DEFAULT_MAX_BYTES`]. A `read_until` pattern
    /// that is not valid hex is an error.
    fn from_request(request: &Request) -> Result<Self, hex::FromHexError> {
        if let Some(n) = request.u64_field("read_len").filter(|n| *n > 0) {
            return Ok(Self::Exactly(capped(n)));
        }
        let pattern = match request.payload.get("read_until") {
            Some(Value::String(raw)) if !raw.trim().is_empty() => parse_hex(raw)?,
            _ => return Ok(Self::None),
        };
        let max_bytes = request
            .u64_field("max_bytes")
            .filter(|n| *n > 0)
            .map_or(DEFAULT_MAX_BYTES, capped);
        Ok(Self::Until { pattern, max_bytes })
    }
}

fn capped(n: u64) -> usize {
    usize::try_from(n).map_or(DEFAULT_MAX_BYTES, |n| n.min(DEFAULT_MAX_BYTES))
}

fn transfer(
    link: &mut dyn SerialLink,
    bytes: &[u8],
    flush: bool,
    read_back: &ReadBack,
) -> std::io::Result<Vec<u8>> {
    if flush {
        link.clear_input()?;
    }
    link.write(bytes)?;
    match read_back {
        ReadBack::None => Ok(Vec::new()),
        ReadBack::Exactly(n) => link.read(*n),
        ReadBack::Until { pattern, max_bytes } => link.read_until(pattern, *max_bytes),
    }
}

#[async_trait]
impl CommandHandler for SerialHandler {
    async fn handle(&mut self, request: Request) -> Response {
        match request.command_type().as_str() {
            "connect" => self.connect(&request).await,
            "disconnect" => self.disconnect(&request),
            "send_hex" => self.send_hex(&request).await,
            _ => Response::reply(&request, false, msg::UNKNOWN_COMMAND),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialDeviceConfig;
    use crate::message::Target;
    use serde_json::json;

    fn request(body: Value) -> Request {
        Request::new("c-1", Target::new("iot"), body.as_object().cloned().unwrap())
    }

    fn handler() -> SerialHandler {
        let mut config = SerialConfig::default();
        config.devices.insert(
            "IceMake".to_string(),
            SerialDeviceConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud: Some(9600),
            },
        );
        SerialHandler::new(loopback_opener(), config)
    }

    #[test]
    fn test_clean_hex() {
        assert_eq!(clean_hex("0xAA 0x55"), "AA55");
        assert_eq!(clean_hex("a-b_c"), "0abc");
        assert_eq!(parse_hex("AA 5").unwrap(), vec![0x0a, 0xa5]);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xaa, 0x05, 0xff]), "AA 05 FF");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_read_until_stops_at_pattern() {
        let mut link = LoopbackSerial::default();
        link.write(&[1, 2, 0xaa, 0x55, 3]).unwrap();
        assert_eq!(link.read_until(&[0xaa, 0x55], 4096).unwrap(), vec![1, 2, 0xaa, 0x55]);
        assert_eq!(link.read_until(&[0xaa], 4096).unwrap(), vec![3]);
        link.write(&[9; 10]).unwrap();
        assert_eq!(link.read_until(&[0xaa], 4).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_connect_by_device_and_port() {
        let mut serial = handler();

        let response = serial
            .handle(request(json!({ "command": "connect", "device": "IceMake" })))
            .await;
        assert!(response.ok);
        assert_eq!(response.message, "connected");

        let response = serial
            .handle(request(json!({ "type": "connect", "port": "COM7", "baud": 57600 })))
            .await;
        assert!(response.ok);
        assert_eq!(serial.connected(), vec!["COM7", "IceMake"]);

        let response = serial
            .handle(request(json!({ "type": "connect", "device": "Unknown" })))
            .await;
        assert_eq!(response.message, "Missing port/device");
    }

    #[tokio::test]
    async fn test_send_hex_auto_connects_and_reads_back() {
        let mut serial = handler();

        let response = serial
            .handle(request(json!({
                "type": "send_hex",
                "device": "IceMake",
                "hex": "0xAA 0x55 01",
                "read_len": 2
            })))
            .await;

        assert!(response.ok, "{response:?}");
        assert_eq!(response.message, "sent");
        assert_eq!(response.extra["received"], "AA 55");
        assert_eq!(serial.connected(), vec!["IceMake"]);

        // One byte left over from the echo; flush discards it.
        let response = serial
            .handle(request(json!({
                "type": "send_hex",
                "device": "IceMake",
                "data": "10 20 30",
                "flush": true,
                "read_until": "20"
            })))
            .await;
        assert_eq!(response.extra["received"], "10 20");
    }

    #[tokio::test]
    async fn test_send_hex_without_read_has_no_received() {
        let mut serial = handler();
        let response = serial
            .handle(request(json!({ "type": "send_hex", "port": "COM3", "hex": "01" })))
            .await;
        assert!(response.ok);
        assert!(!response.extra.contains_key("received"));
    }

    #[tokio::test]
    async fn test_send_hex_validation() {
        let mut serial = handler();
        let response = serial
            .handle(request(json!({ "type": "send_hex", "device": "IceMake" })))
            .await;
        assert_eq!(response.message, "Missing hex");

        let response = serial
            .handle(request(json!({ "type": "send_hex", "hex": "01" })))
            .await;
        assert_eq!(response.message, "Missing device/port");

        let response = serial
            .handle(request(json!({ "type": "send_hex", "device": "Ghost", "hex": "01" })))
            .await;
        assert_eq!(response.message, "Missing port/device");

        let response = serial
            .handle(request(json!({ "type": "send_hex", "port": "COM1", "hex": "GG" })))
            .await;
        assert_eq!(response.message, "Invalid hex");
    }

    #[tokio::test]
    async fn test_bad_read_until_is_invalid_hex() {
        let mut serial = handler();
        let response = serial
            .handle(request(json!({
                "type": "send_hex",
                "port": "COM1",
                "hex": "01",
                "read_until": "zz"
            })))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "Invalid hex");
        assert_eq!(response.extra["field"], "read_until");
        // Rejected before the port was opened.
        assert!(serial.connected().is_empty());
    }

    #[test]
    fn test_read_back_sizes_are_capped() {
        let read_back = |body: Value| ReadBack::from_request(&request(body)).unwrap();

        assert_eq!(
            read_back(json!({ "read_len": u64::MAX })),
            ReadBack::Exactly(DEFAULT_MAX_BYTES)
        );
        assert_eq!(read_back(json!({ "read_len": 3 })), ReadBack::Exactly(3));
        assert_eq!(
            read_back(json!({ "read_until": "0d0a", "max_bytes": 1_000_000_000u64 })),
            ReadBack::Until { pattern: vec![0x0d, 0x0a], max_bytes: DEFAULT_MAX_BYTES }
        );
        assert_eq!(
            read_back(json!({ "read_until": "0d", "max_bytes": 0 })),
            ReadBack::Until { pattern: vec![0x0d], max_bytes: DEFAULT_MAX_BYTES }
        );
        assert_eq!(read_back(json!({ "read_until": "" })), ReadBack::None);
        assert_eq!(read_back(json!({})), ReadBack::None);
    }

    #[tokio::test]
    async fn test_handler_runs_on_spawned_task() {
        let mut serial = handler();
        let response = tokio::spawn(async move {
            serial
                .handle(request(json!({ "type": "connect", "port": "COM4" })))
                .await
        })
        .await
        .unwrap();

        assert!(response.ok);
        assert_eq!(response.message, "connected");
    }

    #[tokio::test]
    async fn test_failed_open() {
        let opener: Arc<dyn SerialOpener> = Arc::new(
            |port: &str, _baud: u32, _timeout: Duration| -> Result<Box<dyn SerialLink>, LinkError> {
                Err(LinkError::call("open", format!("no such port {port}")))
            },
        );
        let mut serial = SerialHandler::new(opener, SerialConfig::default());

        let response = serial
            .handle(request(json!({ "type": "connect", "port": "COM9" })))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "failed");
        assert!(serial.connected().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_one_and_all() {
        let mut serial = handler();
        for port in ["COM1", "COM2", "COM3"] {
            serial
                .handle(request(json!({ "type": "connect", "port": port })))
                .await;
        }

        let response = serial
            .handle(request(json!({ "type": "disconnect", "port": "COM2" })))
            .await;
        assert_eq!(response.message, "disconnected");
        assert_eq!(serial.connected(), vec!["COM1", "COM3"]);

        let response = serial.handle(request(json!({ "type": "disconnect" }))).await;
        assert_eq!(response.message, "disconnected_all");
        assert!(serial.connected().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut serial = handler();
        let response = serial.handle(request(json!({ "type": "reboot" }))).await;
        assert_eq!(response.message, "Unknown command");
    }
}
