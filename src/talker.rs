use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::config::DeviceConfig;
use crate::error::TransportError;

/// Devices end every reply line with a carriage return
const TERMINATOR: u8 = b'\r';
/// Appended to every outgoing command
const FRAME_SUFFIX: &str = "\r\x0c";
/// MicroPython REPL prompt prefixed to echoed commands
const PROMPT: &str = ">>> ";
/// `clear_buffer` stops draining once the link has been quiet this long
const DRAIN_QUIET: Duration = Duration::from_millis(10);

/// Byte stream a talker can drive
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// Line-oriented command channel to one microcontroller
///
/// Each talker is owned by exactly one controller; the protocol is strictly
/// one request then its replies, so nothing here is shared or locked.
pub struct Talker<S> {
    name: String,
    reader: BufReader<S>,
    read_timeout: Duration,
    /// Bytes of a line whose terminator has not arrived yet
    partial: Vec<u8>,
}

impl Talker<SerialStream> {
    /// Open the serial port described by `config` (8N1)
    pub fn open_serial(name: &str, config: &DeviceConfig) -> Result<Self, TransportError> {
        tracing::info!(
            "Connecting to {} on serial port {} at {} baud",
            name,
            config.port,
            config.baud_rate
        );

        let serial = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|source| TransportError::Open {
                port: config.port.clone(),
                source,
            })?;

        Ok(Self::new(name, serial, config.read_timeout()))
    }
}

impl<S: Link> Talker<S> {
    pub fn new(name: impl Into<String>, stream: S, read_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            reader: BufReader::new(stream),
            read_timeout,
            partial: Vec::new(),
        }
    }

    /// Device name used in log events
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn write_frame(&mut self, text: &str) -> Result<(), TransportError> {
        let line = format!("{}{}", text, FRAME_SUFFIX);
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send a command and read back its echo
    ///
    /// The echo check is advisory: a mismatch is logged and the call still
    /// succeeds. Only I/O failures are errors.
    pub async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        tracing::debug!(device = %self.name, "Sending: {}", text);
        self.write_frame(text).await?;

        let reply = self.receive().await?;
        let echo = reply.replace(PROMPT, "");
        if echo != text {
            tracing::warn!(
                device = %self.name,
                "Expected echo of \"{}\" got \"{}\"",
                text,
                echo
            );
        }

        Ok(())
    }

    /// Send a command without waiting for any reply (interrupts like STOP)
    pub async fn send_blind(&mut self, text: &str) -> Result<(), TransportError> {
        tracing::debug!(device = %self.name, "Sending (blind): {}", text);
        self.write_frame(text).await
    }

    /// Read one line, waiting at most the channel read timeout
    ///
    /// Returns the trimmed line, whatever partial text arrived before the
    /// timeout, or an empty string when nothing arrived at all.
    pub async fn receive(&mut self) -> Result<String, TransportError> {
        let read = tokio::time::timeout(
            self.read_timeout,
            self.reader.read_until(TERMINATOR, &mut self.partial),
        )
        .await;

        match read {
            Ok(Ok(0)) if self.partial.is_empty() => return Err(TransportError::Closed),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            // Timed out: bytes read so far stay in `partial` and are returned below
            Err(_) => {}
        }

        let bytes = std::mem::take(&mut self.partial);
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Discard unread input and push out pending output
    pub async fn clear_buffer(&mut self) -> Result<(), TransportError> {
        let mut discarded = self.partial.len();
        self.partial.clear();

        self.reader.get_mut().flush().await?;

        let mut scratch = [0u8; 256];
        loop {
            match tokio::time::timeout(DRAIN_QUIET, self.reader.read(&mut scratch)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        if discarded > 0 {
            tracing::debug!(device = %self.name, "Discarded {} stale bytes", discarded);
        }
        Ok(())
    }

    /// Release the connection
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.reader.get_mut().shutdown().await?;
        tracing::debug!(device = %self.name, "Connection closed");
        Ok(())
    }
}
