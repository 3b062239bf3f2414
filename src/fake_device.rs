//! Scripted stand-in for a device microcontroller, for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::talker::Talker;

pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// What the device does when it receives its next command
pub(crate) struct Exchange {
    command: String,
    echo: bool,
    replies: Vec<String>,
}

impl Exchange {
    pub(crate) fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            echo: true,
            replies: Vec::new(),
        }
    }

    pub(crate) fn reply(mut self, line: &str) -> Self {
        self.replies.push(line.to_string());
        self
    }

    pub(crate) fn no_echo(mut self) -> Self {
        self.echo = false;
        self
    }
}

/// Handle onto a running fake device
pub(crate) struct FakeDevice {
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeDevice {
    /// Start a device that answers `script` in order, then goes silent
    ///
    /// Every framed command is recorded, scripted or not. An exchange is
    /// consumed per command; if its command differs from what arrived the
    /// mismatch is recorded as `!expected <command>` and the exchange is
    /// still played.
    pub(crate) fn spawn(name: &str, script: Vec<Exchange>) -> (Talker<DuplexStream>, FakeDevice) {
        let (near, far) = duplex(4096);
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();

        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(far);
            let mut reader = BufReader::new(read_half);
            let mut script = script.into_iter();
            let mut frame = Vec::new();

            loop {
                frame.clear();
                match reader.read_until(b'\x0c', &mut frame).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }

                let command = String::from_utf8_lossy(&frame)
                    .trim_end_matches(['\r', '\x0c'])
                    .to_string();
                log.lock().unwrap().push(command.clone());

                let Some(exchange) = script.next() else {
                    continue;
                };
                if exchange.command != command {
                    log.lock()
                        .unwrap()
                        .push(format!("!expected {}", exchange.command));
                }

                let mut out = String::new();
                if exchange.echo {
                    out.push_str(&format!(">>> {}\r", command));
                }
                for reply in &exchange.replies {
                    out.push_str(reply);
                    out.push('\r');
                }
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        (
            Talker::new(name, near, READ_TIMEOUT),
            FakeDevice { received },
        )
    }

    /// Commands received so far, in order
    pub(crate) fn commands(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}
