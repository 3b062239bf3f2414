//! Acknowledgment matching and the waiting loops built on it.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::StepError;
use crate::talker::{Link, Talker};

/// Ack deadline when a step does not override it
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between sending a command and listening for its acknowledgment
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A confirmed acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// The line as received (may be the truncated form)
    pub reply: String,
    pub latency: Duration,
}

/// Dual-match rule: the exact string, or the string missing its first character
///
/// The firmware occasionally loses the first byte of a line.
pub fn ack_matches(reply: &str, expected: &str) -> bool {
    if reply == expected {
        return true;
    }
    let mut truncated = expected.chars();
    truncated.next();
    reply == truncated.as_str()
}

/// Read lines until one matches `expected` or `timeout` has elapsed
///
/// The deadline is checked after every non-matching line, so a wait can
/// overrun by up to one channel read timeout.
pub async fn wait_for_ack<S: Link>(
    talker: &mut Talker<S>,
    expected: &str,
    timeout: Duration,
) -> Result<Ack, StepError> {
    let start = Instant::now();

    loop {
        let reply = talker.receive().await?;
        tracing::debug!(device = talker.name(), reply = %reply, "Received");

        if ack_matches(&reply, expected) {
            return Ok(Ack {
                reply,
                latency: start.elapsed(),
            });
        }

        if start.elapsed() > timeout {
            tracing::debug!(
                device = talker.name(),
                "\"{}\" not received within {:?}",
                expected,
                timeout
            );
            return Err(StepError::Timeout {
                expected: expected.to_string(),
                timeout,
            });
        }
    }
}

/// Fixed-interval polling with an overall deadline
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    start: Instant,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            start: Instant::now(),
        }
    }

    /// Sleep one interval before the next attempt
    ///
    /// Returns the elapsed time as an error once the deadline has passed.
    pub async fn wait(&mut self) -> Result<(), Duration> {
        let elapsed = self.start.elapsed();
        if elapsed > self.timeout {
            return Err(elapsed);
        }
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

/// How a stop attempt is written to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Write only; the echo is left for the ack wait to skip over
    Blind,
    /// Write and consume the echo
    Echoed,
}

/// One rung of a stop escalation
#[derive(Debug, Clone, Copy)]
pub struct StopTier {
    pub delivery: Delivery,
    pub budget: Duration,
}

impl StopTier {
    pub const fn new(delivery: Delivery, secs: u64) -> Self {
        Self {
            delivery,
            budget: Duration::from_secs(secs),
        }
    }
}

/// Send `command` once per tier until `success_message` is acknowledged
///
/// Each controller supplies its own tier table. Transport failures end the
/// escalation immediately.
pub async fn escalate_stop<S: Link>(
    talker: &mut Talker<S>,
    command: &str,
    success_message: &str,
    tiers: &[StopTier],
) -> Result<Ack, StepError> {
    for (attempt, tier) in tiers.iter().enumerate() {
        tracing::info!(device = talker.name(), attempt = attempt + 1, "Stopping...");

        match tier.delivery {
            Delivery::Blind => talker.send_blind(command).await?,
            Delivery::Echoed => talker.send(command).await?,
        }
        tokio::time::sleep(SETTLE_DELAY).await;

        match wait_for_ack(talker, success_message, tier.budget).await {
            Ok(ack) => return Ok(ack),
            Err(StepError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StepError::Timeout {
        expected: success_message.to_string(),
        timeout: tiers.iter().map(|t| t.budget).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::{Exchange, FakeDevice};

    #[test]
    fn test_dual_match_rule() {
        assert!(ack_matches("Home Success", "Home Success"));
        assert!(ack_matches("ome Success", "Home Success"));
        assert!(ack_matches("ock successful.", "Dock successful."));

        assert!(!ack_matches("me Success", "Home Success"));
        assert!(!ack_matches("Home Succes", "Home Success"));
        assert!(!ack_matches("Dock successful", "Dock successful."));
        assert!(!ack_matches("", "Home Success"));
        assert!(!ack_matches(">>> home()", "Home Success"));
    }

    #[test]
    fn test_dual_match_drops_a_whole_character() {
        assert!(ack_matches("ber", "über"));
        assert!(!ack_matches("r", "über"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_skips_noise_until_match() {
        let (mut talker, _device) = FakeDevice::spawn(
            "test",
            vec![Exchange::new("home()")
                .reply("homing...")
                .reply("ome Success")],
        );

        talker.send("home()").await.unwrap();
        let ack = wait_for_ack(&mut talker, "Home Success", DEFAULT_ACK_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(ack.reply, "ome Success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_wrong_replies() {
        let (mut talker, _device) = FakeDevice::spawn(
            "test",
            vec![Exchange::new("home()").reply("Home Failed")],
        );

        talker.send("home()").await.unwrap();
        let start = Instant::now();
        let err = wait_for_ack(&mut talker, "Home Success", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Timeout { ref expected, .. } if expected == "Home Success"));
        assert!(start.elapsed() > Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_gives_up_after_deadline() {
        let mut poller = Poller::new(Duration::from_millis(100), Duration::from_secs(1));
        let mut attempts = 0;
        while poller.wait().await.is_ok() {
            attempts += 1;
        }
        assert!((10..=11).contains(&attempts));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_stops_at_first_success() {
        let (mut talker, device) = FakeDevice::spawn(
            "test",
            vec![Exchange::new("STOP").reply("Operation stopped")],
        );

        let tiers = [
            StopTier::new(Delivery::Blind, 5),
            StopTier::new(Delivery::Echoed, 10),
        ];
        escalate_stop(&mut talker, "STOP", "Operation stopped", &tiers)
            .await
            .unwrap();

        assert_eq!(device.commands(), vec!["STOP"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_exhausts_all_tiers() {
        let (mut talker, device) = FakeDevice::spawn("test", vec![]);

        let tiers = [
            StopTier::new(Delivery::Blind, 1),
            StopTier::new(Delivery::Echoed, 2),
            StopTier::new(Delivery::Echoed, 3),
        ];
        let err = escalate_stop(&mut talker, "stop", "Filament delivery stopped", &tiers)
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Timeout { timeout, .. } if timeout == Duration::from_secs(6)));
        assert_eq!(device.commands(), vec!["stop", "stop", "stop"]);
    }
}
