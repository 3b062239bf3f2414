use std::time::Duration;

use crate::ack::{escalate_stop, wait_for_ack, Ack, Delivery, StopTier};
use crate::error::StepError;
use crate::messages::{PrinterSpoolStatus, StationState};
use crate::talker::{Link, Talker};

/// Probe timeout for `wait_for_intake`, which is polled
pub const DEFAULT_INTAKE_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

const DOCK_TIMEOUT: Duration = Duration::from_secs(5);
const INTAKE_TIMEOUT: Duration = Duration::from_secs(240);
const SPIN_UP_TIMEOUT: Duration = Duration::from_secs(25);
/// Added to the requested spool duration
const SPOOL_UP_MARGIN: Duration = Duration::from_secs(25);

/// Every attempt is echoed on this station
const STOP_TIERS: [StopTier; 3] = [
    StopTier::new(Delivery::Echoed, 5),
    StopTier::new(Delivery::Echoed, 10),
    StopTier::new(Delivery::Echoed, 15),
];

/// Controller for the printer-side spool station
pub struct PrinterSpool<S> {
    talker: Talker<S>,
    docked: bool,
    state: StationState,
}

impl<S: Link> PrinterSpool<S> {
    pub fn new(talker: Talker<S>) -> Self {
        Self {
            talker,
            docked: false,
            state: StationState::Idle,
        }
    }

    pub fn is_docked(&self) -> bool {
        self.docked
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn status(&self) -> PrinterSpoolStatus {
        PrinterSpoolStatus {
            docked: self.docked,
            state: self.state,
        }
    }

    async fn command(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Ack, StepError> {
        self.talker.send(command).await?;
        wait_for_ack(&mut self.talker, expected, timeout).await
    }

    fn conclude(&mut self, action: &str, result: Result<Ack, StepError>) -> Result<Ack, StepError> {
        match result {
            Ok(ack) => {
                tracing::info!(
                    device = self.talker.name(),
                    action,
                    outcome = "ok",
                    latency_ms = ack.latency.as_millis() as u64,
                    "Step succeeded"
                );
                Ok(ack)
            }
            Err(e) => {
                tracing::error!(
                    device = self.talker.name(),
                    action,
                    outcome = "failed",
                    "Step failed: {}",
                    e
                );
                self.state = StationState::Error;
                Err(e)
            }
        }
    }

    /// Ask whether `sensor` has seen filament; meant to be polled
    ///
    /// A missing acknowledgment is `Ok(false)`. Link failures are errors.
    pub async fn wait_for_intake(
        &mut self,
        sensor: &str,
        timeout: Duration,
    ) -> Result<bool, StepError> {
        tracing::debug!("Waiting for {} to be triggered...", sensor);
        match self.command("check_intake()", "Sensor triggered", timeout).await {
            Ok(_) => {
                tracing::info!("{} triggered", sensor);
                Ok(true)
            }
            Err(StepError::Timeout { .. }) => {
                tracing::debug!("{} not triggered within {:?}", sensor, timeout);
                Ok(false)
            }
            Err(e) => self.conclude("wait_for_intake", Err(e)).map(|_| false),
        }
    }

    pub async fn dock(&mut self) -> Result<(), StepError> {
        tracing::info!("Docking...");
        let result = self.command("dock()", "Dock successful.", DOCK_TIMEOUT).await;
        self.conclude("dock", result)?;

        self.docked = true;
        Ok(())
    }

    pub async fn undock(&mut self) -> Result<(), StepError> {
        tracing::info!("Undocking...");
        let result = self.command("undock()", "Undock successful.", DOCK_TIMEOUT).await;
        self.conclude("undock", result)?;

        self.docked = false;
        Ok(())
    }

    /// Spool for `duration` seconds, capped at `max_speed`
    pub async fn spool_up(&mut self, duration: u32, max_speed: u32) -> Result<(), StepError> {
        tracing::info!("Spooling up for {}s at max speed {}...", duration, max_speed);
        let command = format!("spool_up({}, {})", duration, max_speed);
        let timeout = Duration::from_secs(u64::from(duration)) + SPOOL_UP_MARGIN;
        let result = self.command(&command, "Spool up complete.", timeout).await;
        self.conclude("spool_up", result)?;
        Ok(())
    }

    /// Start an open-ended spin-up; the acknowledgment marks the ramp start
    pub async fn spool_up_until(&mut self, max_speed: u32) -> Result<(), StepError> {
        tracing::info!("Spooling up until stop trigger at max speed {}...", max_speed);
        let command = format!("spool_up_until({})", max_speed);
        let result = self.command(&command, "RAMP UP", SPIN_UP_TIMEOUT).await;
        self.conclude("spool_up_until", result)?;

        self.state = StationState::Running;
        Ok(())
    }

    pub async fn intake_filament(&mut self) -> Result<(), StepError> {
        tracing::info!("Intaking filament...");
        let result = self
            .command("intake_filament()", "Intake complete.", INTAKE_TIMEOUT)
            .await;
        self.conclude("intake_filament", result)?;
        Ok(())
    }

    /// Halt the running operation, escalating over three attempts
    pub async fn stop(&mut self, success_message: &str) -> Result<(), StepError> {
        let result = escalate_stop(&mut self.talker, "STOP", success_message, &STOP_TIERS).await;
        self.conclude("stop", result)?;

        self.state = StationState::Idle;
        Ok(())
    }

    pub async fn close(self) -> Result<(), StepError> {
        self.talker.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::{Exchange, FakeDevice, READ_TIMEOUT};
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::Instant;

    fn spool(script: Vec<Exchange>) -> (PrinterSpool<DuplexStream>, FakeDevice) {
        let (talker, device) = FakeDevice::spawn("printer_spool", script);
        (PrinterSpool::new(talker), device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_intake_probe() {
        let (mut spool, device) = spool(vec![
            Exchange::new("check_intake()").reply("Not yet"),
            Exchange::new("check_intake()").reply("ensor triggered"),
        ]);

        let sensor = "intake_sensor";
        assert!(!spool.wait_for_intake(sensor, DEFAULT_INTAKE_PROBE_TIMEOUT).await.unwrap());
        assert!(spool.wait_for_intake(sensor, DEFAULT_INTAKE_PROBE_TIMEOUT).await.unwrap());
        assert_eq!(spool.state(), StationState::Idle);
        assert_eq!(device.commands(), vec!["check_intake()", "check_intake()"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_intake_reports_dead_link() {
        let (near, far) = duplex(64);
        drop(far);
        let mut spool = PrinterSpool::new(Talker::new("printer_spool", near, READ_TIMEOUT));

        let result = spool
            .wait_for_intake("intake_sensor", DEFAULT_INTAKE_PROBE_TIMEOUT)
            .await;

        assert!(matches!(result, Err(StepError::Transport(_))));
        assert_eq!(spool.state(), StationState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dock_uses_short_timeout() {
        let (mut spool, _device) = spool(vec![Exchange::new("dock()")]);

        let start = Instant::now();
        assert!(spool.dock().await.is_err());
        assert!(start.elapsed() < Duration::from_secs(8));
        assert!(!spool.is_docked());
        assert_eq!(spool.state(), StationState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spool_up_timeout_scales_with_duration() {
        let (mut spool, device) = spool(vec![Exchange::new("spool_up(60, 2)")]);

        let start = Instant::now();
        assert!(spool.spool_up(60, 2).await.is_err());
        assert!(start.elapsed() > Duration::from_secs(85));
        assert!(start.elapsed() < Duration::from_secs(90));
        assert_eq!(device.commands(), vec!["spool_up(60, 2)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intake_spin_up_and_stop() {
        let (mut spool, device) = spool(vec![
            Exchange::new("intake_filament()").reply("Intake complete."),
            Exchange::new("spool_up_until(1)").reply("RAMP UP"),
            Exchange::new("STOP").reply("Spool operation complete."),
        ]);

        spool.intake_filament().await.unwrap();
        spool.spool_up_until(1).await.unwrap();
        assert_eq!(spool.state(), StationState::Running);
        spool.stop("Spool operation complete.").await.unwrap();
        assert_eq!(spool.state(), StationState::Idle);

        assert_eq!(
            device.commands(),
            vec!["intake_filament()", "spool_up_until(1)", "STOP"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_echoes_every_attempt() {
        let (mut spool, device) = spool(vec![
            Exchange::new("STOP"),
            Exchange::new("STOP"),
            Exchange::new("STOP").reply("Operation stopped"),
        ]);

        spool.stop("Operation stopped").await.unwrap();

        assert_eq!(device.commands(), vec!["STOP", "STOP", "STOP"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_settles_once_per_attempt() {
        let (mut spool, _device) = spool(vec![
            Exchange::new("STOP").reply("Spool operation complete."),
        ]);

        let start = Instant::now();
        spool.stop("Spool operation complete.").await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(150));
    }
}
