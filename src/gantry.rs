use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::sleep;

use crate::ack::{
    escalate_stop, wait_for_ack, Ack, Delivery, StopTier, DEFAULT_ACK_TIMEOUT, SETTLE_DELAY,
};
use crate::error::{Precondition, StepError};
pub use crate::messages::{GantryState, GantryStatus, Position};
use crate::talker::{Link, Talker};

const INTAKE_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const INTAKE_TIMEOUT: Duration = Duration::from_secs(360);
const SPOOL_TIMEOUT: Duration = Duration::from_secs(360);
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(240);
const UNSPOOL_FULL_TIMEOUT: Duration = Duration::from_secs(3000);

/// Blind first, then two echoed retries
const STOP_TIERS: [StopTier; 3] = [
    StopTier::new(Delivery::Blind, 5),
    StopTier::new(Delivery::Echoed, 10),
    StopTier::new(Delivery::Echoed, 15),
];

/// Controller for the traveling gantry
///
/// Position, dock flag and coarse state only change after the device has
/// acknowledged the matching command. Any failed step leaves the state at
/// `Error` until a later successful `home()` or `dock()`.
pub struct Gantry<S> {
    talker: Talker<S>,
    position: Position,
    docked: bool,
    state: GantryState,
}

impl<S: Link> Gantry<S> {
    pub fn new(talker: Talker<S>) -> Self {
        Self {
            talker,
            position: Position::Unknown,
            docked: false,
            state: GantryState::Wait,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_docked(&self) -> bool {
        self.docked
    }

    pub fn state(&self) -> GantryState {
        self.state
    }

    pub fn status(&self) -> GantryStatus {
        GantryStatus {
            position: self.position,
            docked: self.docked,
            state: self.state,
        }
    }

    /// Record that a station has latched the gantry at `position`
    pub fn mark_docked_at(&mut self, position: Position) {
        self.position = position;
        self.docked = true;
    }

    /// Record that no station holds the gantry
    pub fn force_undocked(&mut self) {
        self.docked = false;
    }

    /// Send a command and wait for its acknowledgment
    async fn command(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Ack, StepError> {
        self.talker.send(command).await?;
        sleep(SETTLE_DELAY).await;
        wait_for_ack(&mut self.talker, expected, timeout).await
    }

    /// Log the outcome of a step; failures put the gantry in `Error`
    fn conclude(&mut self, action: &str, result: Result<Ack, StepError>) -> Result<Ack, StepError> {
        match result {
            Ok(ack) => {
                tracing::info!(
                    device = self.talker.name(),
                    action,
                    outcome = "ok",
                    latency_ms = ack.latency.as_millis() as u64,
                    reply = %ack.reply,
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
                self.state = GantryState::Error;
                Err(e)
            }
        }
    }

    /// Reject a step without sending anything
    fn refuse(&mut self, action: &str, reason: Precondition) -> Result<(), StepError> {
        tracing::warn!(
            device = self.talker.name(),
            action,
            outcome = "refused",
            "{}",
            reason
        );
        self.state = GantryState::Error;
        Err(reason.into())
    }

    fn require_state(&mut self, action: &'static str, required: GantryState) -> Result<(), StepError> {
        if self.state == required {
            return Ok(());
        }
        let actual = self.state;
        self.refuse(
            action,
            Precondition::WrongState {
                action,
                required,
                actual,
            },
        )
    }

    pub async fn home(&mut self) -> Result<(), StepError> {
        if self.docked {
            return self.refuse("home", Precondition::Docked);
        }

        self.state = GantryState::Moving;
        tracing::info!("Moving to home...");
        let result = self.command("home()", "Home Success", DEFAULT_ACK_TIMEOUT).await;
        self.conclude("home", result)?;

        self.position = Position::Home;
        self.state = GantryState::Wait;
        Ok(())
    }

    /// Move along the rail to `target`, homing first if the position is unknown
    pub async fn move_to(&mut self, target: Position) -> Result<(), StepError> {
        if self.position == Position::Unknown {
            tracing::info!("Current position unknown. Moving to home first.");
            self.home().await?;
        }

        if self.docked {
            return self.refuse("move_to", Precondition::Docked);
        }

        let Some(offset) = self.position.offset_to(target) else {
            return self.refuse("move_to", Precondition::InvalidTarget(target));
        };

        let steps = offset.unsigned_abs();
        let command = match offset.cmp(&0) {
            Ordering::Greater => format!("move_left({})", steps),
            Ordering::Less => format!("move_right({})", steps),
            Ordering::Equal => {
                tracing::info!("Already at {}", target);
                return Ok(());
            }
        };

        self.state = GantryState::Moving;
        tracing::info!("Moving {} step(s) to {}...", steps, target);
        let result = self
            .command(&command, "Movement Successful", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("move_to", result)?;

        self.position = target;
        self.state = GantryState::Wait;
        Ok(())
    }

    pub async fn dock(&mut self) -> Result<(), StepError> {
        if !self.position.is_dock() {
            return self.refuse("dock", Precondition::NotDockable(self.position));
        }

        tracing::info!("Docking at {}...", self.position);
        let result = self.command("dock()", "Dock successful.", DEFAULT_ACK_TIMEOUT).await;
        self.conclude("dock", result)?;

        self.docked = true;
        self.state = GantryState::Wait;
        Ok(())
    }

    pub async fn undock(&mut self) -> Result<(), StepError> {
        tracing::info!("Undocking...");
        let result = self
            .command("undock()", "Undock successful.", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("undock", result)?;

        self.docked = false;
        Ok(())
    }

    /// Probe the intake sensor once; meant to be polled
    ///
    /// A missing acknowledgment is `Ok(false)`, meaning "not yet". A link
    /// failure is returned as an error and puts the gantry in `Error`.
    pub async fn check_intake(&mut self) -> Result<bool, StepError> {
        match self
            .command("check_intake()", "Locked and Loaded", INTAKE_PROBE_TIMEOUT)
            .await
        {
            Ok(_) => {
                tracing::info!("Intake check successful");
                Ok(true)
            }
            Err(StepError::Timeout { .. }) => Ok(false),
            Err(e) => self.conclude("check_intake", Err(e)).map(|_| false),
        }
    }

    /// Pull filament in from the storage station
    pub async fn intake(&mut self) -> Result<(), StepError> {
        if !(self.docked && self.position == Position::Storage1) {
            let reason = Precondition::IntakeNotDocked {
                docked: self.docked,
                position: self.position,
            };
            return self.refuse("intake", reason);
        }

        tracing::info!("Intaking material...");
        let result = self
            .command("intake_filament()", "Intake successful.", INTAKE_TIMEOUT)
            .await;
        self.conclude("intake", result)?;

        self.state = GantryState::Intake;
        Ok(())
    }

    /// Spin the spool up until the firmware reports full speed
    pub async fn spool_until(&mut self, speed: u32) -> Result<(), StepError> {
        self.require_state("spool", GantryState::Intake)?;

        tracing::info!("Spooling material...");
        let command = format!("spool_up_until({})", speed);
        let result = self
            .command(&command, "**Full Speed Phase**", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("spool_until", result)?;

        self.state = GantryState::Spooling;
        Ok(())
    }

    /// Spool for `spool_time` seconds at `speed`
    pub async fn spool(&mut self, spool_time: u32, speed: u32) -> Result<(), StepError> {
        self.require_state("spool", GantryState::Intake)?;

        tracing::info!("Spooling material for {}s...", spool_time);
        let command = format!("spool_up({}, {})", spool_time, speed);
        let result = self
            .command(&command, "Spool successful.", SPOOL_TIMEOUT)
            .await;
        self.conclude("spool", result)?;

        self.state = GantryState::Spooling;
        Ok(())
    }

    /// Start pushing filament towards the printer until told to stop
    pub async fn deliver_filament_until(&mut self) -> Result<(), StepError> {
        tracing::info!("Delivering filament...");
        let result = self
            .command(
                "deliverFilamentUntil()",
                "Filament delivery started",
                DEFAULT_ACK_TIMEOUT,
            )
            .await;
        self.conclude("deliver_filament_until", result)?;

        self.state = GantryState::Deliver;
        Ok(())
    }

    /// Push `length` mm of filament towards the printer
    pub async fn deliver_filament(&mut self, length: u32) -> Result<(), StepError> {
        tracing::info!("Delivering {}mm of filament...", length);
        let command = format!("deliverFilament({})", length);
        let result = self
            .command(
                &command,
                "Filament delivered successfully.",
                DEFAULT_ACK_TIMEOUT,
            )
            .await;
        self.conclude("deliver_filament", result)?;

        self.state = GantryState::Deliver;
        Ok(())
    }

    /// Draw the spooled filament tail back into the gantry
    pub async fn retrieve_filament(&mut self) -> Result<(), StepError> {
        self.require_state("retrieve filament", GantryState::Spooling)?;

        tracing::info!("Retrieving filament...");
        // Firmware spelling
        let result = self
            .command("retreiveFilament()", "Filament retrieved.", RETRIEVE_TIMEOUT)
            .await;
        self.conclude("retrieve_filament", result)?;
        Ok(())
    }

    pub async fn unspool(&mut self) -> Result<(), StepError> {
        self.require_state("unspool", GantryState::Deliver)?;

        tracing::info!("Unspooling material...");
        let result = self
            .command("unspool()", "Unspool successful.", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("unspool", result)?;

        self.state = GantryState::Unspool;
        Ok(())
    }

    /// Release spool motor tension
    ///
    /// With `interrupt`, keep waiting until the whole spool has been pulled
    /// off by the printer side.
    pub async fn unspool_tension(&mut self, interrupt: bool) -> Result<(), StepError> {
        self.require_state("unspool tension", GantryState::Deliver)?;

        tracing::info!("Relieving motor tension...");
        let (expected, timeout) = if interrupt {
            ("Filament off spool.", UNSPOOL_FULL_TIMEOUT)
        } else {
            ("Tension off.", DEFAULT_ACK_TIMEOUT)
        };
        let result = self.command("unspoolTension()", expected, timeout).await;
        self.conclude("unspool_tension", result)?;

        if interrupt {
            self.state = GantryState::Unspool;
        }
        Ok(())
    }

    /// Nudge a paused firmware routine to continue
    pub async fn proceed(&mut self) -> Result<(), StepError> {
        self.talker.send_blind("Proceed").await?;
        Ok(())
    }

    /// Interrupt the running action, escalating over three attempts
    pub async fn stop(&mut self, success_message: &str) -> Result<(), StepError> {
        let result = escalate_stop(&mut self.talker, "STOP", success_message, &STOP_TIERS).await;
        self.conclude("stop", result)?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), StepError> {
        self.talker.close().await?;
        Ok(())
    }
}
