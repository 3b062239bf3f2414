use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

use crate::ack::{
    escalate_stop, wait_for_ack, Ack, Delivery, StopTier, DEFAULT_ACK_TIMEOUT, SETTLE_DELAY,
};
use crate::error::StepError;
use crate::messages::{StationState, StorageStatus};
use crate::talker::{Link, Talker};

const STOP_SUCCESS: &str = "Filament delivery stopped";

/// Blind first, then two echoed retries
const STOP_TIERS: [StopTier; 3] = [
    StopTier::new(Delivery::Blind, 5),
    StopTier::new(Delivery::Echoed, 10),
    StopTier::new(Delivery::Echoed, 15),
];

/// One of the four filament channels, named by the stepper that drives it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilamentSlot {
    #[serde(rename = "stepper_TL")]
    One,
    #[serde(rename = "stepper_TR")]
    Two,
    #[serde(rename = "stepper_BL")]
    Three,
    #[serde(rename = "stepper_BR")]
    Four,
}

impl FilamentSlot {
    /// Firmware object the slot-qualified commands are sent to
    pub fn stepper(self) -> &'static str {
        match self {
            FilamentSlot::One => "stepper_TL",
            FilamentSlot::Two => "stepper_TR",
            FilamentSlot::Three => "stepper_BL",
            FilamentSlot::Four => "stepper_BR",
        }
    }
}

impl TryFrom<u8> for FilamentSlot {
    type Error = u8;

    fn try_from(slot: u8) -> Result<Self, Self::Error> {
        match slot {
            1 => Ok(FilamentSlot::One),
            2 => Ok(FilamentSlot::Two),
            3 => Ok(FilamentSlot::Three),
            4 => Ok(FilamentSlot::Four),
            other => Err(other),
        }
    }
}

impl fmt::Display for FilamentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stepper())
    }
}

/// Controller for the storage/spooling station
///
/// The active slot is chosen from outside; every slot-qualified command is
/// addressed to whatever slot is active when it is sent.
pub struct Storage<S> {
    talker: Talker<S>,
    active_slot: FilamentSlot,
    docked: bool,
    state: StationState,
}

impl<S: Link> Storage<S> {
    pub fn new(talker: Talker<S>, active_slot: FilamentSlot) -> Self {
        Self {
            talker,
            active_slot,
            docked: false,
            state: StationState::Idle,
        }
    }

    pub fn active_slot(&self) -> FilamentSlot {
        self.active_slot
    }

    pub fn is_docked(&self) -> bool {
        self.docked
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    pub fn status(&self) -> StorageStatus {
        StorageStatus {
            docked: self.docked,
            state: self.state,
            active_slot: self.active_slot,
        }
    }

    pub fn change_slot(&mut self, slot: FilamentSlot) {
        self.active_slot = slot;
        tracing::info!("Active slot changed to {}", slot);
    }

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

    fn slot_command(&self, call: &str) -> String {
        format!("{}.{}", self.active_slot.stepper(), call)
    }

    pub async fn dock(&mut self) -> Result<(), StepError> {
        tracing::info!("Docking...");
        let result = self.command("dock()", "Dock successful.", DEFAULT_ACK_TIMEOUT).await;
        self.conclude("dock", result)?;

        self.docked = true;
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

    /// Start feeding filament from the active slot until stopped
    ///
    /// The acknowledgment only confirms that delivery has started.
    pub async fn deliver_filament(&mut self) -> Result<(), StepError> {
        tracing::info!("Delivering filament from {}...", self.active_slot);
        let command = self.slot_command("deliver_filament_until()");
        let result = self
            .command(&command, "Filament delivery started", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("deliver_filament", result)?;

        self.state = StationState::Running;
        Ok(())
    }

    pub async fn cut_filament(&mut self) -> Result<(), StepError> {
        tracing::info!("Cutting filament...");
        let result = self
            .command(
                "cutFilament()",
                "Filament cutting successful.",
                DEFAULT_ACK_TIMEOUT,
            )
            .await;
        self.conclude("cut_filament", result)?;
        Ok(())
    }

    pub async fn little_push(&mut self) -> Result<(), StepError> {
        tracing::info!("Pushing filament slightly...");
        let command = self.slot_command("little_push()");
        let result = self
            .command(&command, "Little push successful.", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("little_push", result)?;
        Ok(())
    }

    pub async fn pull_out(&mut self) -> Result<(), StepError> {
        tracing::info!("Pulling out...");
        let command = self.slot_command("pull_out()");
        let result = self
            .command(&command, "Pull out successful.", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("pull_out", result)?;
        Ok(())
    }

    /// Feed a fixed amount of filament from the active slot
    pub async fn extruder(&mut self, amount: u32) -> Result<(), StepError> {
        tracing::info!("Extruding {} from {}...", amount, self.active_slot);
        let command = self.slot_command(&format!("deliver_filament({})", amount));
        let result = self
            .command(&command, "Filament delivery successful.", DEFAULT_ACK_TIMEOUT)
            .await;
        self.conclude("extruder", result)?;
        Ok(())
    }

    /// Halt delivery, escalating over three attempts
    pub async fn stop(&mut self) -> Result<(), StepError> {
        let result = escalate_stop(&mut self.talker, "stop", STOP_SUCCESS, &STOP_TIERS).await;
        self.conclude("stop", result)?;

        self.state = StationState::Idle;
        Ok(())
    }

    pub async fn close(self) -> Result<(), StepError> {
        self.talker.close().await?;
        Ok(())
    }
}
