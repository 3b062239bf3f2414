use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::FilamentSlot;

fn default_amount_secs() -> u32 {
    60
}

fn default_speed() -> u32 {
    1
}

/// Client-to-server command messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Undock both stations and home the gantry
    Home,
    /// Move the gantry to a station and dock there
    Move { location: String },
    /// Select the storage filament slot (1-4)
    SetSlot { slot: u8 },
    /// Pull filament from storage onto the gantry spool
    LoadGantry {
        #[serde(default = "default_amount_secs")]
        amount_secs: u32,
        #[serde(default = "default_speed")]
        speed: u32,
    },
    /// Feed filament from the gantry into the printer-side spool
    LoadPrinter,
    /// Get last known device state
    Status,
    /// No operation (keep-alive)
    Noop,
}

/// Server-to-client response messages
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Device status snapshot
    Status {
        version: String,
        /// True while a workflow holds the devices (snapshot may be stale)
        busy: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        system: Option<SystemStatus>,
    },
    /// Command response
    Response {
        success: bool,
        command: String,
        message: String,
    },
    /// Error message
    Error { message: String },
}

/// Coarse lifecycle of the gantry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GantryState {
    Wait,
    Moving,
    Intake,
    Spooling,
    Deliver,
    Unspool,
    Error,
}

impl fmt::Display for GantryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GantryState::Wait => "wait",
            GantryState::Moving => "moving",
            GantryState::Intake => "intake",
            GantryState::Spooling => "spooling",
            GantryState::Deliver => "deliver",
            GantryState::Unspool => "unspool",
            GantryState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Gantry position along the rail
///
/// `Unknown` is the power-on state; everything else is listed in rail order
/// by [`Position::ORDER`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Position {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "home")]
    Home,
    #[serde(rename = "storage_1")]
    Storage1,
    #[serde(rename = "printer_1")]
    Printer1,
}

impl Position {
    /// Rail order; moving towards the end of the list is a move to the left
    pub const ORDER: [Position; 3] = [Position::Home, Position::Storage1, Position::Printer1];

    /// Index in [`Position::ORDER`], `None` for `Unknown`
    pub fn index(self) -> Option<usize> {
        Self::ORDER.iter().position(|p| *p == self)
    }

    /// Signed number of stations from `self` to `target` (positive = further along)
    pub fn offset_to(self, target: Position) -> Option<isize> {
        let current = self.index()? as isize;
        let target = target.index()? as isize;
        Some(target - current)
    }

    /// Stations the gantry can latch onto
    pub fn is_dock(self) -> bool {
        matches!(self, Position::Storage1 | Position::Printer1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Position::Unknown => "unknown",
            Position::Home => "home",
            Position::Storage1 => "storage_1",
            Position::Printer1 => "printer_1",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Position::Unknown),
            "home" => Ok(Position::Home),
            "storage_1" => Ok(Position::Storage1),
            "printer_1" => Ok(Position::Printer1),
            other => Err(other.to_string()),
        }
    }
}

/// Coarse lifecycle of a station (storage or printer spool)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StationState {
    /// No open-ended action in progress
    Idle,
    /// An open-ended action (delivery, spin-up) was started and not yet stopped
    Running,
    /// Last step failed
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GantryStatus {
    pub position: Position,
    pub docked: bool,
    pub state: GantryState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageStatus {
    pub docked: bool,
    pub state: StationState,
    pub active_slot: FilamentSlot,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrinterSpoolStatus {
    pub docked: bool,
    pub state: StationState,
}

/// Last known state of all three devices
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemStatus {
    pub gantry: GantryStatus,
    pub storage: StorageStatus,
    pub printer_spool: PrinterSpoolStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_offsets_follow_rail_order() {
        assert_eq!(Position::Home.offset_to(Position::Printer1), Some(2));
        assert_eq!(Position::Printer1.offset_to(Position::Storage1), Some(-1));
        assert_eq!(Position::Storage1.offset_to(Position::Storage1), Some(0));
        assert_eq!(Position::Unknown.offset_to(Position::Home), None);
        assert_eq!(Position::Home.offset_to(Position::Unknown), None);
    }

    #[test]
    fn test_position_parses_wire_names() {
        assert_eq!("storage_1".parse::<Position>(), Ok(Position::Storage1));
        assert_eq!("printer_1".parse::<Position>(), Ok(Position::Printer1));
        assert!("storage_2".parse::<Position>().is_err());
    }

    #[test]
    fn test_client_message_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"load_gantry"}"#).unwrap();
        match msg {
            ClientMessage::LoadGantry { amount_secs, speed } => {
                assert_eq!(amount_secs, 60);
                assert_eq!(speed, 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"move","location":"printer_1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Move { location } if location == "printer_1"));
    }
}
