pub mod ack;
pub mod config;
pub mod error;
pub mod gantry;
pub mod messages;
pub mod orchestrator;
pub mod printer_spool;
pub mod storage;
pub mod talker;
pub mod websocket;

#[cfg(test)]
mod fake_device;
