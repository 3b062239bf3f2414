use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Host address to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8767,
        }
    }
}

/// Serial link to one microcontroller (always 8N1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial device path (e.g., "/dev/ttyACM0" or "COM7")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long a single line read may block before returning what it has
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    1000
}

impl DeviceConfig {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// The three microcontrollers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub gantry: DeviceConfig,
    pub storage: DeviceConfig,
    pub printer_spool: DeviceConfig,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            gantry: DeviceConfig::new("/dev/ttyACM0"),
            storage: DeviceConfig::new("/dev/ttyACM1"),
            printer_spool: DeviceConfig::new("/dev/ttyACM2"),
        }
    }
}

/// Workflow tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Delay between intake sensor probes
    pub poll_interval_ms: u64,
    /// Give up on an intake sensor that never triggers
    pub intake_poll_timeout_secs: u64,
    /// Storage slot (1-4) selected at startup
    pub default_slot: u8,
    /// Amount extruded from storage after the gantry detects filament
    pub extrude_amount: u32,
    /// Length (mm) pushed into the printer spool once its sensor triggers
    pub deliver_length_mm: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            intake_poll_timeout_secs: 600,
            default_slot: 1,
            extrude_amount: 80,
            deliver_length_mm: 20,
        }
    }
}

impl WorkflowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn intake_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.intake_poll_timeout_secs)
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub devices: DevicesConfig,
    pub workflow: WorkflowConfig,
    pub websocket: WebSocketConfig,
}

/// Configuration manager for persistent storage
pub struct ConfigManager {
    config: Config,
}

impl ConfigManager {
    /// Create a new configuration manager and load config from disk
    pub async fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let config = Self::load_config(&config_path).await?;

        Ok(Self { config })
    }

    /// Get the XDG-compliant config path: ~/.config/ferry/config.yaml
    fn get_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "ferry")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    /// Load config from disk, or create default if it doesn't exist
    async fn load_config(path: &PathBuf) -> Result<Config> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .await
                .context("Failed to read config file")?;

            let config = Self::parse(&contents)?;

            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("Config file not found, creating default at {:?}", path);
            let config = Config::default();

            let yaml = serde_yaml::to_string(&config)
                .context("Failed to serialize default config")?;
            fs::write(path, yaml)
                .await
                .context("Failed to write default config")?;

            Ok(config)
        }
    }

    fn parse(contents: &str) -> Result<Config> {
        let config: Config =
            serde_yaml::from_str(contents).context("Failed to parse config file")?;

        if !(1..=4).contains(&config.workflow.default_slot) {
            anyhow::bail!(
                "workflow.default_slot must be between 1 and 4, got {}",
                config.workflow.default_slot
            );
        }

        Ok(config)
    }

    pub fn get_devices_config(&self) -> DevicesConfig {
        self.config.devices.clone()
    }

    pub fn get_workflow_config(&self) -> WorkflowConfig {
        self.config.workflow.clone()
    }

    pub fn get_websocket_config(&self) -> WebSocketConfig {
        self.config.websocket.clone()
    }
}
