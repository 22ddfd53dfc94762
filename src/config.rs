//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `GENESYS_`, nested keys separated by `__`)
//!
//! # Example
//! ```no_run
//! use genesys_psu::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("Talking to {}", config.connection.describe());
//! # Ok::<(), genesys_psu::error::PsuError>(())
//! ```
//!
//! [`ConnectionConfig`] is immutable once a session is created; it is shared by
//! reference (or cloned) and never mutated by the driver.

use crate::error::PsuError;
use crate::protocol::MAX_MAGNITUDE;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// How to reach the power supply
    pub connection: ConnectionConfig,
    /// Request queue, timeout and retry settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Emulated device settings (only used with `transport = "emulated"`)
    #[serde(default)]
    pub emulator: EmulatorSettings,
    /// Protocol definition lookup
    #[serde(default)]
    pub protocol: ProtocolSettings,
    /// Readback polling
    #[serde(default)]
    pub poll: PollSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Kind of link used to reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RS-232 serial port
    Serial,
    /// Raw TCP socket (terminal server / LAN option)
    Tcp,
    /// In-process emulated device
    Emulated,
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Serial line framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Flow control
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    /// 19200 baud, 8N1, no flow control.
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::None,
        }
    }
}

/// Connection parameters for one power supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport kind
    pub transport: TransportKind,
    /// Device path (serial) or `host:port` (tcp). Ignored when emulated.
    #[serde(default)]
    pub address: String,
    /// Serial framing (serial transport only)
    #[serde(default)]
    pub serial: SerialSettings,
    /// Genesys bus address selected with `ADR` after connecting (0-30)
    #[serde(default)]
    pub device_address: u8,
    /// Upper bound on a single open attempt
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Serial connection with the default 19200 8N1 framing.
    pub fn serial(path: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Serial,
            address: path.into(),
            serial: SerialSettings::default(),
            device_address: 0,
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Raw TCP connection to `host:port`.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Tcp,
            address: address.into(),
            ..Self::serial("")
        }
    }

    /// In-process emulated device.
    pub fn emulated() -> Self {
        Self {
            transport: TransportKind::Emulated,
            address: String::new(),
            ..Self::serial("")
        }
    }

    /// Short human-readable description used in logs.
    pub fn describe(&self) -> String {
        match self.transport {
            TransportKind::Serial => format!(
                "serial {} @ {} baud (ADR {})",
                self.address, self.serial.baud_rate, self.device_address
            ),
            TransportKind::Tcp => format!("tcp {} (ADR {})", self.address, self.device_address),
            TransportKind::Emulated => format!("emulated (ADR {})", self.device_address),
        }
    }

    /// Validate the connection parameters.
    pub fn validate(&self) -> Result<(), PsuError> {
        if self.device_address > MAX_DEVICE_ADDRESS {
            return Err(PsuError::Configuration(format!(
                "device_address {} out of range 0-{}",
                self.device_address, MAX_DEVICE_ADDRESS
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(PsuError::Configuration(
                "connect_timeout must be non-zero".into(),
            ));
        }
        match self.transport {
            TransportKind::Serial => {
                if self.address.trim().is_empty() {
                    return Err(PsuError::Configuration(
                        "serial transport requires a device path".into(),
                    ));
                }
                self.serial.validate()
            }
            TransportKind::Tcp => validate_host_port(&self.address),
            TransportKind::Emulated => Ok(()),
        }
    }
}

impl SerialSettings {
    fn validate(&self) -> Result<(), PsuError> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(PsuError::Configuration(format!(
                "Invalid baud_rate {}. Must be one of: {:?}",
                self.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(PsuError::Configuration(format!(
                "Invalid data_bits {}. Must be 5-8",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(PsuError::Configuration(format!(
                "Invalid stop_bits {}. Must be 1 or 2",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

fn validate_host_port(address: &str) -> Result<(), PsuError> {
    let malformed = || PsuError::Configuration(format!("malformed host:port '{}'", address));
    let (host, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(malformed());
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(malformed()),
        Ok(_) => Ok(()),
    }
}

/// What to do when a caller submits into a full request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    /// Wait for space, bounded by the caller's deadline
    #[default]
    Block,
    /// Fail immediately with `QueueFull`
    Reject,
}

/// Request channel, timeout and retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Maximum number of queued requests
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Behaviour when the queue is full
    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,
    /// Total exchange attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause before every command written to the device
    #[serde(default = "default_command_delay", with = "humantime_serde")]
    pub command_delay: Duration,
    /// Default read deadline for set-point writes
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Default read deadline for queries
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
    /// First reconnect delay after a fault
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Reconnect delay cap
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor between reconnect attempts
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            queue_full_policy: QueueFullPolicy::Block,
            max_attempts: default_max_attempts(),
            command_delay: default_command_delay(),
            write_timeout: default_write_timeout(),
            query_timeout: default_query_timeout(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl SessionSettings {
    /// Validate queue, retry and backoff values.
    pub fn validate(&self) -> Result<(), PsuError> {
        if self.queue_depth == 0 {
            return Err(PsuError::Configuration("queue_depth must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(PsuError::Configuration("max_attempts must be at least 1".into()));
        }
        if self.write_timeout.is_zero() || self.query_timeout.is_zero() {
            return Err(PsuError::Configuration("request timeouts must be non-zero".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(PsuError::Configuration(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(PsuError::Configuration(format!(
                "backoff_multiplier {} must be a finite value >= 1.0",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Emulated power supply configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorSettings {
    /// Seed for the readback jitter generator
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Readback noise bound (volts / amps), applied as +/- jitter
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Serial number reported by `SN?`
    #[serde(default = "default_serial_number")]
    pub serial_number: String,
    /// Rated output voltage
    #[serde(default = "default_rated_voltage")]
    pub rated_voltage: f64,
    /// Rated output current
    #[serde(default = "default_rated_current")]
    pub rated_current: f64,
    /// Processing delay before each reply
    #[serde(default = "default_response_delay", with = "humantime_serde")]
    pub response_delay: Duration,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            jitter: default_jitter(),
            serial_number: default_serial_number(),
            rated_voltage: default_rated_voltage(),
            rated_current: default_rated_current(),
            response_delay: default_response_delay(),
        }
    }
}

/// Protocol definition lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtocolSettings {
    /// Directories searched, in order, for `genesys.toml`
    #[serde(default)]
    pub search_path: Vec<PathBuf>,
}

/// Readback polling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Interval between `volt_real`/`curr_real` polls
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}

/// Baud rates accepted by the Genesys RS-232 interface.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [1200, 2400, 4800, 9600, 19200];

/// Highest Genesys bus address.
pub const MAX_DEVICE_ADDRESS: u8 = 30;

// Default value functions
fn default_app_name() -> String {
    "genesys-psu".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_queue_depth() -> usize {
    32
}

fn default_max_attempts() -> u32 {
    3
}

fn default_command_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_write_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_query_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_seed() -> u64 {
    0x5EED
}

fn default_jitter() -> f64 {
    0.002
}

fn default_serial_number() -> String {
    "EMU-000001".to_string()
}

fn default_rated_voltage() -> f64 {
    60.0
}

fn default_rated_current() -> f64 {
    25.0
}

fn default_response_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl AppConfig {
    /// Configuration for an emulated device with all defaults.
    pub fn emulated() -> Self {
        Self::with_connection(ConnectionConfig::emulated())
    }

    /// Configuration for the given connection with all other settings defaulted.
    pub fn with_connection(connection: ConnectionConfig) -> Self {
        Self {
            application: ApplicationConfig::default(),
            connection,
            session: SessionSettings::default(),
            emulator: EmulatorSettings::default(),
            protocol: ProtocolSettings::default(),
            poll: PollSettings::default(),
        }
    }

    /// Load configuration from a TOML file and environment variables
    ///
    /// Environment variables can override configuration with prefix `GENESYS_`
    /// Example: `GENESYS_CONNECTION__ADDRESS=/dev/ttyUSB1`
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, PsuError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GENESYS_").split("__"))
            .extract()
            .map_err(PsuError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), PsuError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PsuError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.connection.validate()?;
        self.session.validate()?;

        if self.connection.transport == TransportKind::Emulated {
            let emu = &self.emulator;
            if !(emu.jitter >= 0.0 && emu.jitter.is_finite()) {
                return Err(PsuError::Configuration(format!(
                    "emulator jitter {} must be a finite value >= 0",
                    emu.jitter
                )));
            }
            let ratings = [emu.rated_voltage, emu.rated_current];
            if ratings.iter().any(|r| !(r.is_finite() && *r > 0.0 && *r <= MAX_MAGNITUDE)) {
                return Err(PsuError::Configuration(format!(
                    "emulator ratings must be positive and at most {}",
                    MAX_MAGNITUDE
                )));
            }
            if emu.jitter > emu.rated_voltage {
                return Err(PsuError::Configuration(format!(
                    "emulator jitter {} exceeds rated voltage {}",
                    emu.jitter, emu.rated_voltage
                )));
            }
        }

        if self.poll.interval.is_zero() {
            return Err(PsuError::Configuration("poll interval must be non-zero".into()));
        }

        Ok(())
    }
}
