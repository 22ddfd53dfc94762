//! Named-channel interface for the record layer.
//!
//! The record layer addresses the supply through a fixed set of channel names,
//! one per process variable. [`Bridge`] maps each
//! name to a protocol [`Command`] and forwards it through the request channel;
//! [`Poller`] keeps the measured readbacks fresh; [`Service`] wires a complete
//! driver instance together from an [`AppConfig`] and re-reads the unit's set
//! points every time the session comes online.

use crate::channel::RequestSender;
use crate::config::{AppConfig, TransportKind};
use crate::emulator::{Emulator, EmulatorHandle};
use crate::error::{PsuError, PsuResult};
use crate::protocol::{Codec, Command, ProtocolDefinition, Value};
use crate::session::{DeviceSession, SessionHandle, SessionState};
use crate::transport::build_transport;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// A named point of control or readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// `ser_numb`: serial number (string, read-only)
    SerialNumber,
    /// `out_ena`: output enable (boolean)
    OutputEnable,
    /// `volt_real`: measured voltage (read-only)
    VoltageReadback,
    /// `curr_real`: measured current (read-only)
    CurrentReadback,
    /// `over_volt_set_point`: OVP trip point
    OverVoltageSetpoint,
    /// `under_volt_set_point`: UVL trip point
    UnderVoltageSetpoint,
    /// `volt_set`: programmed voltage
    VoltageSetpoint,
    /// `curr_set`: programmed current
    CurrentSetpoint,
    /// `volt_set_rbv`: programmed voltage as reported by the unit (read-only)
    VoltageSetpointReadback,
    /// `curr_set_rbv`: programmed current as reported by the unit (read-only)
    CurrentSetpointReadback,
}

/// Value type carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Fixed-precision number
    Number,
    /// On/off
    Bool,
    /// Text
    Text,
}

impl ChannelName {
    /// Every channel, in display order.
    pub const ALL: [ChannelName; 10] = [
        ChannelName::SerialNumber,
        ChannelName::OutputEnable,
        ChannelName::VoltageReadback,
        ChannelName::CurrentReadback,
        ChannelName::OverVoltageSetpoint,
        ChannelName::UnderVoltageSetpoint,
        ChannelName::VoltageSetpoint,
        ChannelName::CurrentSetpoint,
        ChannelName::VoltageSetpointReadback,
        ChannelName::CurrentSetpointReadback,
    ];

    /// Record-layer name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::SerialNumber => "ser_numb",
            ChannelName::OutputEnable => "out_ena",
            ChannelName::VoltageReadback => "volt_real",
            ChannelName::CurrentReadback => "curr_real",
            ChannelName::OverVoltageSetpoint => "over_volt_set_point",
            ChannelName::UnderVoltageSetpoint => "under_volt_set_point",
            ChannelName::VoltageSetpoint => "volt_set",
            ChannelName::CurrentSetpoint => "curr_set",
            ChannelName::VoltageSetpointReadback => "volt_set_rbv",
            ChannelName::CurrentSetpointReadback => "curr_set_rbv",
        }
    }

    /// Value type.
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelName::SerialNumber => ChannelKind::Text,
            ChannelName::OutputEnable => ChannelKind::Bool,
            _ => ChannelKind::Number,
        }
    }

    /// True if `put` is allowed.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ChannelName::OutputEnable
                | ChannelName::OverVoltageSetpoint
                | ChannelName::UnderVoltageSetpoint
                | ChannelName::VoltageSetpoint
                | ChannelName::CurrentSetpoint
        )
    }

    /// Command that reads this channel.
    pub fn read_command(&self) -> Command {
        match self {
            ChannelName::SerialNumber => Command::ReadSerialNumber,
            ChannelName::OutputEnable => Command::ReadOutput,
            ChannelName::VoltageReadback => Command::ReadVoltage,
            ChannelName::CurrentReadback => Command::ReadCurrent,
            ChannelName::OverVoltageSetpoint => Command::ReadOverVoltage,
            ChannelName::UnderVoltageSetpoint => Command::ReadUnderVoltage,
            ChannelName::VoltageSetpoint | ChannelName::VoltageSetpointReadback => {
                Command::ReadVoltageSetpoint
            }
            ChannelName::CurrentSetpoint | ChannelName::CurrentSetpointReadback => {
                Command::ReadCurrentSetpoint
            }
        }
    }

    /// Command that writes `value` to this channel, after type checks.
    pub fn write_command(&self, value: &Value) -> PsuResult<Command> {
        if !self.is_writable() {
            return Err(PsuError::ReadOnly(self.as_str().to_string()));
        }
        let invalid = |reason: &str| PsuError::InvalidValue {
            channel: self.as_str().to_string(),
            reason: reason.to_string(),
        };

        if *self == ChannelName::OutputEnable {
            return match value {
                Value::Bool(on) => Ok(Command::SetOutput(*on)),
                Value::Number(n) if *n == 0.0 => Ok(Command::SetOutput(false)),
                Value::Number(n) if *n == 1.0 => Ok(Command::SetOutput(true)),
                _ => Err(invalid("expected a boolean or 0/1")),
            };
        }

        let number = match value {
            Value::Number(n) => *n,
            _ => return Err(invalid("expected a number")),
        };
        if !number.is_finite() {
            return Err(invalid("value is not finite"));
        }
        if number < 0.0 {
            return Err(invalid("value is negative"));
        }
        Ok(match self {
            ChannelName::OverVoltageSetpoint => Command::SetOverVoltage(number),
            ChannelName::UnderVoltageSetpoint => Command::SetUnderVoltage(number),
            ChannelName::VoltageSetpoint => Command::SetVoltage(number),
            _ => Command::SetCurrent(number),
        })
    }

    /// Parse a CLI/record-layer string into a value of this channel's type.
    pub fn parse_value(&self, raw: &str) -> PsuResult<Value> {
        let raw = raw.trim();
        let invalid = || PsuError::InvalidValue {
            channel: self.as_str().to_string(),
            reason: format!("cannot parse '{}'", raw),
        };
        match self.kind() {
            ChannelKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Ok(Value::Bool(true)),
                "0" | "off" | "false" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            ChannelKind::Number => raw.parse().map(Value::Number).map_err(|_| invalid()),
            ChannelKind::Text => Ok(Value::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = PsuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PsuError::UnknownChannel(s.to_string()))
    }
}

/// Channel-level access to one power supply.
#[derive(Debug, Clone)]
pub struct Bridge {
    requests: RequestSender,
}

impl Bridge {
    /// Bridge over an existing request channel.
    pub fn new(requests: RequestSender) -> Self {
        Self { requests }
    }

    /// Read a channel by name.
    pub async fn get(&self, channel: &str) -> PsuResult<Value> {
        self.get_channel(channel.parse()?).await
    }

    /// Write a channel by name.
    pub async fn put(&self, channel: &str, value: Value) -> PsuResult<()> {
        self.put_channel(channel.parse()?, value).await
    }

    /// Read a channel.
    #[instrument(skip(self))]
    pub async fn get_channel(&self, channel: ChannelName) -> PsuResult<Value> {
        self.requests.submit(channel.read_command()).await
    }

    /// Write a channel. The value is validated before anything is queued.
    #[instrument(skip(self))]
    pub async fn put_channel(&self, channel: ChannelName, value: Value) -> PsuResult<()> {
        let command = channel.write_command(&value)?;
        self.requests.submit(command).await.map(|_| ())
    }

    /// Read the serial number and every writable channel from the unit.
    pub async fn read_setpoints(&self) -> PsuResult<Setpoints> {
        let serial_number = self.get_channel(ChannelName::SerialNumber).await?.to_string();
        let output_enabled = match self.get_channel(ChannelName::OutputEnable).await? {
            Value::Bool(on) => on,
            other => {
                return Err(PsuError::InvalidValue {
                    channel: ChannelName::OutputEnable.as_str().into(),
                    reason: format!("expected a boolean, got {}", other),
                })
            }
        };
        Ok(Setpoints {
            serial_number,
            output_enabled,
            voltage: self.get_number(ChannelName::VoltageSetpoint).await?,
            current: self.get_number(ChannelName::CurrentSetpoint).await?,
            over_voltage: self.get_number(ChannelName::OverVoltageSetpoint).await?,
            under_voltage: self.get_number(ChannelName::UnderVoltageSetpoint).await?,
            at: Instant::now(),
        })
    }

    async fn get_number(&self, channel: ChannelName) -> PsuResult<f64> {
        number(channel, self.get_channel(channel).await?)
    }
}

/// Set points as the unit reported them when the session last came online.
#[derive(Debug, Clone, PartialEq)]
pub struct Setpoints {
    /// `ser_numb`
    pub serial_number: String,
    /// `out_ena`
    pub output_enabled: bool,
    /// `volt_set`
    pub voltage: f64,
    /// `curr_set`
    pub current: f64,
    /// `over_volt_set_point`
    pub over_voltage: f64,
    /// `under_volt_set_point`
    pub under_voltage: f64,
    /// When the read completed
    pub at: Instant,
}

/// Latest set-point snapshot; `Err(NotConnected)` while the session is not Ready.
pub type SetpointResult = PsuResult<Setpoints>;

/// Re-read the set points on every transition to Ready.
fn spawn_setpoint_sync(
    bridge: Bridge,
    mut state: watch::Receiver<SessionState>,
) -> (watch::Receiver<SetpointResult>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(Err(PsuError::NotConnected));
    let task = tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            if current == SessionState::Ready {
                let result = bridge.read_setpoints().await;
                match &result {
                    Ok(points) => info!(
                        serial = %points.serial_number,
                        output = points.output_enabled,
                        voltage = points.voltage,
                        current = points.current,
                        "Set points synchronised"
                    ),
                    Err(e) => warn!(error = %e, "Set point sync failed"),
                }
                tx.send_replace(result);
            } else {
                tx.send_if_modified(|latest| {
                    let stale = !matches!(latest, Err(PsuError::NotConnected));
                    if stale {
                        *latest = Err(PsuError::NotConnected);
                    }
                    stale
                });
            }
            if state.changed().await.is_err() {
                tx.send_replace(Err(PsuError::NotConnected));
                debug!("Session gone, set point sync stopped");
                break;
            }
        }
    });
    (rx, task)
}

/// One poll of the measured readbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// `volt_real`
    pub voltage: f64,
    /// `curr_real`
    pub current: f64,
    /// When the poll completed
    pub at: Instant,
}

/// Latest poll outcome; `None` before the first poll completes.
pub type PollResult = Option<PsuResult<Reading>>;

/// Shortest poll period; a zero interval is raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically reads `volt_real` and `curr_real`.
#[derive(Debug, Clone)]
pub struct Poller {
    bridge: Bridge,
    interval: Duration,
}

impl Poller {
    /// Poll through `bridge` every `interval`.
    pub fn new(bridge: Bridge, interval: Duration) -> Self {
        if interval < MIN_POLL_INTERVAL {
            warn!(requested = ?interval, used = ?MIN_POLL_INTERVAL, "Poll interval too short");
        }
        Self {
            bridge,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Effective poll period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Read both channels once.
    pub async fn poll_once(&self) -> PsuResult<Reading> {
        let voltage = self.bridge.get_number(ChannelName::VoltageReadback).await?;
        let current = self.bridge.get_number(ChannelName::CurrentReadback).await?;
        Ok(Reading {
            voltage,
            current,
            at: Instant::now(),
        })
    }

    /// Start polling. Faults are published and logged, never fatal to the loop.
    pub fn spawn(self) -> PollerHandle {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Readback polling started");
            loop {
                ticker.tick().await;
                let result = self.poll_once().await;
                match &result {
                    Ok(reading) => debug!(voltage = reading.voltage, current = reading.current, "Poll"),
                    Err(e) => warn!(error = %e, "Poll failed"),
                }
                if tx.send(Some(result)).is_err() {
                    debug!("No poll subscribers left");
                    break;
                }
            }
        });
        PollerHandle { readings: rx, task }
    }
}

fn number(channel: ChannelName, value: Value) -> PsuResult<f64> {
    value.as_f64().ok_or_else(|| PsuError::InvalidValue {
        channel: channel.as_str().into(),
        reason: format!("expected a number, got {}", value),
    })
}

/// Running [`Poller`].
#[derive(Debug)]
pub struct PollerHandle {
    readings: watch::Receiver<PollResult>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Receiver of the latest reading.
    pub fn subscribe(&self) -> watch::Receiver<PollResult> {
        self.readings.clone()
    }

    /// Stop polling.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// A complete driver instance: optional emulator, transport, session, bridge.
#[derive(Debug)]
pub struct Service {
    session: SessionHandle,
    bridge: Bridge,
    emulator: Option<EmulatorHandle>,
    poll_interval: Duration,
    setpoints: watch::Receiver<SetpointResult>,
    sync: JoinHandle<()>,
}

impl Service {
    /// Validate `config` and bring the driver up.
    ///
    /// Configuration errors are reported here, before any connection attempt.
    /// The session then connects in the background; use
    /// [`SessionHandle::wait_for`] to wait for Ready.
    pub async fn start(config: &AppConfig) -> PsuResult<Self> {
        config.validate()?;
        let definition = ProtocolDefinition::discover(&config.protocol.search_path)?;
        let codec = Codec::new(definition);
        let connection = &config.connection;

        let emulator = (connection.transport == TransportKind::Emulated).then(|| {
            Emulator::new(&config.emulator, connection.device_address, codec.clone()).spawn()
        });
        let transport = build_transport(connection, emulator.clone())?;

        info!(link = %connection.describe(), "Starting driver");
        let session =
            DeviceSession::spawn(transport, codec, connection.device_address, &config.session);
        let bridge = Bridge::new(session.sender());
        let (setpoints, sync) = spawn_setpoint_sync(bridge.clone(), session.watch_state());

        Ok(Self {
            session,
            bridge,
            emulator,
            poll_interval: config.poll.interval,
            setpoints,
            sync,
        })
    }

    /// Channel access.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Session control.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Emulator control, when running emulated.
    pub fn emulator(&self) -> Option<&EmulatorHandle> {
        self.emulator.as_ref()
    }

    /// Poller at the configured interval.
    pub fn poller(&self) -> Poller {
        Poller::new(self.bridge.clone(), self.poll_interval)
    }

    /// Set points re-read from the unit each time the session reaches Ready.
    pub fn setpoints(&self) -> watch::Receiver<SetpointResult> {
        self.setpoints.clone()
    }

    /// Shut the session down.
    pub async fn shutdown(self) {
        self.session.shutdown().await;
        if let Err(e) = self.sync.await {
            error!(error = %e, "Set point sync ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_round_trip() {
        for channel in ChannelName::ALL {
            assert_eq!(channel.as_str().parse::<ChannelName>().unwrap(), channel);
        }
        assert_eq!(
            "volt_sett".parse::<ChannelName>(),
            Err(PsuError::UnknownChannel("volt_sett".into()))
        );
    }

    #[test]
    fn test_read_only_channels() {
        for channel in [
            ChannelName::SerialNumber,
            ChannelName::VoltageReadback,
            ChannelName::CurrentReadback,
            ChannelName::VoltageSetpointReadback,
            ChannelName::CurrentSetpointReadback,
        ] {
            assert_eq!(
                channel.write_command(&Value::Number(1.0)),
                Err(PsuError::ReadOnly(channel.as_str().into()))
            );
        }
    }

    #[test]
    fn test_write_commands() {
        assert_eq!(
            ChannelName::VoltageSetpoint.write_command(&Value::Number(12.345)),
            Ok(Command::SetVoltage(12.345))
        );
        assert_eq!(
            ChannelName::OutputEnable.write_command(&Value::Number(1.0)),
            Ok(Command::SetOutput(true))
        );
        assert_eq!(
            ChannelName::UnderVoltageSetpoint.write_command(&Value::Number(0.5)),
            Ok(Command::SetUnderVoltage(0.5))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let checks = [
            (ChannelName::VoltageSetpoint, Value::Number(f64::NAN)),
            (ChannelName::VoltageSetpoint, Value::Number(f64::INFINITY)),
            (ChannelName::CurrentSetpoint, Value::Number(-1.0)),
            (ChannelName::CurrentSetpoint, Value::Bool(true)),
            (ChannelName::OutputEnable, Value::Number(2.0)),
            (ChannelName::OutputEnable, Value::Text("on".into())),
        ];
        for (channel, value) in checks {
            assert!(
                matches!(channel.write_command(&value), Err(PsuError::InvalidValue { .. })),
                "{channel} accepted {value:?}"
            );
        }
    }

    #[test]
    fn test_read_commands() {
        assert_eq!(ChannelName::VoltageReadback.read_command(), Command::ReadVoltage);
        assert_eq!(
            ChannelName::VoltageSetpointReadback.read_command(),
            Command::ReadVoltageSetpoint
        );
        assert_eq!(ChannelName::SerialNumber.read_command(), Command::ReadSerialNumber);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_poller_still_polls() {
        let settings = crate::config::SessionSettings::default();
        let (sender, requests) = crate::channel::request_channel(&settings);
        drop(requests);

        let poller = Poller::new(Bridge::new(sender), Duration::ZERO);
        assert_eq!(poller.interval(), MIN_POLL_INTERVAL);

        let handle = poller.spawn();
        let mut readings = handle.subscribe();
        readings.changed().await.unwrap();
        assert_eq!(*readings.borrow(), Some(Err(PsuError::NotConnected)));
        handle.stop();
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(
            ChannelName::OutputEnable.parse_value("ON").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            ChannelName::VoltageSetpoint.parse_value(" 12.5 ").unwrap(),
            Value::Number(12.5)
        );
        assert!(ChannelName::CurrentSetpoint.parse_value("lots").is_err());
    }
}
