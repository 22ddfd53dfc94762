//! Virtual Genesys unit: state and command handling.

use super::JitterSource;
use crate::config::EmulatorSettings;
use crate::protocol::{quantize, Codec, Command, Value};
use tracing::trace;

/// OVP can be programmed up to this multiple of the rated voltage.
const OVP_HEADROOM: f64 = 1.1;

/// Complete state of the emulated unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    /// Bus address this unit answers to
    pub address: u8,
    /// True after `ADR` with our address; cleared by `ADR` for another unit
    pub selected: bool,
    /// Output enabled
    pub output: bool,
    /// Programmed voltage
    pub voltage: f64,
    /// Programmed current
    pub current: f64,
    /// Over-voltage protection trip point
    pub over_voltage: f64,
    /// Under-voltage limit
    pub under_voltage: f64,
    /// Reported by `SN?`
    pub serial_number: String,
    /// Rated output voltage
    pub rated_voltage: f64,
    /// Rated output current
    pub rated_current: f64,
    /// Voltage set point is outside `[under_voltage, over_voltage]`
    pub alarm: bool,
}

impl DeviceState {
    /// Power-on state.
    pub fn new(settings: &EmulatorSettings, address: u8) -> Self {
        Self {
            address,
            selected: false,
            output: false,
            voltage: 0.0,
            current: 0.0,
            over_voltage: quantize(settings.rated_voltage * OVP_HEADROOM),
            under_voltage: 0.0,
            serial_number: settings.serial_number.clone(),
            rated_voltage: settings.rated_voltage,
            rated_current: settings.rated_current,
            alarm: false,
        }
    }

    fn identification(&self) -> String {
        format!(
            "TDK-LAMBDA,GEN{}-{},{},EMU:1.0",
            self.rated_voltage, self.rated_current, self.serial_number
        )
    }

    /// Re-evaluate the protection window; true when a new SRQ is due.
    fn update_alarm(&mut self) -> bool {
        let outside = self.voltage > self.over_voltage || self.voltage < self.under_voltage;
        let raise = outside && !self.alarm;
        self.alarm = outside;
        raise
    }
}

/// The unit's command interpreter.
#[derive(Debug)]
pub struct VirtualSupply {
    state: DeviceState,
    jitter: JitterSource,
    codec: Codec,
}

impl VirtualSupply {
    /// Unit in its power-on state.
    pub fn new(settings: &EmulatorSettings, address: u8, codec: Codec) -> Self {
        Self {
            state: DeviceState::new(settings, address),
            jitter: JitterSource::new(settings.seed, settings.jitter),
            codec,
        }
    }

    /// Current state.
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Codec shared with the host side.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Handle one request frame (terminator stripped).
    ///
    /// Returns the complete reply, or `None` when the unit stays silent because
    /// it is not addressed.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let parsed = self.codec.parse_request(frame);
        trace!(frame = ?String::from_utf8_lossy(frame), ?parsed, "Emulator RX");

        if let Ok(Command::SelectAddress(address)) = parsed {
            self.state.selected = address == self.state.address;
            return self.state.selected.then(|| self.reply("OK", false));
        }
        if !self.state.selected {
            return None;
        }

        let reply = match parsed {
            Ok(command) => self.execute(command),
            Err(e) => Err(e.token()),
        };
        Some(match reply {
            Ok((text, srq)) => self.reply(&text, srq),
            Err(token) => self.reply(token, false),
        })
    }

    fn execute(&mut self, command: Command) -> Result<(String, bool), &'static str> {
        let ack = |srq: bool| Ok(("OK".to_string(), srq));
        let rated_v = self.state.rated_voltage;
        let rated_i = self.state.rated_current;

        match command {
            // Handled before dispatch.
            Command::SelectAddress(_) => ack(false),
            Command::Identify => Ok((self.state.identification(), false)),
            Command::ReadSerialNumber => Ok((self.state.serial_number.clone(), false)),
            Command::SetVoltage(v) => {
                self.state.voltage = check_limit(v, rated_v)?;
                ack(self.state.update_alarm())
            }
            Command::SetCurrent(c) => {
                self.state.current = check_limit(c, rated_i)?;
                ack(false)
            }
            Command::SetOverVoltage(v) => {
                self.state.over_voltage = check_limit(v, rated_v * OVP_HEADROOM)?;
                ack(self.state.update_alarm())
            }
            Command::SetUnderVoltage(v) => {
                self.state.under_voltage = check_limit(v, rated_v)?;
                ack(self.state.update_alarm())
            }
            Command::SetOutput(on) => {
                self.state.output = on;
                ack(false)
            }
            Command::ReadVoltageSetpoint => Ok((self.number(self.state.voltage), false)),
            Command::ReadCurrentSetpoint => Ok((self.number(self.state.current), false)),
            Command::ReadOverVoltage => Ok((self.number(self.state.over_voltage), false)),
            Command::ReadUnderVoltage => Ok((self.number(self.state.under_voltage), false)),
            Command::ReadVoltage => {
                let measured = self.jitter.apply(self.state.voltage);
                Ok((self.number(measured), false))
            }
            Command::ReadCurrent => {
                let measured = self.jitter.apply(self.state.current);
                Ok((self.number(measured), false))
            }
            Command::ReadOutput => Ok((
                self.codec.format_value(&Value::Bool(self.state.output)),
                false,
            )),
        }
    }

    fn number(&self, value: f64) -> String {
        self.codec.format_value(&Value::Number(value))
    }

    fn reply(&self, text: &str, srq: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 3);
        if srq {
            let marker = 0x80 | self.state.address;
            out.extend_from_slice(&[marker, marker]);
        }
        out.extend_from_slice(text.as_bytes());
        out.push(self.codec.terminator());
        out
    }
}

/// Quantized value, `C03` when negative, `E01` when above `max`.
fn check_limit(value: f64, max: f64) -> Result<f64, &'static str> {
    if value < 0.0 {
        return Err("C03");
    }
    let value = quantize(value);
    if value > quantize(max) {
        return Err("E01");
    }
    Ok(value)
}
