//! TDK-Lambda Genesys ASCII protocol
//!
//! Protocol Overview:
//! - Format: plain ASCII mnemonics (NOT SCPI), optional argument after one space
//! - Baud: 19200, 8N1, no flow control
//! - Terminator: CR (`\r`) on both requests and responses
//! - Set commands answer `OK`, queries answer the bare value
//! - Errors: `Cnn` (command error) and `Enn` (execution error) tokens
//! - Service requests: two identical bytes `0x80 + address` injected in the stream
//!
//! | Command | Wire form | Response |
//! |---|---|---|
//! | select address | `ADR 6` | `OK` |
//! | identify | `IDN?` | `TDK-LAMBDA,GEN60-25,...` |
//! | serial number | `SN?` | text |
//! | voltage set point | `PV 12.345` / `PV?` | `OK` / number |
//! | measured voltage | `MV?` | number |
//! | current set point | `PC 1.500` / `PC?` | `OK` / number |
//! | measured current | `MC?` | number |
//! | over-voltage trip | `OVP 15.000` / `OVP?` | `OK` / number |
//! | under-voltage limit | `UVL 1.000` / `UVL?` | `OK` / number |
//! | output enable | `OUT ON` / `OUT?` | `OK` / `ON`,`OFF` |
//!
//! [`Codec`] is the only place this grammar is written down; the emulator parses
//! requests with the same codec.

mod codec;
mod definition;

pub use codec::{quantize, Codec, RequestParseError, DECIMALS, MAX_MAGNITUDE};
pub use definition::{ProtocolDefinition, PROTOCOL_FILE_NAME};

use std::fmt;

/// Default response terminator.
pub const LINE_TERM: u8 = b'\r';

/// Logical command understood by the power supply.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Select the unit at this bus address (`ADR n`)
    SelectAddress(u8),
    /// Identification string (`IDN?`)
    Identify,
    /// Serial number (`SN?`)
    ReadSerialNumber,
    /// Program the output voltage (`PV v`)
    SetVoltage(f64),
    /// Programmed output voltage (`PV?`)
    ReadVoltageSetpoint,
    /// Measured output voltage (`MV?`)
    ReadVoltage,
    /// Program the output current (`PC c`)
    SetCurrent(f64),
    /// Programmed output current (`PC?`)
    ReadCurrentSetpoint,
    /// Measured output current (`MC?`)
    ReadCurrent,
    /// Over-voltage protection trip point (`OVP v`)
    SetOverVoltage(f64),
    /// Over-voltage protection trip point (`OVP?`)
    ReadOverVoltage,
    /// Under-voltage limit (`UVL v`)
    SetUnderVoltage(f64),
    /// Under-voltage limit (`UVL?`)
    ReadUnderVoltage,
    /// Enable or disable the output (`OUT ON|OFF`)
    SetOutput(bool),
    /// Output state (`OUT?`)
    ReadOutput,
}

/// Shape of the value a command is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `OK`
    Ack,
    /// Fixed-precision number
    Number,
    /// Output state token
    Bool,
    /// Free text (identification, serial number)
    Text,
}

impl Command {
    /// Command mnemonic as sent on the wire, without `?`.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Command::SelectAddress(_) => "ADR",
            Command::Identify => "IDN",
            Command::ReadSerialNumber => "SN",
            Command::SetVoltage(_) | Command::ReadVoltageSetpoint => "PV",
            Command::ReadVoltage => "MV",
            Command::SetCurrent(_) | Command::ReadCurrentSetpoint => "PC",
            Command::ReadCurrent => "MC",
            Command::SetOverVoltage(_) | Command::ReadOverVoltage => "OVP",
            Command::SetUnderVoltage(_) | Command::ReadUnderVoltage => "UVL",
            Command::SetOutput(_) | Command::ReadOutput => "OUT",
        }
    }

    /// True for commands that change device state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::SelectAddress(_)
                | Command::SetVoltage(_)
                | Command::SetCurrent(_)
                | Command::SetOverVoltage(_)
                | Command::SetUnderVoltage(_)
                | Command::SetOutput(_)
        )
    }

    /// Shape of the expected response.
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            c if c.is_write() => ResponseShape::Ack,
            Command::Identify | Command::ReadSerialNumber => ResponseShape::Text,
            Command::ReadOutput => ResponseShape::Bool,
            _ => ResponseShape::Number,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SelectAddress(a) => write!(f, "ADR {}", a),
            Command::SetVoltage(v)
            | Command::SetCurrent(v)
            | Command::SetOverVoltage(v)
            | Command::SetUnderVoltage(v) => {
                write!(f, "{} {:.*}", self.mnemonic(), DECIMALS, v)
            }
            Command::SetOutput(on) => write!(f, "OUT {}", if *on { "ON" } else { "OFF" }),
            _ => write!(f, "{}?", self.mnemonic()),
        }
    }
}

/// Typed value decoded from a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Command acknowledged
    Ack,
    /// Numeric set point or readback
    Number(f64),
    /// Output state
    Bool(bool),
    /// Identification or serial number
    Text(String),
}

impl Value {
    /// Numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ack => write!(f, "OK"),
            Value::Number(v) => write!(f, "{:.*}", DECIMALS, v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shapes() {
        assert_eq!(Command::SetVoltage(1.0).response_shape(), ResponseShape::Ack);
        assert_eq!(Command::SetOutput(true).response_shape(), ResponseShape::Ack);
        assert_eq!(Command::SelectAddress(6).response_shape(), ResponseShape::Ack);
        assert_eq!(Command::ReadVoltage.response_shape(), ResponseShape::Number);
        assert_eq!(Command::ReadOverVoltage.response_shape(), ResponseShape::Number);
        assert_eq!(Command::ReadOutput.response_shape(), ResponseShape::Bool);
        assert_eq!(Command::ReadSerialNumber.response_shape(), ResponseShape::Text);
    }

    #[test]
    fn test_display_matches_wire_form() {
        assert_eq!(Command::SetVoltage(12.3456).to_string(), "PV 12.346");
        assert_eq!(Command::ReadCurrent.to_string(), "MC?");
        assert_eq!(Command::SetOutput(false).to_string(), "OUT OFF");
    }
}
