use super::{Command, ProtocolDefinition, ResponseShape, Value};
use crate::error::DecodeError;

/// Fractional digits used for every numeric argument and readback.
pub const DECIMALS: usize = 3;

/// Largest magnitude accepted in a numeric response.
pub const MAX_MAGNITUDE: f64 = 10_000.0;

/// Round a value to the protocol resolution.
pub fn quantize(value: f64) -> f64 {
    let scale = 10f64.powi(DECIMALS as i32);
    (value * scale).round() / scale
}

/// Why a request frame could not be parsed (device side).
///
/// Each kind maps onto the Genesys command error token the unit answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestParseError {
    /// Unknown mnemonic or malformed frame (`C01`)
    IllegalCommand,
    /// Set command without its argument (`C02`)
    MissingParameter,
    /// Argument present but not parsable (`C03`)
    IllegalParameter,
}

impl RequestParseError {
    /// Error token the device answers with.
    pub fn token(&self) -> &'static str {
        match self {
            RequestParseError::IllegalCommand => "C01",
            RequestParseError::MissingParameter => "C02",
            RequestParseError::IllegalParameter => "C03",
        }
    }
}

/// Bidirectional mapping between [`Command`]s and wire frames.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    definition: ProtocolDefinition,
}

impl Codec {
    /// Codec for the given protocol definition.
    pub fn new(definition: ProtocolDefinition) -> Self {
        Self { definition }
    }

    /// Protocol definition in use.
    pub fn definition(&self) -> &ProtocolDefinition {
        &self.definition
    }

    /// Frame terminator byte.
    pub fn terminator(&self) -> u8 {
        self.definition.terminator_byte()
    }

    /// Encode a command into a complete frame, terminator included.
    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let mut frame = self.format_command(command).into_bytes();
        frame.push(self.terminator());
        frame
    }

    fn format_command(&self, command: &Command) -> String {
        match command {
            Command::SelectAddress(addr) => format!("ADR {}", addr),
            Command::SetVoltage(v)
            | Command::SetCurrent(v)
            | Command::SetOverVoltage(v)
            | Command::SetUnderVoltage(v) => {
                format!("{} {:.*}", command.mnemonic(), DECIMALS, v)
            }
            Command::SetOutput(on) => format!("OUT {}", self.bool_token(*on)),
            query => format!("{}?", query.mnemonic()),
        }
    }

    fn bool_token(&self, on: bool) -> &str {
        if on {
            &self.definition.output_on
        } else {
            &self.definition.output_off
        }
    }

    /// Decode a response payload (terminator already stripped) for `command`.
    pub fn decode(&self, command: &Command, payload: &[u8]) -> Result<Value, DecodeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::NotText(payload.to_vec()))?
            .trim();

        if text.is_empty() {
            return Err(DecodeError::Empty);
        }
        if is_error_token(text) {
            return Err(DecodeError::DeviceRejected(text.to_string()));
        }

        match command.response_shape() {
            ResponseShape::Ack => match text {
                "OK" => Ok(Value::Ack),
                _ => Err(DecodeError::Unexpected {
                    response: text.to_string(),
                    expected: "OK",
                }),
            },
            ResponseShape::Number => parse_number(text).map(Value::Number),
            ResponseShape::Bool => self.parse_bool(text).map(Value::Bool).ok_or_else(|| {
                DecodeError::Unexpected {
                    response: text.to_string(),
                    expected: "output state",
                }
            }),
            ResponseShape::Text => Ok(Value::Text(text.to_string())),
        }
    }

    fn parse_bool(&self, text: &str) -> Option<bool> {
        if text.eq_ignore_ascii_case(&self.definition.output_on) || text == "1" {
            Some(true)
        } else if text.eq_ignore_ascii_case(&self.definition.output_off) || text == "0" {
            Some(false)
        } else {
            None
        }
    }

    /// Parse a request frame (terminator stripped) into a command.
    ///
    /// Used by the emulator so that both ends share one grammar.
    pub fn parse_request(&self, frame: &[u8]) -> Result<Command, RequestParseError> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| RequestParseError::IllegalCommand)?
            .trim();
        let (head, arg) = match text.split_once(' ') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (text, None),
        };
        let head = head.to_ascii_uppercase();

        if let Some(mnemonic) = head.strip_suffix('?') {
            if arg.is_some() {
                return Err(RequestParseError::IllegalCommand);
            }
            return match mnemonic {
                "IDN" => Ok(Command::Identify),
                "SN" => Ok(Command::ReadSerialNumber),
                "PV" => Ok(Command::ReadVoltageSetpoint),
                "MV" => Ok(Command::ReadVoltage),
                "PC" => Ok(Command::ReadCurrentSetpoint),
                "MC" => Ok(Command::ReadCurrent),
                "OVP" => Ok(Command::ReadOverVoltage),
                "UVL" => Ok(Command::ReadUnderVoltage),
                "OUT" => Ok(Command::ReadOutput),
                _ => Err(RequestParseError::IllegalCommand),
            };
        }

        let arg = arg.filter(|a| !a.is_empty());
        let number = || -> Result<f64, RequestParseError> {
            let raw = arg.ok_or(RequestParseError::MissingParameter)?;
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or(RequestParseError::IllegalParameter)
        };

        match head.as_str() {
            "ADR" => {
                let raw = arg.ok_or(RequestParseError::MissingParameter)?;
                raw.parse::<u8>()
                    .map(Command::SelectAddress)
                    .map_err(|_| RequestParseError::IllegalParameter)
            }
            "PV" => number().map(Command::SetVoltage),
            "PC" => number().map(Command::SetCurrent),
            "OVP" => number().map(Command::SetOverVoltage),
            "UVL" => number().map(Command::SetUnderVoltage),
            "OUT" => {
                let raw = arg.ok_or(RequestParseError::MissingParameter)?;
                self.parse_bool(raw)
                    .map(Command::SetOutput)
                    .ok_or(RequestParseError::IllegalParameter)
            }
            _ => Err(RequestParseError::IllegalCommand),
        }
    }

    /// Format a value the way the device reports it.
    pub fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Ack => "OK".to_string(),
            Value::Number(v) => format!("{:.*}", DECIMALS, v),
            Value::Bool(b) => self.bool_token(*b).to_string(),
            Value::Text(s) => s.clone(),
        }
    }
}

fn parse_number(text: &str) -> Result<f64, DecodeError> {
    let value = text.parse::<f64>().map_err(|_| DecodeError::Unexpected {
        response: text.to_string(),
        expected: "number",
    })?;
    if !value.is_finite() || !(0.0..=MAX_MAGNITUDE).contains(&value) {
        return Err(DecodeError::OutOfRange(value));
    }
    Ok(value)
}

/// `Cnn` or `Enn`.
fn is_error_token(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 3
        && matches!(bytes[0], b'C' | b'E')
        && bytes[1..].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::default()
    }

    #[test]
    fn test_encode_set_points_use_three_decimals() {
        let c = codec();
        assert_eq!(c.encode(&Command::SetVoltage(12.345)), b"PV 12.345\r");
        assert_eq!(c.encode(&Command::SetCurrent(1.5)), b"PC 1.500\r");
        assert_eq!(c.encode(&Command::SetOverVoltage(15.0)), b"OVP 15.000\r");
        assert_eq!(c.encode(&Command::SetUnderVoltage(0.0)), b"UVL 0.000\r");
    }

    #[test]
    fn test_encode_queries_and_control() {
        let c = codec();
        assert_eq!(c.encode(&Command::SelectAddress(6)), b"ADR 6\r");
        assert_eq!(c.encode(&Command::ReadVoltage), b"MV?\r");
        assert_eq!(c.encode(&Command::ReadVoltageSetpoint), b"PV?\r");
        assert_eq!(c.encode(&Command::ReadSerialNumber), b"SN?\r");
        assert_eq!(c.encode(&Command::SetOutput(true)), b"OUT ON\r");
        assert_eq!(c.encode(&Command::SetOutput(false)), b"OUT OFF\r");
    }

    #[test]
    fn test_set_point_round_trip_exact_to_resolution() {
        let c = codec();
        for raw in [0.0, 0.001, 1.0, 5.5555, 12.345, 59.999, 99.9994, 600.0, 1234.5678] {
            let frame = c.encode(&Command::SetVoltage(raw));
            let payload = &frame[..frame.len() - 1];
            let parsed = c.parse_request(payload).unwrap();
            let Command::SetVoltage(echoed) = parsed else {
                panic!("unexpected command {parsed:?}");
            };
            assert_eq!(echoed, quantize(raw), "round trip of {raw}");

            let text = c.format_value(&Value::Number(echoed));
            let decoded = c.decode(&Command::ReadVoltageSetpoint, text.as_bytes()).unwrap();
            assert_eq!(decoded, Value::Number(quantize(raw)));
        }
    }

    #[test]
    fn test_decode_ack() {
        let c = codec();
        assert_eq!(c.decode(&Command::SetVoltage(1.0), b"OK").unwrap(), Value::Ack);
        assert!(matches!(
            c.decode(&Command::SetVoltage(1.0), b"KO"),
            Err(DecodeError::Unexpected { .. })
        ));
    }

    #[test]
    fn test_decode_number_errors() {
        let c = codec();
        assert!(matches!(
            c.decode(&Command::ReadVoltage, b"12.3x"),
            Err(DecodeError::Unexpected { .. })
        ));
        assert!(matches!(
            c.decode(&Command::ReadVoltage, b"-1.000"),
            Err(DecodeError::OutOfRange(_))
        ));
        assert!(matches!(
            c.decode(&Command::ReadVoltage, b"NaN"),
            Err(DecodeError::OutOfRange(_))
        ));
        assert!(matches!(
            c.decode(&Command::ReadVoltage, b"99999"),
            Err(DecodeError::OutOfRange(_))
        ));
        assert_eq!(c.decode(&Command::ReadVoltage, b""), Err(DecodeError::Empty));
        assert!(matches!(
            c.decode(&Command::ReadVoltage, &[0xff, 0xfe]),
            Err(DecodeError::NotText(_))
        ));
    }

    #[test]
    fn test_decode_error_tokens() {
        let c = codec();
        assert_eq!(
            c.decode(&Command::SetVoltage(100.0), b"E01"),
            Err(DecodeError::DeviceRejected("E01".into()))
        );
        assert_eq!(
            c.decode(&Command::ReadSerialNumber, b"C01"),
            Err(DecodeError::DeviceRejected("C01".into()))
        );
    }

    #[test]
    fn test_decode_output_state_tokens() {
        let c = codec();
        assert_eq!(c.decode(&Command::ReadOutput, b"ON").unwrap(), Value::Bool(true));
        assert_eq!(c.decode(&Command::ReadOutput, b"OFF").unwrap(), Value::Bool(false));
        assert_eq!(c.decode(&Command::ReadOutput, b"1").unwrap(), Value::Bool(true));
        assert_eq!(c.decode(&Command::ReadOutput, b"0").unwrap(), Value::Bool(false));
        assert!(c.decode(&Command::ReadOutput, b"MAYBE").is_err());
    }

    #[test]
    fn test_custom_output_tokens() {
        let c = Codec::new(ProtocolDefinition {
            output_on: "1".into(),
            output_off: "0".into(),
            ..ProtocolDefinition::default()
        });
        assert_eq!(c.encode(&Command::SetOutput(true)), b"OUT 1\r");
        assert_eq!(c.format_value(&Value::Bool(false)), "0");
    }

    #[test]
    fn test_decode_text_trims() {
        let c = codec();
        assert_eq!(
            c.decode(&Command::ReadSerialNumber, b" 123A456-0001 ").unwrap(),
            Value::Text("123A456-0001".into())
        );
    }

    #[test]
    fn test_parse_request_errors() {
        let c = codec();
        assert_eq!(c.parse_request(b"FOO?"), Err(RequestParseError::IllegalCommand));
        assert_eq!(c.parse_request(b"XYZ 1"), Err(RequestParseError::IllegalCommand));
        assert_eq!(c.parse_request(b"PV"), Err(RequestParseError::MissingParameter));
        assert_eq!(c.parse_request(b"PV abc"), Err(RequestParseError::IllegalParameter));
        assert_eq!(c.parse_request(b"OUT MAYBE"), Err(RequestParseError::IllegalParameter));
        assert_eq!(c.parse_request(b"ADR 300"), Err(RequestParseError::IllegalParameter));
        assert_eq!(RequestParseError::MissingParameter.token(), "C02");
    }

    #[test]
    fn test_parse_request_accepts_both_output_forms() {
        let c = codec();
        assert_eq!(c.parse_request(b"OUT 1").unwrap(), Command::SetOutput(true));
        assert_eq!(c.parse_request(b"out off").unwrap(), Command::SetOutput(false));
        assert_eq!(c.parse_request(b"mv?").unwrap(), Command::ReadVoltage);
    }
}
