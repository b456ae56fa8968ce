//! Outbound commands and the matchers for their replies.
//!
//! Builders validate their arguments before anything touches the wire, so a
//! bad argument never leaves half a conversation on the link.

use crate::error::{Error, Result};
use crate::packet;
use crate::protocol::{
    ACK, AlertMode, DoseUnit, Language, Opcode, PowerMode, READ_STARTING, READ_STOPPING, READBACK, RateUnit,
    Threshold, decode_datetime, encode_datetime,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;

pub const MAX_BRIGHTNESS: u8 = 5;
pub const MAX_SCREEN_TIMEOUT: u16 = 9999;

/// Selector byte of the timer-duration command.
const TIMER_SET: u8 = 0x00;
const TIMER_GET: u8 = 0x01;
/// Third byte of the timer-duration readback.
pub(crate) const TIMER_GET_SELECTOR: u8 = 0x00;

/// An encoded command: opcode plus argument bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Bytes,
}

impl Command {
    fn new(opcode: Opcode, args: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + args.len());
        payload.put_u8(opcode.byte());
        payload.put_slice(args);
        Self {
            opcode,
            payload: payload.freeze(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Opcode followed by the arguments, unframed.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The full frame for the wire.
    pub fn frame(&self) -> Result<Bytes> {
        packet::encode(&self.payload)
    }

    // --- Builders ---

    pub fn set_time(time: &NaiveDateTime) -> Self {
        Self::new(Opcode::SetTime, &encode_datetime(time))
    }

    pub fn set_rate_limit(value: &str, unit: RateUnit) -> Result<Self> {
        let threshold = Threshold::new(value)?;
        let mut args = Vec::with_capacity(8);
        args.extend_from_slice(threshold.as_bytes());
        args.extend_from_slice(unit.wire());
        Ok(Self::new(Opcode::SetRateLimit, &args))
    }

    pub fn set_dose_limit(value: &str, unit: DoseUnit) -> Result<Self> {
        let threshold = Threshold::new(value)?;
        let mut args = Vec::with_capacity(7);
        args.extend_from_slice(threshold.as_bytes());
        args.extend_from_slice(unit.wire());
        Ok(Self::new(Opcode::SetDoseLimit, &args))
    }

    pub fn get_version() -> Self {
        Self::new(Opcode::GetVersion, &[])
    }

    pub fn get_dose() -> Self {
        Self::new(Opcode::GetDose, &[])
    }

    pub fn set_alert(mode: AlertMode) -> Self {
        Self::new(Opcode::SetAlert, &[mode.bits()])
    }

    /// Screen brightness in `0..=5` and screen-off timeout in seconds, `0..=9999`.
    pub fn set_display(brightness: u8, timeout_secs: u16) -> Result<Self> {
        if brightness > MAX_BRIGHTNESS {
            return Err(Error::Validation(format!(
                "brightness must be in range [0-{MAX_BRIGHTNESS}], got {brightness}"
            )));
        }
        if timeout_secs > MAX_SCREEN_TIMEOUT {
            return Err(Error::Validation(format!(
                "timeout must be in range [0-{MAX_SCREEN_TIMEOUT}], got {timeout_secs}"
            )));
        }
        let mut args = [0u8; 3];
        args[0] = brightness;
        args[1..].copy_from_slice(&timeout_secs.to_be_bytes());
        Ok(Self::new(Opcode::SetDisplay, &args))
    }

    pub fn set_mode(mode: PowerMode) -> Self {
        Self::new(Opcode::SetMode, &[mode.byte()])
    }

    pub fn set_language(language: Language) -> Self {
        Self::new(Opcode::SetLanguage, &[language.into()])
    }

    pub fn get_timer_duration() -> Self {
        Self::new(Opcode::TimerDuration, &[TIMER_GET])
    }

    pub fn set_timer_duration(seconds: u32) -> Self {
        let mut args = [0u8; 5];
        args[0] = TIMER_SET;
        args[1..].copy_from_slice(&seconds.to_be_bytes());
        Self::new(Opcode::TimerDuration, &args)
    }

    pub fn clear_dose() -> Self {
        Self::new(Opcode::ClearDose, &[])
    }

    pub fn start_continuous_read() -> Self {
        Self::new(Opcode::ContinuousRead, &[0x01])
    }

    pub fn stop_continuous_read() -> Self {
        Self::new(Opcode::ContinuousRead, &[0x00])
    }

    pub fn read_dose_history() -> Self {
        Self::new(Opcode::ReadDoseHistory, &[])
    }

    pub fn read_rate_history() -> Self {
        Self::new(Opcode::ReadRateHistory, &[])
    }

    pub fn read_alarm_history() -> Self {
        Self::new(Opcode::ReadAlarmHistory, &[])
    }

    // --- Response matchers ---

    /// Check for `<opcode> 06` and return whatever follows it.
    pub fn check_ack<'a>(&self, response: &'a [u8]) -> Result<&'a [u8]> {
        let expected = [self.opcode.byte(), ACK];
        match response.get(..2) {
            Some(head) if head == expected => Ok(&response[2..]),
            _ => Err(Error::Protocol(format!(
                "{} expected acknowledgement {}, received {}",
                self.opcode,
                hex::encode(expected),
                hex::encode(response)
            ))),
        }
    }

    /// Check for `<opcode> 04 <selector>` and return the reported value bytes.
    pub fn check_readback<'a>(&self, response: &'a [u8], selector: u8) -> Result<&'a [u8]> {
        let expected = [self.opcode.byte(), READBACK, selector];
        match response.get(..3) {
            Some(head) if head == expected => Ok(&response[3..]),
            _ => Err(Error::Protocol(format!(
                "{} expected readback {}, received {}",
                self.opcode,
                hex::encode(expected),
                hex::encode(response)
            ))),
        }
    }
}

/// The two confirmations that bracket continuous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMarker {
    Starting,
    Stopping,
}

impl ReadMarker {
    pub fn bytes(self) -> &'static [u8; 3] {
        match self {
            ReadMarker::Starting => &READ_STARTING,
            ReadMarker::Stopping => &READ_STOPPING,
        }
    }

    pub fn check(self, response: &[u8]) -> Result<()> {
        if response == self.bytes() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "expected continuous read {:?} marker {}, received {}",
                self,
                hex::encode(self.bytes()),
                hex::encode(response)
            )))
        }
    }
}

/// Accumulated dose as reported by get-dose.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DoseReading {
    /// Total dose in μSv.
    pub dose_usv: f64,
    /// When accumulation started.
    pub since: NaiveDateTime,
}

/// `X(u32) D(u32) YY MM DD hh mm`: D counts hundredths of a μSv.
pub fn parse_dose(mut body: &[u8]) -> Result<DoseReading> {
    if body.len() < 13 {
        return Err(Error::Protocol(format!(
            "get-dose reply needs 13 bytes after the acknowledgement, got {}",
            body.len()
        )));
    }
    let _reserved = body.get_u32();
    let counter = body.get_u32();
    let since = decode_datetime(&body[..5])?;
    Ok(DoseReading {
        dose_usv: counter as f64 * 0.01,
        since,
    })
}

/// Readback of the timed-dose period, in seconds.
pub fn parse_timer_duration(mut value: &[u8]) -> Result<u32> {
    if value.len() < 4 {
        return Err(Error::Protocol(format!(
            "timer duration readback needs 4 bytes, got {}",
            value.len()
        )));
    }
    Ok(value.get_u32())
}

/// Firmware identification, sent as NUL separated text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub fields: Vec<String>,
    pub raw: Bytes,
}

pub fn parse_version(body: &[u8]) -> VersionInfo {
    let fields = body
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    VersionInfo {
        fields,
        raw: Bytes::copy_from_slice(body),
    }
}
