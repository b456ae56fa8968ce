//! # FS5000 serial protocol
//!
//! Constants, opcodes and argument types for the FS5000 dosimeter. The meter
//! enumerates as a CH340 USB serial bridge and talks a small half-duplex
//! binary protocol at 115200 baud.
//!
//! ## Protocol Overview
//!
//! Every message in either direction is wrapped in the same frame
//! (see [`crate::packet`]):
//!
//! ```text
//! AA LL <payload...> CC 55
//! ```
//!
//! The first payload byte is always an [`Opcode`]. The meter answers a
//! command by echoing its opcode followed by a status byte: [`ACK`] for a
//! plain acknowledgement, [`READBACK`] when it reports a stored value. While
//! continuous read is active it pushes unsolicited `0E <text>` samples until
//! told to stop.
//!
//! Timestamps travel as one byte per component with a two digit year. The
//! driver assumes every year lives in `2000..=2099`, same as the meter's
//! firmware, so dates from 2100 onward wrap back to 2000. This is a known
//! limitation of the device and is kept as is.

use crate::error::{Error, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;
use tracing::warn;

// --- Constants ---

/// Serial line speed used by the meter.
pub const BAUD_RATE: u32 = 115_200;

/// Plain acknowledgement status byte, sent right after the echoed opcode.
pub const ACK: u8 = 0x06;
/// Status byte of a response that reports a stored value.
pub const READBACK: u8 = 0x04;

/// Sent by the meter once continuous read has started.
pub const READ_STARTING: [u8; 3] = [0x0E, ACK, 0x01];
/// Sent by the meter once continuous read has stopped.
pub const READ_STOPPING: [u8; 3] = [0x0E, ACK, 0x00];

/// Device timestamps store `year - BASE_YEAR` in a single byte.
pub const BASE_YEAR: i32 = 2000;

// --- Opcodes ---

/// Command opcodes, the first byte of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display)]
#[repr(u8)]
pub enum Opcode {
    #[strum(to_string = "set-time")]
    SetTime = 0x01,
    #[strum(to_string = "read-dose-history")]
    ReadDoseHistory = 0x03,
    #[strum(to_string = "set-rate-limit")]
    SetRateLimit = 0x04,
    #[strum(to_string = "set-dose-limit")]
    SetDoseLimit = 0x05,
    #[strum(to_string = "get-version")]
    GetVersion = 0x06,
    #[strum(to_string = "get-dose")]
    GetDose = 0x07,
    #[strum(to_string = "set-alert")]
    SetAlert = 0x08,
    #[strum(to_string = "set-display")]
    SetDisplay = 0x09,
    #[strum(to_string = "set-mode")]
    SetMode = 0x0A,
    #[strum(to_string = "set-language")]
    SetLanguage = 0x0B,
    #[strum(to_string = "timer-duration")]
    TimerDuration = 0x0C,
    #[strum(to_string = "clear-dose")]
    ClearDose = 0x0D,
    #[strum(to_string = "continuous-read")]
    ContinuousRead = 0x0E,
    #[strum(to_string = "read-rate-history")]
    ReadRateHistory = 0x0F,
    #[strum(to_string = "read-alarm-history")]
    ReadAlarmHistory = 0x10,
}

impl Opcode {
    pub fn byte(self) -> u8 {
        self.into()
    }
}

// --- Units ---

/// Unit of a dose-rate threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, serde::Serialize)]
pub enum RateUnit {
    #[strum(to_string = "mSv/h")]
    #[serde(rename = "mSv/h")]
    MilliSievertPerHour,
    #[strum(to_string = "μSv/h")]
    #[serde(rename = "μSv/h")]
    MicroSievertPerHour,
}

impl RateUnit {
    /// Four byte tag used on the wire.
    pub fn wire(self) -> &'static [u8; 4] {
        match self {
            RateUnit::MilliSievertPerHour => b"mSvh",
            RateUnit::MicroSievertPerHour => b"uSvh",
        }
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"mSvh" => Some(RateUnit::MilliSievertPerHour),
            b"uSvh" => Some(RateUnit::MicroSievertPerHour),
            _ => None,
        }
    }
}

impl FromStr for RateUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mSvh" | "mSv/h" => Ok(RateUnit::MilliSievertPerHour),
            "uSvh" | "uSv/h" | "μSv/h" | "µSv/h" => Ok(RateUnit::MicroSievertPerHour),
            other => Err(Error::Validation(format!(
                "rate unit must be 'uSvh' or 'mSvh', got {other:?}"
            ))),
        }
    }
}

/// Unit of an accumulated-dose threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, serde::Serialize)]
pub enum DoseUnit {
    #[strum(to_string = "Sv")]
    #[serde(rename = "Sv")]
    Sievert,
    #[strum(to_string = "mSv")]
    #[serde(rename = "mSv")]
    MilliSievert,
    #[strum(to_string = "μSv")]
    #[serde(rename = "μSv")]
    MicroSievert,
}

impl DoseUnit {
    /// Three byte tag used on the wire. Sieverts are padded with a leading space.
    pub fn wire(self) -> &'static [u8; 3] {
        match self {
            DoseUnit::Sievert => b" Sv",
            DoseUnit::MilliSievert => b"mSv",
            DoseUnit::MicroSievert => b"uSv",
        }
    }

    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b" Sv" => Some(DoseUnit::Sievert),
            b"mSv" => Some(DoseUnit::MilliSievert),
            b"uSv" => Some(DoseUnit::MicroSievert),
            _ => None,
        }
    }
}

impl FromStr for DoseUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Sv" => Ok(DoseUnit::Sievert),
            "mSv" => Ok(DoseUnit::MilliSievert),
            "uSv" | "μSv" | "µSv" => Ok(DoseUnit::MicroSievert),
            other => Err(Error::Validation(format!(
                "dose unit must be 'uSv', 'mSv' or 'Sv', got {other:?}"
            ))),
        }
    }
}

// --- Settings ---

/// Four character alarm threshold such as `"2.50"`, sent as ASCII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Threshold([u8; 4]);

impl Threshold {
    pub const DIGITS: &'static str = ".0123456789";

    pub fn new(value: &str) -> Result<Self> {
        let count = value.chars().count();
        if count != 4 {
            return Err(Error::Validation(format!(
                "threshold must be exactly 4 characters, e.g. '2.50' (got {count})"
            )));
        }
        if let Some(bad) = value.chars().find(|c| !Self::DIGITS.contains(*c)) {
            return Err(Error::Validation(format!(
                "threshold must only use the characters {:?}, found {bad:?}",
                Self::DIGITS
            )));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(value.as_bytes());
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII from DIGITS gets in through `new`.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for Threshold {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Threshold::new(s)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User interface language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Display)]
#[repr(u8)]
pub enum Language {
    Chinese = 0x00,
    English = 0x01,
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chinese" | "zh" => Ok(Language::Chinese),
            "english" | "en" => Ok(Language::English),
            other => Err(Error::Validation(format!(
                "language must be 'english' or 'chinese', got {other:?}"
            ))),
        }
    }
}

/// Power profile. Long endurance trades display responsiveness for battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PowerMode {
    Normal,
    LongEndurance,
}

impl PowerMode {
    pub fn byte(self) -> u8 {
        match self {
            PowerMode::Normal => 0x00,
            PowerMode::LongEndurance => 0x01,
        }
    }
}

impl FromStr for PowerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(PowerMode::Normal),
            "long-endurance" | "endurance" => Ok(PowerMode::LongEndurance),
            other => Err(Error::Validation(format!(
                "mode must be 'normal' or 'long-endurance', got {other:?}"
            ))),
        }
    }
}

/// How the meter signals an alarm. Any combination is allowed, including none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertMode {
    pub lamp: bool,
    pub sound: bool,
    pub vibrate: bool,
    pub click: bool,
}

impl AlertMode {
    const LAMP: u8 = 0x01;
    const SOUND: u8 = 0x02;
    const VIBRATE: u8 = 0x04;
    const CLICK: u8 = 0x08;

    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.lamp {
            bits |= Self::LAMP;
        }
        if self.sound {
            bits |= Self::SOUND;
        }
        if self.vibrate {
            bits |= Self::VIBRATE;
        }
        if self.click {
            bits |= Self::CLICK;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            lamp: bits & Self::LAMP != 0,
            sound: bits & Self::SOUND != 0,
            vibrate: bits & Self::VIBRATE != 0,
            click: bits & Self::CLICK != 0,
        }
    }
}

/// Parses a comma separated list such as `"lamp,vibrate"`. `"none"` or an
/// empty string silences every channel.
impl FromStr for AlertMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut mode = AlertMode::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_ascii_lowercase().as_str() {
                "lamp" | "light" => mode.lamp = true,
                "sound" | "beep" => mode.sound = true,
                "vibrate" | "vibe" => mode.vibrate = true,
                "click" => mode.click = true,
                "none" => {}
                other => {
                    return Err(Error::Validation(format!(
                        "alert channel must be one of lamp, sound, vibrate, click, got {other:?}"
                    )));
                }
            }
        }
        Ok(mode)
    }
}

// --- Timestamps ---

/// Encodes `YY MM DD hh mm ss` with the year relative to [`BASE_YEAR`].
pub fn encode_datetime(time: &NaiveDateTime) -> [u8; 6] {
    if !(BASE_YEAR..BASE_YEAR + 100).contains(&time.year()) {
        warn!(year = time.year(), "year outside 2000-2099 will be read back as {}", BASE_YEAR + time.year().rem_euclid(100));
    }
    [
        time.year().rem_euclid(100) as u8,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    ]
}

/// Decodes `YY MM DD hh mm [ss]`. Five bytes means no seconds field.
pub fn decode_datetime(bytes: &[u8]) -> Result<NaiveDateTime> {
    if bytes.len() < 5 {
        return Err(Error::Protocol(format!(
            "timestamp needs at least 5 bytes, got {}",
            bytes.len()
        )));
    }
    let second = bytes.get(5).copied().unwrap_or(0);
    NaiveDate::from_ymd_opt(BASE_YEAR + bytes[0] as i32, bytes[1] as u32, bytes[2] as u32)
        .and_then(|d| d.and_hms_opt(bytes[3] as u32, bytes[4] as u32, second as u32))
        .ok_or_else(|| Error::Protocol(format!("invalid device timestamp {}", hex::encode(&bytes[..bytes.len().min(6)]))))
}
