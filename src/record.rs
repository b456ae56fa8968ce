//! Multi-packet history logs.
//!
//! A history read is answered by an acknowledgement carrying a header that
//! announces how many pages follow and how many records they hold. Every page
//! repeats the opcode and carries its 1-based index; the data parts of all
//! pages concatenate into one log of fixed-width records.
//!
//! | Log   | Header after `<op> 06`     | Page layout              |
//! |-------|----------------------------|--------------------------|
//! | dose  | `packets:u8 records:u16`   | `03 idx:u8 data`         |
//! | rate  | `packets:u16 00 records:u16` | `0F idx:u16 data`      |
//! | alarm | `xx packets:u8 xx records:u16` | `10 xx idx:u8 data`  |
//!
//! Only alarm records have a known layout. The dose and rate record formats
//! have not been worked out, so decoding them fails with
//! [`Error::NotSupported`] instead of guessing.

use crate::error::{Error, Result};
use crate::protocol::{DoseUnit, Opcode, RateUnit};
use bytes::{Buf, Bytes, BytesMut};
use chrono::{NaiveDate, NaiveDateTime};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;
use strum_macros::Display;
use tracing::{debug, error, trace};

/// Width of one alarm record.
pub const ALARM_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum HistoryKind {
    #[strum(to_string = "dose")]
    Dose,
    #[strum(to_string = "rate")]
    Rate,
    #[strum(to_string = "alarm")]
    Alarm,
}

/// Counts announced before the pages are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryHeader {
    pub packets: u16,
    pub records: u16,
}

impl HistoryKind {
    pub fn opcode(self) -> Opcode {
        match self {
            HistoryKind::Dose => Opcode::ReadDoseHistory,
            HistoryKind::Rate => Opcode::ReadRateHistory,
            HistoryKind::Alarm => Opcode::ReadAlarmHistory,
        }
    }

    fn header_len(self) -> usize {
        match self {
            HistoryKind::Dose => 3,
            HistoryKind::Rate | HistoryKind::Alarm => 5,
        }
    }

    /// Decode the header that follows the acknowledgement.
    pub fn parse_header(self, body: &[u8]) -> Result<HistoryHeader> {
        if body.len() < self.header_len() {
            return Err(Error::Protocol(format!(
                "{self} history header needs {} bytes, got {}",
                self.header_len(),
                body.len()
            )));
        }
        let mut buf = body;
        let header = match self {
            HistoryKind::Dose => HistoryHeader {
                packets: buf.get_u8() as u16,
                records: buf.get_u16(),
            },
            HistoryKind::Rate => {
                let packets = buf.get_u16();
                buf.advance(1);
                HistoryHeader {
                    packets,
                    records: buf.get_u16(),
                }
            }
            HistoryKind::Alarm => {
                buf.advance(1);
                let packets = buf.get_u8() as u16;
                buf.advance(1);
                HistoryHeader {
                    packets,
                    records: buf.get_u16(),
                }
            }
        };
        Ok(header)
    }

    /// Check a page's opcode and index and return its data part.
    pub fn page_data(self, page: &[u8], expected: u32) -> Result<Bytes> {
        let opcode = self.opcode().byte();
        let (index, data_at) = match (self, page) {
            (HistoryKind::Dose, [op, idx, ..]) if *op == opcode => (*idx as u16, 2),
            (HistoryKind::Rate, [op, hi, lo, ..]) if *op == opcode => (u16::from_be_bytes([*hi, *lo]), 3),
            (HistoryKind::Alarm, [op, _, idx, ..]) if *op == opcode => (*idx as u16, 3),
            _ => {
                return Err(Error::Protocol(format!(
                    "{self} history page {expected}: expected opcode {opcode:#04x}, received {}",
                    hex::encode(page)
                )));
            }
        };
        if u32::from(index) != expected {
            return Err(Error::Protocol(format!(
                "{self} history page index {index}, expected {expected}"
            )));
        }
        Ok(Bytes::copy_from_slice(&page[data_at..]))
    }
}

/// Concatenates history pages in order, checking each one as it arrives.
#[derive(Debug)]
pub struct HistoryAssembler {
    kind: HistoryKind,
    header: HistoryHeader,
    /// Index of the page expected next. Wider than the announced count so
    /// it can step past `u16::MAX`.
    next: u32,
    data: BytesMut,
}

impl HistoryAssembler {
    pub fn new(kind: HistoryKind, header: HistoryHeader) -> Self {
        Self {
            kind,
            header,
            next: 1,
            data: BytesMut::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next > u32::from(self.header.packets)
    }

    pub fn push(&mut self, page: &[u8]) -> Result<()> {
        if self.is_complete() {
            return Err(Error::Protocol(format!(
                "{} history: unexpected page beyond the announced {}",
                self.kind, self.header.packets
            )));
        }
        let data = self.kind.page_data(page, self.next)?;
        trace!(kind = %self.kind, page = self.next, len = data.len(), "History page accepted");
        self.data.extend_from_slice(&data);
        self.next += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<HistoryLog> {
        if !self.is_complete() {
            return Err(Error::Protocol(format!(
                "{} history ended after {} of {} pages",
                self.kind,
                self.next - 1,
                self.header.packets
            )));
        }
        debug!(kind = %self.kind, bytes = hex::encode(&self.data), "History log assembled");
        Ok(HistoryLog {
            kind: self.kind,
            header: self.header,
            data: self.data.freeze(),
        })
    }
}

/// The concatenated data of every page of one history read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLog {
    pub kind: HistoryKind,
    pub header: HistoryHeader,
    pub data: Bytes,
}

impl HistoryLog {
    /// Decode the log into records.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        match self.kind {
            HistoryKind::Alarm => Ok(self.alarms()?.into_iter().map(LogRecord::Alarm).collect()),
            kind => Err(Error::NotSupported(format!(
                "decoding {kind} history records ({} records, {} bytes)",
                self.header.records,
                self.data.len()
            ))),
        }
    }

    /// Decode an alarm log.
    ///
    /// Records with an unknown kind, unit or date are logged and skipped; the
    /// rest of the log still decodes.
    pub fn alarms(&self) -> Result<Vec<AlarmRecord>> {
        if self.kind != HistoryKind::Alarm {
            return Err(Error::Protocol(format!("{} history is not an alarm log", self.kind)));
        }
        let needed = self.header.records as usize * ALARM_RECORD_LEN;
        if self.data.len() < needed {
            return Err(Error::Protocol(format!(
                "alarm log announces {} records ({needed} bytes) but holds {} bytes",
                self.header.records,
                self.data.len()
            )));
        }
        let mut alarms = Vec::with_capacity(self.header.records as usize);
        for (i, chunk) in self.data[..needed].chunks_exact(ALARM_RECORD_LEN).enumerate() {
            let index = i + 1;
            match AlarmRecord::decode(index, chunk) {
                Ok(record) => {
                    trace!(%record, "Alarm record decoded");
                    alarms.push(record);
                }
                Err(e) => error!(index, record = hex::encode(chunk), error = %e, "Skipping alarm record"),
            }
        }
        Ok(alarms)
    }
}

/// One decoded history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Alarm(AlarmRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display, Serialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    #[strum(to_string = "rate")]
    Rate = 0x01,
    #[strum(to_string = "dose")]
    Dose = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AlarmUnit {
    Rate(RateUnit),
    Dose(DoseUnit),
}

impl fmt::Display for AlarmUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmUnit::Rate(u) => u.fmt(f),
            AlarmUnit::Dose(u) => u.fmt(f),
        }
    }
}

/// `kind:u8 year:u16 month day hour minute second threshold[4] unit[4]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmRecord {
    /// 1-based position in the log.
    pub index: usize,
    pub kind: AlarmKind,
    pub timestamp: NaiveDateTime,
    pub threshold: String,
    pub unit: AlarmUnit,
}

impl AlarmRecord {
    pub fn decode(index: usize, record: &[u8]) -> Result<Self> {
        if record.len() != ALARM_RECORD_LEN {
            return Err(Error::Protocol(format!(
                "alarm record is {} bytes, expected {ALARM_RECORD_LEN}",
                record.len()
            )));
        }
        let mut buf = record;
        let kind_byte = buf.get_u8();
        let kind = AlarmKind::try_from(kind_byte)
            .map_err(|_| Error::Protocol(format!("unknown alarm kind {kind_byte:#04x}")))?;
        let year = buf.get_u16() as i32;
        let [month, day, hour, minute, second] = [buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()];
        let timestamp = NaiveDate::from_ymd_opt(year, month as u32, day as u32)
            .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
            .ok_or_else(|| Error::Protocol(format!("invalid alarm timestamp {}", hex::encode(&record[1..8]))))?;
        let threshold = String::from_utf8_lossy(&buf[..4]).into_owned();
        let unit_field = &buf[4..8];
        let unit = match kind {
            AlarmKind::Rate => RateUnit::from_wire(unit_field).map(AlarmUnit::Rate),
            // Dose alarms pad the three byte unit with one extra leading byte.
            AlarmKind::Dose => DoseUnit::from_wire(&unit_field[1..]).map(AlarmUnit::Dose),
        }
        .ok_or_else(|| {
            Error::Protocol(format!(
                "unknown {kind} alarm unit {:?}",
                String::from_utf8_lossy(unit_field)
            ))
        })?;
        Ok(Self {
            index,
            kind,
            timestamp,
            threshold,
            unit,
        })
    }
}

impl fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} alarm >={} {}",
            self.index, self.timestamp, self.kind, self.threshold, self.unit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm(kind: u8, threshold: &[u8; 4], unit: &[u8; 4]) -> Vec<u8> {
        let mut r = vec![kind, 0x07, 0xE8, 3, 14, 10, 20, 30];
        r.extend_from_slice(threshold);
        r.extend_from_slice(unit);
        r
    }

    #[test]
    fn header_layouts() {
        let dose = HistoryKind::Dose.parse_header(&[0x02, 0x00, 0x30]).unwrap();
        assert_eq!(dose, HistoryHeader { packets: 2, records: 48 });
        let rate = HistoryKind::Rate.parse_header(&[0x01, 0x02, 0x00, 0x10, 0x00]).unwrap();
        assert_eq!(rate, HistoryHeader { packets: 258, records: 4096 });
        let alarm = HistoryKind::Alarm.parse_header(&[0xFF, 0x01, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(alarm, HistoryHeader { packets: 1, records: 3 });
        assert!(matches!(HistoryKind::Rate.parse_header(&[0x00, 0x01]), Err(Error::Protocol(_))));
    }

    #[test]
    fn page_index_checked() {
        assert_eq!(HistoryKind::Dose.page_data(&[0x03, 0x01, 0xAB], 1).unwrap().as_ref(), &[0xAB]);
        assert_eq!(HistoryKind::Rate.page_data(&[0x0F, 0x01, 0x00, 0xCD], 256).unwrap().as_ref(), &[0xCD]);
        assert_eq!(HistoryKind::Alarm.page_data(&[0x10, 0x00, 0x02, 0xEF], 2).unwrap().as_ref(), &[0xEF]);
        assert!(matches!(HistoryKind::Dose.page_data(&[0x03, 0x02, 0xAB], 1), Err(Error::Protocol(_))));
        assert!(matches!(HistoryKind::Dose.page_data(&[0x0F, 0x01, 0xAB], 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn assembler_concatenates_and_counts() {
        let header = HistoryHeader { packets: 2, records: 0 };
        let mut asm = HistoryAssembler::new(HistoryKind::Dose, header);
        asm.push(&[0x03, 0x01, 0x01, 0x02]).unwrap();
        assert!(!asm.is_complete());
        asm.push(&[0x03, 0x02, 0x03]).unwrap();
        assert!(asm.push(&[0x03, 0x03]).is_err());
        let log = asm.finish().unwrap();
        assert_eq!(log.data.as_ref(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn assembler_accepts_the_largest_page_count() {
        let header = HistoryHeader { packets: u16::MAX, records: 0 };
        let mut asm = HistoryAssembler::new(HistoryKind::Rate, header);
        for index in 1..=u16::MAX {
            let [hi, lo] = index.to_be_bytes();
            asm.push(&[0x0F, hi, lo]).unwrap();
        }
        assert!(asm.is_complete());
        assert!(matches!(asm.push(&[0x0F, 0x00, 0x00]), Err(Error::Protocol(_))));
        let log = asm.finish().unwrap();
        assert_eq!(log.header.packets, u16::MAX);
        assert!(log.data.is_empty());
    }

    #[test]
    fn incomplete_assembly_fails() {
        let asm = HistoryAssembler::new(HistoryKind::Alarm, HistoryHeader { packets: 1, records: 0 });
        assert!(matches!(asm.finish(), Err(Error::Protocol(_))));
    }

    #[test]
    fn dose_and_rate_records_not_supported() {
        for kind in [HistoryKind::Dose, HistoryKind::Rate] {
            let log = HistoryLog {
                kind,
                header: HistoryHeader { packets: 1, records: 2 },
                data: Bytes::from_static(&[0u8; 16]),
            };
            assert!(matches!(log.records(), Err(Error::NotSupported(_))));
        }
    }

    #[test]
    fn dose_alarm_drops_leading_unit_byte() {
        let record = AlarmRecord::decode(1, &alarm(0x02, b"0.01", b"  Sv")).unwrap();
        assert_eq!(record.kind, AlarmKind::Dose);
        assert_eq!(record.threshold, "0.01");
        assert_eq!(record.unit, AlarmUnit::Dose(DoseUnit::Sievert));
        assert_eq!(record.timestamp.to_string(), "2024-03-14 10:20:30");
    }

    #[test]
    fn rate_alarm_uses_full_unit() {
        let record = AlarmRecord::decode(1, &alarm(0x01, b"2.50", b"uSvh")).unwrap();
        assert_eq!(record.unit, AlarmUnit::Rate(RateUnit::MicroSievertPerHour));
        assert_eq!(record.to_string(), "#1 2024-03-14 10:20:30 rate alarm >=2.50 μSv/h");
    }

    #[test]
    fn unknown_unit_skips_only_that_record() {
        let mut data = alarm(0x01, b"1.00", b"mSvh");
        data.extend(alarm(0x02, b"9.99", b"xxxx"));
        data.extend(alarm(0x02, b"0.50", b" mSv"));
        let log = HistoryLog {
            kind: HistoryKind::Alarm,
            header: HistoryHeader { packets: 1, records: 3 },
            data: Bytes::from(data),
        };
        let alarms = log.alarms().unwrap();
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].index, 1);
        assert_eq!(alarms[1].index, 3);
        assert_eq!(alarms[1].unit, AlarmUnit::Dose(DoseUnit::MilliSievert));
    }

    #[test]
    fn short_alarm_log_rejected() {
        let log = HistoryLog {
            kind: HistoryKind::Alarm,
            header: HistoryHeader { packets: 1, records: 2 },
            data: Bytes::from(alarm(0x01, b"1.00", b"mSvh")),
        };
        assert!(matches!(log.alarms(), Err(Error::Protocol(_))));
    }

    #[test]
    fn alarm_json_shape() {
        let record = AlarmRecord::decode(2, &alarm(0x02, b"0.01", b"  Sv")).unwrap();
        let json = serde_json::to_value(LogRecord::Alarm(record)).unwrap();
        assert_eq!(json["type"], "alarm");
        assert_eq!(json["kind"], "dose");
        assert_eq!(json["unit"], "Sv");
        assert_eq!(json["timestamp"], "2024-03-14T10:20:30");
    }
}
