mod common;
use common::*;

use chrono::NaiveDate;
use fs5000::mock::alarm_record;
use fs5000::{AlarmKind, AlarmUnit, DoseUnit, LogRecord, RateUnit};

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, s).unwrap()
}

#[tokio::test]
async fn reads_the_alarm_log() {
    let mock = MockTransport::new();
    let mut meter = meter(&mock);

    let alarms = meter.read_alarms().await.unwrap();
    assert_eq!(alarms.len(), 2);

    assert_eq!(alarms[0].index, 1);
    assert_eq!(alarms[0].kind, AlarmKind::Rate);
    assert_eq!(alarms[0].timestamp, at(2025, 8, 13, 14, 22, 10));
    assert_eq!(alarms[0].threshold, "2.50");
    assert_eq!(alarms[0].unit, AlarmUnit::Rate(RateUnit::MicroSievertPerHour));

    assert_eq!(alarms[1].index, 2);
    assert_eq!(alarms[1].kind, AlarmKind::Dose);
    assert_eq!(alarms[1].threshold, "0.01");
    assert_eq!(alarms[1].unit, AlarmUnit::Dose(DoseUnit::Sievert));

    assert_eq!(hex::encode(mock.written_payloads()[0].as_ref()), "10");
}

#[tokio::test]
async fn captured_dose_alarm_record_decodes() {
    let record: [u8; 16] = hex::decode("0207e8030e0a141e302e303120205376").unwrap().try_into().unwrap();
    let mock = MockTransport::new().with_alarm_records(vec![record]);
    let mut meter = meter(&mock);

    let alarms = meter.read_alarms().await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].kind, AlarmKind::Dose);
    assert_eq!(alarms[0].timestamp, at(2024, 3, 14, 10, 20, 30));
    assert_eq!(alarms[0].threshold, "0.01");
    assert_eq!(alarms[0].unit, AlarmUnit::Dose(DoseUnit::Sievert));
}

#[tokio::test]
async fn unknown_records_are_skipped() {
    let time = at(2025, 1, 2, 3, 4, 5);
    let mock = MockTransport::new().with_alarm_records(vec![
        alarm_record(0x01, time, b"1.00", b"mSvh"),
        alarm_record(0x01, time, b"1.00", b"nSvh"),
        alarm_record(0x07, time, b"1.00", b"uSvh"),
        alarm_record(0x02, time, b"5.00", b" mSv"),
    ]);
    let mut meter = meter(&mock);

    let alarms = meter.read_alarms().await.unwrap();
    let indices: Vec<usize> = alarms.iter().map(|a| a.index).collect();
    assert_eq!(indices, vec![1, 4]);
    assert_eq!(alarms[0].unit, AlarmUnit::Rate(RateUnit::MilliSievertPerHour));
    assert_eq!(alarms[1].unit, AlarmUnit::Dose(DoseUnit::MilliSievert));
}

#[tokio::test]
async fn alarm_log_spans_several_pages() {
    let base = at(2025, 6, 1, 0, 0, 0);
    let records = (0..10)
        .map(|i| alarm_record(0x01, base + chrono::Duration::minutes(i), b"0.50", b"uSvh"))
        .collect();
    let mock = MockTransport::new().with_alarm_records(records);
    let mut meter = meter(&mock);

    let alarms = meter.read_alarms().await.unwrap();
    assert_eq!(alarms.len(), 10);
    assert_eq!(alarms[9].index, 10);
    assert_eq!(alarms[9].timestamp, at(2025, 6, 1, 0, 9, 0));
}

#[tokio::test]
async fn empty_alarm_log() {
    let mock = MockTransport::new().with_alarm_records(Vec::new());
    let mut meter = meter(&mock);
    assert!(meter.read_alarms().await.unwrap().is_empty());
}

#[tokio::test]
async fn alarm_log_as_generic_records() {
    let mock = MockTransport::new();
    let mut meter = meter(&mock);
    let log = meter.read_history(fs5000::HistoryKind::Alarm).await.unwrap();
    let records = log.records().unwrap();
    assert_eq!(records.len(), 2);
    assert!(matches!(&records[0], LogRecord::Alarm(a) if a.kind == AlarmKind::Rate));

    let json = serde_json::to_value(&records[1]).unwrap();
    assert_eq!(json["type"], "alarm");
    assert_eq!(json["kind"], "dose");
}

#[tokio::test]
async fn dose_and_rate_logs_are_not_decoded() {
    let mock = MockTransport::new();
    let mut meter = meter(&mock);

    assert!(matches!(meter.read_dose_log().await, Err(Error::NotSupported(_))));
    assert!(matches!(meter.read_rate_log().await, Err(Error::NotSupported(_))));

    // Every page was consumed, so the next exchange lines up.
    let version = meter.get_version().await.unwrap();
    assert_eq!(version.fields[0], "FS5000");
}

#[tokio::test]
async fn dose_and_rate_pages_are_assembled() {
    let mock = MockTransport::new();
    let mut meter = meter(&mock);

    let dose = meter.read_history(fs5000::HistoryKind::Dose).await.unwrap();
    assert_eq!(dose.header.packets, 1);
    assert_eq!(dose.header.records, 2);
    assert_eq!(hex::encode(&dose.data), "0001000200030004");

    let rate = meter.read_history(fs5000::HistoryKind::Rate).await.unwrap();
    assert_eq!(rate.header.packets, 1);
    assert_eq!(hex::encode(&rate.data), "0001000200030004");
}

#[tokio::test]
async fn out_of_order_page_is_a_protocol_error() {
    let mock = MockTransport::new().silent();
    mock.inject_packet(&[0x10, 0x06, 0x00, 0x02, 0x00, 0x00, 0x02]);
    let mut page = vec![0x10, 0x00, 0x02];
    page.extend_from_slice(&alarm_record(0x01, at(2025, 1, 1, 0, 0, 0), b"1.00", b"uSvh"));
    mock.inject_packet(&page);

    let mut meter = meter(&mock);
    assert!(matches!(meter.read_alarms().await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn missing_pages_time_out() {
    let mock = MockTransport::new().silent();
    mock.inject_packet(&[0x10, 0x06, 0x00, 0x01, 0x00, 0x00, 0x01]);
    let mut meter = meter(&mock);
    assert!(matches!(meter.read_alarms().await, Err(Error::Timeout(_))));
}
