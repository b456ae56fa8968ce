//! Simulated meter for running without hardware.
//!
//! [`MockTransport`] decodes every frame written to it and queues the reply a
//! real FS5000 would send. In continuous read it produces one sample frame
//! per configured period. Clones share the same simulated meter, so a test
//! can keep one handle to inspect or inject traffic while a session owns
//! another.
//!
//! ```
//! use fs5000::{Fs5000, MockTransport};
//!
//! # async fn demo() -> fs5000::Result<()> {
//! let mock = MockTransport::new();
//! let mut meter = Fs5000::new(mock.clone());
//! meter.set_display(3, 30).await?;
//! assert_eq!(mock.written_payloads().len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::packet;
use crate::protocol::{ACK, Opcode, READ_STARTING, READ_STOPPING, READBACK};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Longest a read sleeps before looking at the outbox again.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Clock the simulated meter reports: 2025-08-13 14:22:10.
const CLOCK: [u8; 6] = [25, 8, 13, 14, 22, 10];
const VERSION: &[u8] = b"FS5000\0V1.0.2\0";
const ALARMS_PER_PAGE: usize = 8;

/// Build a 16 byte alarm-history record.
pub fn alarm_record(kind: u8, time: NaiveDateTime, threshold: &[u8; 4], unit: &[u8; 4]) -> [u8; 16] {
    let mut record = BytesMut::with_capacity(16);
    record.put_u8(kind);
    record.put_u16(time.year() as u16);
    record.put_slice(&[
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    ]);
    record.put_slice(threshold);
    record.put_slice(unit);
    let mut out = [0u8; 16];
    out.copy_from_slice(&record);
    out
}

fn default_alarms() -> Vec<[u8; 16]> {
    let time = chrono::NaiveDate::from_ymd_opt(2025, 8, 13).and_then(|d| d.and_hms_opt(14, 22, 10));
    match time {
        Some(time) => vec![
            alarm_record(0x01, time, b"2.50", b"uSvh"),
            alarm_record(0x02, time, b"0.01", b"  Sv"),
        ],
        None => Vec::new(),
    }
}

/// Text of the `seq`-th sample. CPS carries the sequence number so tests
/// can check ordering.
fn sample_text(seq: u64) -> String {
    let rate = 0.10 + (seq % 7) as f64 * 0.01;
    format!(
        "DR:{rate:.2}uSv/h;D:{:.2}uSv;CPS:{seq};CPM:{};AVDR:0.12uSv/h;T:00:00:{:02};TD:0.00uSv;AL:OFF;",
        1.63 + seq as f64 * 0.01,
        seq * 60,
        seq % 60
    )
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    outbox: VecDeque<u8>,
    written: Vec<Bytes>,
    streaming: bool,
    next_sample_at: Option<Instant>,
    samples_sent: u64,
    corrupted: bool,
    dose_counter: u32,
    timer_seconds: u32,

    sample_period: Duration,
    sample_limit: Option<u64>,
    corrupt_after: Option<u64>,
    wrong_echo: bool,
    silent: bool,
    start_reply: Option<Vec<u8>>,
    alarms: Vec<[u8; 16]>,
}

impl MockState {
    fn queue(&mut self, payload: &[u8]) {
        match packet::encode(payload) {
            Ok(frame) => self.outbox.extend(frame.iter()),
            Err(e) => warn!(error = %e, "Mock reply does not fit in a frame"),
        }
    }

    fn ack(&mut self, opcode: u8, extra: &[u8]) {
        let mut reply = vec![opcode, ACK];
        reply.extend_from_slice(extra);
        self.queue(&reply);
    }

    fn respond(&mut self, payload: &[u8]) {
        let Some((&op, args)) = payload.split_first() else {
            warn!("Mock received an empty payload");
            return;
        };
        if self.silent {
            return;
        }
        if self.wrong_echo {
            self.ack(op.wrapping_add(1), &[]);
            return;
        }
        let Ok(opcode) = Opcode::try_from(op) else {
            warn!(opcode = op, "Mock received an unknown opcode");
            return;
        };
        match opcode {
            Opcode::GetVersion => self.ack(op, VERSION),
            Opcode::GetDose => {
                let mut extra = Vec::with_capacity(13);
                extra.extend_from_slice(&0u32.to_be_bytes());
                extra.extend_from_slice(&self.dose_counter.to_be_bytes());
                extra.extend_from_slice(&CLOCK[..5]);
                self.ack(op, &extra);
            }
            Opcode::ClearDose => {
                self.dose_counter = 0;
                self.ack(op, &CLOCK);
            }
            Opcode::TimerDuration => match args {
                [0x01, ..] => {
                    let mut reply = vec![op, READBACK, 0x00];
                    reply.extend_from_slice(&self.timer_seconds.to_be_bytes());
                    self.queue(&reply);
                }
                [0x00, a, b, c, d] => {
                    self.timer_seconds = u32::from_be_bytes([*a, *b, *c, *d]);
                    self.ack(op, &[]);
                }
                _ => warn!(args = hex::encode(args), "Mock received a malformed timer command"),
            },
            Opcode::ContinuousRead => match args.first() {
                Some(0x01) => {
                    let reply = self.start_reply.clone().unwrap_or_else(|| READ_STARTING.to_vec());
                    self.queue(&reply);
                    self.streaming = true;
                    self.next_sample_at = Some(Instant::now() + self.sample_period);
                }
                _ => {
                    self.streaming = false;
                    self.next_sample_at = None;
                    self.queue(&READ_STOPPING);
                }
            },
            Opcode::ReadDoseHistory => {
                self.ack(op, &[0x01, 0x00, 0x02]);
                self.queue(&[op, 0x01, 0, 1, 0, 2, 0, 3, 0, 4]);
            }
            Opcode::ReadRateHistory => {
                self.ack(op, &[0x00, 0x01, 0x00, 0x00, 0x02]);
                self.queue(&[op, 0x00, 0x01, 0, 1, 0, 2, 0, 3, 0, 4]);
            }
            Opcode::ReadAlarmHistory => {
                let records = self.alarms.len();
                let pages: Vec<Vec<u8>> = self.alarms.chunks(ALARMS_PER_PAGE).map(|c| c.concat()).collect();
                let mut header = vec![0x00, pages.len() as u8, 0x00];
                header.extend_from_slice(&(records as u16).to_be_bytes());
                self.ack(op, &header);
                for (i, data) in pages.iter().enumerate() {
                    let mut page = vec![op, 0x00, (i + 1) as u8];
                    page.extend_from_slice(data);
                    self.queue(&page);
                }
            }
            Opcode::SetTime
            | Opcode::SetRateLimit
            | Opcode::SetDoseLimit
            | Opcode::SetAlert
            | Opcode::SetDisplay
            | Opcode::SetMode
            | Opcode::SetLanguage => self.ack(op, &[]),
        }
    }

    fn sample_due(&self, now: Instant) -> bool {
        self.streaming
            && self.sample_limit.is_none_or(|limit| self.samples_sent < limit)
            && self.next_sample_at.is_some_and(|at| at <= now)
    }

    /// Queue the next sample if one is due. At most one sample waits in the
    /// outbox; a slow reader sees the backlog drain one frame per read.
    fn produce_sample(&mut self, now: Instant) {
        if self.outbox.is_empty() && self.sample_due(now) {
            self.samples_sent += 1;
            let seq = self.samples_sent;
            let mut payload = vec![Opcode::ContinuousRead.byte()];
            payload.extend_from_slice(sample_text(seq).as_bytes());
            if !self.corrupted && self.corrupt_after.is_some_and(|n| seq > n) {
                self.corrupted = true;
                if let Ok(frame) = packet::encode(&payload) {
                    let mut frame = frame.to_vec();
                    let at = frame.len() - 2;
                    frame[at] = frame[at].wrapping_add(1);
                    trace!(seq, "Mock sending a corrupted sample");
                    self.outbox.extend(frame);
                }
            } else {
                self.queue(&payload);
            }
            self.next_sample_at = self.next_sample_at.map(|at| at + self.sample_period);
        }
    }

    /// Time until something may be readable, capped at `deadline`.
    fn next_wake(&self, now: Instant, deadline: Instant) -> Instant {
        let sample = self
            .next_sample_at
            .filter(|_| self.streaming && self.sample_limit.is_none_or(|l| self.samples_sent < l));
        let wake = sample.map_or(deadline, |at| at.min(deadline));
        wake.min(now + POLL_INTERVAL)
    }
}

/// A simulated FS5000 behind the [`Transport`] trait.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                outbox: VecDeque::new(),
                written: Vec::new(),
                streaming: false,
                next_sample_at: None,
                samples_sent: 0,
                corrupted: false,
                dose_counter: 163,
                timer_seconds: 3600,
                sample_period: DEFAULT_SAMPLE_PERIOD,
                sample_limit: None,
                corrupt_after: None,
                wrong_echo: false,
                silent: false,
                start_reply: None,
                alarms: default_alarms(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Behaviour ---

    pub fn with_sample_period(self, period: Duration) -> Self {
        self.lock().sample_period = period.max(Duration::from_millis(1));
        self
    }

    /// Stop producing samples after `limit`, while staying in continuous read.
    pub fn with_sample_limit(self, limit: u64) -> Self {
        self.lock().sample_limit = Some(limit);
        self
    }

    /// Corrupt the checksum of the sample that follows the first `count`, once.
    pub fn with_corrupt_sample_after(self, count: u64) -> Self {
        self.lock().corrupt_after = Some(count);
        self
    }

    /// Answer every command with the wrong opcode.
    pub fn with_wrong_echo(self) -> Self {
        self.lock().wrong_echo = true;
        self
    }

    /// Never answer anything.
    pub fn silent(self) -> Self {
        self.lock().silent = true;
        self
    }

    /// Reply to start-continuous-read with `payload` instead of the confirmation.
    pub fn with_start_reply(self, payload: &[u8]) -> Self {
        self.lock().start_reply = Some(payload.to_vec());
        self
    }

    pub fn with_alarm_records(self, records: Vec<[u8; 16]>) -> Self {
        self.lock().alarms = records;
        self
    }

    pub fn with_dose_counter(self, hundredths_usv: u32) -> Self {
        self.lock().dose_counter = hundredths_usv;
        self
    }

    // --- Inspection ---

    /// Queue raw bytes ahead of anything the meter sends next.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().outbox.extend(bytes.iter().copied());
    }

    /// Queue a correctly framed packet.
    pub fn inject_packet(&self, payload: &[u8]) {
        self.lock().queue(payload);
    }

    /// Payloads of every frame written so far, in order.
    pub fn written_payloads(&self) -> Vec<Bytes> {
        self.lock().written.clone()
    }

    pub fn samples_sent(&self) -> u64 {
        self.lock().samples_sent
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn timer_seconds(&self) -> u32 {
        self.lock().timer_seconds
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        match packet::decode_frame(data) {
            Ok(payload) => {
                trace!(payload = hex::encode(&payload), "Mock received command");
                state.written.push(payload.clone());
                state.respond(&payload);
            }
            Err(e) => warn!(error = %e, frame = hex::encode(data), "Mock received a bad frame"),
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake = {
                let mut state = self.lock();
                if !state.connected {
                    return Err(Error::NotConnected);
                }
                let now = Instant::now();
                state.produce_sample(now);
                if !state.outbox.is_empty() {
                    let n = buf.len().min(state.outbox.len());
                    for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                if now >= deadline {
                    return Ok(0);
                }
                state.next_wake(now, deadline)
            };
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.streaming = false;
        state.outbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
