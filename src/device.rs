//! Session with one meter.
//!
//! [`Fs5000`] owns the transport and is the only thing that reads or writes
//! it. Commands are strictly request/response; replies are matched by the
//! echoed opcode. Continuous read moves the session through
//! `Idle -> Starting -> Streaming -> Stopping -> Idle`, and no other command
//! may be sent until it is back in `Idle`.

use crate::command::{self, Command, DoseReading, ReadMarker, TIMER_GET_SELECTOR, VersionInfo};
use crate::discovery;
use crate::error::{Error, Result};
use crate::packet;
use crate::protocol::{ACK, AlertMode, BAUD_RATE, DoseUnit, Language, Opcode, PowerMode, RateUnit, decode_datetime};
use crate::record::{AlarmRecord, HistoryAssembler, HistoryKind, HistoryLog, LogRecord};
use crate::sample::Sample;
use crate::transport::{SerialTransport, Transport};
use bytes::Bytes;
use chrono::{Local, NaiveDateTime};
use futures_lite::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 10;
pub const DEFAULT_STREAM_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on every single transport read.
    pub read_timeout: Duration,
    /// Reads allowed while waiting for a start or stop confirmation.
    pub handshake_attempts: u32,
    /// Samples buffered between the reader task and a [`SampleStream`] consumer.
    pub stream_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

pub struct Fs5000<T: Transport = Box<dyn Transport>> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
}

impl Fs5000 {
    /// Open the meter on `port`, or on the first attached meter when `port` is `None`.
    pub async fn open(port: Option<&str>, config: SessionConfig) -> Result<Self> {
        let port = match port {
            Some(port) => port.to_string(),
            None => discovery::find_port()?,
        };
        info!(port = %port, "Connecting to FS5000");
        let transport = SerialTransport::open(&port, BAUD_RATE).await?;
        Ok(Self::with_config(Box::new(transport), config))
    }
}

impl<T: Transport> Fs5000<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn close(mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            self.stop_read().await?;
        }
        self.transport.close().await
    }

    // --- Exchanges ---

    async fn send(&mut self, command: &Command) -> Result<()> {
        let frame = command.frame()?;
        debug!(opcode = %command.opcode(), frame = hex::encode(&frame), "Sending command");
        self.transport.write_all(&frame).await
    }

    /// Read one packet. `None` means the line stayed quiet for a whole read window.
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        packet::read_packet(&mut self.transport, self.config.read_timeout).await
    }

    fn ensure_idle(&self, command: &Command) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Validation(format!(
                "cannot send {} while the session is {}",
                command.opcode(),
                self.state
            )));
        }
        Ok(())
    }

    /// Read the packet that answers `command`.
    async fn reply(&mut self, command: &Command) -> Result<Bytes> {
        self.recv()
            .await?
            .ok_or_else(|| Error::Timeout(format!("no reply to {}", command.opcode())))
    }

    /// Send `command` and return its reply packet.
    async fn request(&mut self, command: &Command) -> Result<Bytes> {
        self.ensure_idle(command)?;
        self.send(command).await?;
        self.reply(command).await
    }

    /// Send `command`, check the acknowledgement and return what follows it.
    async fn exchange_ack(&mut self, command: &Command) -> Result<Bytes> {
        let reply = self.request(command).await?;
        let body = command.check_ack(&reply)?;
        Ok(reply.slice_ref(body))
    }

    // --- Commands ---

    /// Set the meter clock, to the local time when `time` is `None`.
    ///
    /// The meter stores a two digit year and reads it back as 20YY, so
    /// dates outside 2000-2099 do not survive a round trip.
    pub async fn set_time(&mut self, time: Option<NaiveDateTime>) -> Result<()> {
        let time = time.unwrap_or_else(|| Local::now().naive_local());
        self.exchange_ack(&Command::set_time(&time)).await?;
        info!(%time, "Clock set");
        Ok(())
    }

    pub async fn set_rate_limit(&mut self, value: &str, unit: RateUnit) -> Result<()> {
        self.exchange_ack(&Command::set_rate_limit(value, unit)?).await?;
        info!(value, %unit, "Dose rate alarm set");
        Ok(())
    }

    pub async fn set_dose_limit(&mut self, value: &str, unit: DoseUnit) -> Result<()> {
        self.exchange_ack(&Command::set_dose_limit(value, unit)?).await?;
        info!(value, %unit, "Dose alarm set");
        Ok(())
    }

    pub async fn get_version(&mut self) -> Result<VersionInfo> {
        let body = self.exchange_ack(&Command::get_version()).await?;
        Ok(command::parse_version(&body))
    }

    pub async fn get_dose(&mut self) -> Result<DoseReading> {
        let body = self.exchange_ack(&Command::get_dose()).await?;
        command::parse_dose(&body)
    }

    pub async fn set_alert(&mut self, mode: AlertMode) -> Result<()> {
        self.exchange_ack(&Command::set_alert(mode)).await?;
        Ok(())
    }

    pub async fn set_display(&mut self, brightness: u8, timeout_secs: u16) -> Result<()> {
        self.exchange_ack(&Command::set_display(brightness, timeout_secs)?).await?;
        Ok(())
    }

    pub async fn set_mode(&mut self, mode: PowerMode) -> Result<()> {
        self.exchange_ack(&Command::set_mode(mode)).await?;
        Ok(())
    }

    pub async fn set_language(&mut self, language: Language) -> Result<()> {
        self.exchange_ack(&Command::set_language(language)).await?;
        Ok(())
    }

    /// Period of the timed-dose measurement, in seconds.
    pub async fn get_timer_duration(&mut self) -> Result<u32> {
        let cmd = Command::get_timer_duration();
        let reply = self.request(&cmd).await?;
        command::parse_timer_duration(cmd.check_readback(&reply, TIMER_GET_SELECTOR)?)
    }

    pub async fn set_timer_duration(&mut self, seconds: u32) -> Result<()> {
        self.exchange_ack(&Command::set_timer_duration(seconds)).await?;
        Ok(())
    }

    /// Reset the accumulated dose. Returns the time the meter recorded for the reset.
    pub async fn clear_dose(&mut self) -> Result<NaiveDateTime> {
        let body = self.exchange_ack(&Command::clear_dose()).await?;
        if body.len() < 6 {
            return Err(Error::Protocol(format!(
                "clear-dose reply needs a 6 byte timestamp, got {}",
                hex::encode(&body)
            )));
        }
        decode_datetime(&body[..6])
    }

    // --- History ---

    /// Fetch every page of a history log.
    pub async fn read_history(&mut self, kind: HistoryKind) -> Result<HistoryLog> {
        let cmd = match kind {
            HistoryKind::Dose => Command::read_dose_history(),
            HistoryKind::Rate => Command::read_rate_history(),
            HistoryKind::Alarm => Command::read_alarm_history(),
        };
        let body = self.exchange_ack(&cmd).await?;
        let header = kind.parse_header(&body)?;
        debug!(%kind, packets = header.packets, records = header.records, "Reading history");
        let mut assembler = HistoryAssembler::new(kind, header);
        while !assembler.is_complete() {
            let page = self.reply(&cmd).await?;
            assembler.push(&page)?;
        }
        assembler.finish()
    }

    /// Dose history. The pages are read off the meter, but the record layout
    /// is unknown, so this always ends in [`Error::NotSupported`].
    pub async fn read_dose_log(&mut self) -> Result<Vec<LogRecord>> {
        self.read_history(HistoryKind::Dose).await?.records()
    }

    /// Dose-rate history. Same limitation as [`Self::read_dose_log`].
    pub async fn read_rate_log(&mut self) -> Result<Vec<LogRecord>> {
        self.read_history(HistoryKind::Rate).await?.records()
    }

    pub async fn read_alarms(&mut self) -> Result<Vec<AlarmRecord>> {
        let alarms = self.read_history(HistoryKind::Alarm).await?.alarms()?;
        for alarm in &alarms {
            info!(%alarm, "Alarm");
        }
        Ok(alarms)
    }

    // --- Continuous read ---

    /// Switch the meter into continuous read.
    ///
    /// Anything but the start confirmation is fatal. If the confirmation
    /// never comes, a stop is still attempted before the error is returned
    /// so the meter is not left streaming.
    pub async fn start_read(&mut self) -> Result<()> {
        let cmd = Command::start_continuous_read();
        self.ensure_idle(&cmd)?;
        self.state = SessionState::Starting;
        match self.await_start(&cmd).await {
            Ok(()) => {
                self.state = SessionState::Streaming;
                info!("Continuous read started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Continuous read failed to start");
                if let Err(stop) = self.stop_read().await {
                    warn!(error = %stop, "Stop after failed start also failed");
                }
                Err(e)
            }
        }
    }

    async fn await_start(&mut self, cmd: &Command) -> Result<()> {
        self.send(cmd).await?;
        for attempt in 1..=self.config.handshake_attempts {
            match self.recv().await? {
                Some(reply) => return ReadMarker::Starting.check(&reply),
                None => trace!(attempt, "Waiting for start confirmation"),
            }
        }
        Err(Error::Timeout(format!(
            "no start confirmation after {} reads",
            self.config.handshake_attempts
        )))
    }

    /// Leave continuous read and wait for the stop confirmation.
    ///
    /// Samples still in flight are discarded. Framing and checksum errors
    /// are retried, but a well-formed wrong reply is fatal. Every iteration
    /// counts against the handshake budget. The session ends up `Idle` either
    /// way.
    pub async fn stop_read(&mut self) -> Result<()> {
        self.state = SessionState::Stopping;
        let result = self.await_stop().await;
        self.state = SessionState::Idle;
        match &result {
            Ok(()) => info!("Continuous read stopped"),
            Err(e) => error!(error = %e, "Stop handshake failed"),
        }
        result
    }

    async fn await_stop(&mut self) -> Result<()> {
        self.send(&Command::stop_continuous_read()).await?;
        let sample_marker = Opcode::ContinuousRead.byte();
        for attempt in 1..=self.config.handshake_attempts {
            match self.recv().await {
                Ok(Some(reply)) if reply.as_ref() == ReadMarker::Stopping.bytes() => return Ok(()),
                Ok(Some(reply)) if reply.first() == Some(&sample_marker) && reply.get(1) != Some(&ACK) => {
                    trace!(attempt, "Discarding in-flight sample");
                }
                Ok(Some(reply)) => return ReadMarker::Stopping.check(&reply),
                Ok(None) => trace!(attempt, "Waiting for stop confirmation"),
                Err(e) if e.is_line_noise() => debug!(attempt, error = %e, "Retrying stop confirmation"),
                Err(e) => return Err(e),
            }
        }
        Err(Error::Timeout(format!(
            "no stop confirmation after {} reads",
            self.config.handshake_attempts
        )))
    }

    /// Wait one read window for a sample.
    ///
    /// `Ok(None)` means the window passed without a packet, or the packet was
    /// empty.
    pub async fn read_sample(&mut self) -> Result<Option<Sample>> {
        if self.state != SessionState::Streaming {
            return Err(Error::Validation(format!(
                "continuous read is not active (session is {})",
                self.state
            )));
        }
        match self.recv().await? {
            Some(payload) if !payload.is_empty() => {
                let sample = Sample::parse(&payload, Local::now())?;
                trace!(%sample, "Sample");
                Ok(Some(sample))
            }
            _ => Ok(None),
        }
    }
}

impl<T: Transport + 'static> Fs5000<T> {
    /// Start continuous read and hand the session to a reader task.
    ///
    /// The returned stream yields samples until it is closed or dropped,
    /// or until it yields an error (which is always the last item). Whatever
    /// ends it, the reader task runs the stop handshake before exiting.
    pub fn into_stream(self) -> SampleStream<T> {
        let (tx, rx) = mpsc::channel(self.config.stream_capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(stream_task(self, tx, cancel.clone()));
        SampleStream {
            rx,
            cancel,
            task: Some(task),
        }
    }
}

async fn stream_task<T: Transport>(
    mut device: Fs5000<T>,
    tx: mpsc::Sender<Result<Sample>>,
    cancel: CancellationToken,
) -> Result<Fs5000<T>> {
    if let Err(e) = device.start_read().await {
        // start_read already tried to stop.
        let _ = tx.try_send(Err(e));
        return Ok(device);
    }

    let outcome = loop {
        if cancel.is_cancelled() || tx.is_closed() {
            break Ok(());
        }
        match device.read_sample().await {
            Ok(None) => continue,
            Ok(Some(sample)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ok(()),
                    sent = tx.send(Ok(sample)) => if sent.is_err() { break Ok(()) },
                }
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = outcome {
        warn!(error = %e, "Sample stream interrupted");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tx.send(Err(e)) => {}
        }
    }
    device.stop_read().await?;
    Ok(device)
}

/// Live samples from a session in continuous read.
///
/// Implements [`Stream`]. Dropping it stops continuous read in the
/// background; [`SampleStream::close`] does the same and hands the session
/// back.
pub struct SampleStream<T: Transport = Box<dyn Transport>> {
    rx: mpsc::Receiver<Result<Sample>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<Fs5000<T>>>>,
}

impl<T: Transport> SampleStream<T> {
    /// Next sample; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<Sample>> {
        self.rx.recv().await
    }

    /// Stop continuous read and return the idle session.
    ///
    /// Fails when the stop handshake fails, in which case the session is
    /// dropped along with its transport.
    pub async fn close(mut self) -> Result<Fs5000<T>> {
        self.cancel.cancel();
        self.rx.close();
        let task = self.task.take().ok_or(Error::StreamClosed)?;
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Transport(format!("sample reader task failed: {e}"))),
        }
    }
}

impl<T: Transport> Stream for SampleStream<T> {
    type Item = Result<Sample>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T: Transport> Drop for SampleStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
