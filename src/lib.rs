//! Driver for the FS5000 radiation dose meter.
//!
//! [`Fs5000`] talks to the meter over its USB serial port: settings, dose
//! queries, history logs and continuous read. [`Fs5000Service`] keeps a meter
//! streaming in the background and fans the live samples out to any number of
//! subscribers. [`MockTransport`] stands in for the hardware.

pub mod broadcast;
pub mod command;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod packet;
pub mod protocol;
pub mod record;
pub mod sample;
pub mod service;
pub mod transport;

pub use broadcast::{StreamBroadcaster, SubscriberId, Subscription};
pub use command::{Command, DoseReading, VersionInfo};
pub use device::{Fs5000, SampleStream, SessionConfig, SessionState};
pub use error::{Error, Result};
pub use mock::MockTransport;
pub use protocol::{AlertMode, DoseUnit, Language, Opcode, PowerMode, RateUnit};
pub use record::{AlarmKind, AlarmRecord, AlarmUnit, HistoryKind, LogRecord};
pub use sample::{Field, Sample};
pub use service::{Fs5000Service, LinkState, ServiceConfig, ServiceStatus};
pub use transport::{SerialTransport, Transport};
