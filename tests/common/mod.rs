//! Common test utilities and shared imports

// Not every test file uses every helper.
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use fs5000::{Error, Fs5000, MockTransport, SessionConfig, SessionState};
#[allow(unused_imports)]
pub use hex;

use std::time::Duration;

/// Short timeouts so failure paths resolve quickly.
#[allow(dead_code)]
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        read_timeout: Duration::from_millis(20),
        handshake_attempts: 5,
        stream_capacity: 8,
    }
}

/// A session on `mock`, keeping `mock` around for inspection.
#[allow(dead_code)]
pub fn meter(mock: &MockTransport) -> Fs5000<MockTransport> {
    Fs5000::with_config(mock.clone(), fast_config())
}

/// A mock that streams quickly.
#[allow(dead_code)]
pub fn streaming_mock() -> MockTransport {
    MockTransport::new().with_sample_period(Duration::from_millis(2))
}

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Frame `payload` with the checksum byte off by one.
#[allow(dead_code)]
pub fn corrupt_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = fs5000::packet::encode(payload).expect("payload fits").to_vec();
    let at = frame.len() - 2;
    frame[at] = frame[at].wrapping_add(1);
    frame
}

/// Continuous-read start confirmation as it appears on the wire.
#[allow(dead_code)]
pub const START_CONFIRMATION_FRAME: &str = "aa060e0601c555";
/// Continuous-read stop confirmation as it appears on the wire.
#[allow(dead_code)]
pub const STOP_CONFIRMATION_FRAME: &str = "aa060e0600c455";
