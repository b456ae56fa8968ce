//! Packet framing.
//!
//! ```text
//! +------+--------+-------------+----------+------+
//! | 0xAA | length | payload ... | checksum | 0x55 |
//! +------+--------+-------------+----------+------+
//! ```
//!
//! `length` counts the payload plus the length, checksum and end bytes, so
//! it is always `payload.len() + 3`. The checksum is the byte sum, mod 256,
//! of everything before it: start marker, length byte and payload. The start
//! marker is a constant, so this differs from a sum over `length + payload`
//! only by a fixed `0xAA` offset, and it is what the meter computes.

use crate::error::{Error, Result};
use crate::transport::{Transport, read_full};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace};

pub const START_MARKER: u8 = 0xAA;
pub const END_MARKER: u8 = 0x55;

/// Bytes the length field accounts for besides the payload.
pub const LENGTH_OVERHEAD: usize = 3;
/// Largest payload whose length still fits in the length byte.
pub const MAX_PAYLOAD: usize = u8::MAX as usize - LENGTH_OVERHEAD;

pub fn checksum(length: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(START_MARKER.wrapping_add(length), |acc, b| acc.wrapping_add(*b))
}

/// Wrap a payload in a frame ready for the wire.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Validation(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD} byte frame limit",
            payload.len()
        )));
    }
    let length = (payload.len() + LENGTH_OVERHEAD) as u8;
    let mut frame = BytesMut::with_capacity(payload.len() + 4);
    frame.put_u8(START_MARKER);
    frame.put_u8(length);
    frame.put_slice(payload);
    frame.put_u8(checksum(length, payload));
    frame.put_u8(END_MARKER);
    Ok(frame.freeze())
}

fn check_header(start: u8, length: u8) -> Result<()> {
    if start != START_MARKER {
        return Err(Error::Framing(format!(
            "start byte {start:#04x}, expected {START_MARKER:#04x}"
        )));
    }
    if (length as usize) < LENGTH_OVERHEAD {
        return Err(Error::Framing(format!("length byte {length} is below the minimum of 3")));
    }
    Ok(())
}

/// Validate the part of a frame after the length byte (payload, checksum and
/// end marker) and return the payload.
fn check_body(length: u8, body: &[u8]) -> Result<Bytes> {
    let (&end, rest) = body
        .split_last()
        .ok_or_else(|| Error::Framing("empty frame body".to_string()))?;
    if end != END_MARKER {
        return Err(Error::Framing(format!("end byte {end:#04x}, expected {END_MARKER:#04x}")));
    }
    let (&received, payload) = rest
        .split_last()
        .ok_or_else(|| Error::Framing("frame body has no checksum".to_string()))?;
    let computed = checksum(length, payload);
    if computed != received {
        debug!(body = hex::encode(body), "Checksum verification failed");
        return Err(Error::Checksum { computed, received });
    }
    Ok(Bytes::copy_from_slice(payload))
}

/// Decode one complete frame held in memory.
pub fn decode_frame(frame: &[u8]) -> Result<Bytes> {
    if frame.len() < 2 {
        return Err(Error::Framing(format!("frame of {} bytes has no header", frame.len())));
    }
    let length = frame[1];
    check_header(frame[0], length)?;
    let body = &frame[2..];
    if body.len() != length as usize - 1 {
        return Err(Error::Framing(format!(
            "length byte announces {} more bytes, frame holds {}",
            length as usize - 1,
            body.len()
        )));
    }
    check_body(length, body)
}

/// Read one frame from the transport and return its payload.
///
/// `Ok(None)` means nothing at all arrived before `timeout`: the line is idle,
/// not broken. Every read is sized by the length byte; the stream is never
/// scanned for markers.
pub async fn read_packet<T: Transport + ?Sized>(transport: &mut T, timeout: Duration) -> Result<Option<Bytes>> {
    let mut header = [0u8; 2];
    let n = read_full(transport, &mut header, timeout).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < header.len() {
        return Err(Error::Framing(format!("truncated header {:#04x}", header[0])));
    }
    let [start, length] = header;
    check_header(start, length)?;

    let mut body = vec![0u8; length as usize - 1];
    let n = read_full(transport, &mut body, timeout).await?;
    if n < body.len() {
        return Err(Error::Framing(format!(
            "truncated frame: expected {} bytes after the header, got {n}",
            body.len()
        )));
    }
    let payload = check_body(length, &body)?;
    trace!(payload = hex::encode(&payload), "Packet received");
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_stop_command() {
        // 0e 00 -> length 5, checksum aa+05+0e+00 = bd
        let frame = encode(&[0x0E, 0x00]).unwrap();
        assert_eq!(frame.as_ref(), &[0xAA, 0x05, 0x0E, 0x00, 0xBD, 0x55]);
    }

    #[test]
    fn encode_empty_payload() {
        let frame = encode(&[]).unwrap();
        assert_eq!(frame.as_ref(), &[0xAA, 0x03, 0xAD, 0x55]);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn checksum_wraps() {
        let payload = [0xFF; 10];
        let frame = encode(&payload).unwrap();
        assert_eq!(decode_frame(&frame).unwrap().as_ref(), &payload);
    }

    #[test]
    fn oversize_payload_rejected() {
        assert!(encode(&[0u8; MAX_PAYLOAD]).is_ok());
        assert!(matches!(encode(&[0u8; MAX_PAYLOAD + 1]), Err(Error::Validation(_))));
    }

    #[test]
    fn decode_rejects_bad_start() {
        let mut frame = encode(&[0x07]).unwrap().to_vec();
        frame[0] = 0xAB;
        assert!(matches!(decode_frame(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn decode_rejects_short_length_byte() {
        assert!(matches!(decode_frame(&[0xAA, 0x02, 0x55]), Err(Error::Framing(_))));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut frame = encode(&[0x01, 0x02]).unwrap().to_vec();
        frame.push(0x00);
        assert!(matches!(decode_frame(&frame), Err(Error::Framing(_))));
    }

    #[test]
    fn decode_reports_checksum_values() {
        let mut frame = encode(&[0x0E, 0x06, 0x00]).unwrap().to_vec();
        let idx = frame.len() - 2;
        let good = frame[idx];
        frame[idx] = good.wrapping_add(1);
        match decode_frame(&frame) {
            Err(Error::Checksum { computed, received }) => {
                assert_eq!(computed, good);
                assert_eq!(received, good.wrapping_add(1));
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }
}
