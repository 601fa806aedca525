//! Packet-line framing
//!
//! A data packet is a four hex digit length, counting the four length bytes
//! themselves, followed by the payload. `0000` is the flush packet.

use crate::HttpError;

/// Flush packet.
pub const FLUSH: &[u8] = b"0000";

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = 65516;

/// One frame read back from a packet-line stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Flush,
    Data(&'a [u8]),
}

pub fn packet_flush() -> &'static [u8] {
    FLUSH
}

/// Frame `payload` as one data packet.
pub fn packet_write(payload: &[u8]) -> Result<Vec<u8>, HttpError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(HttpError::PacketTooLong(payload.len()));
    }
    let mut out = format!("{:04x}", payload.len() + 4).into_bytes();
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a buffer into packets, stopping at the first byte that is not
/// part of a well-formed frame. Returns the packets and the unparsed rest.
pub fn read_packets(mut buf: &[u8]) -> (Vec<Packet<'_>>, &[u8]) {
    let mut packets = Vec::new();
    while buf.len() >= 4 {
        let Some(len) = std::str::from_utf8(&buf[..4])
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
        else {
            break;
        };
        if len == 0 {
            packets.push(Packet::Flush);
            buf = &buf[4..];
            continue;
        }
        if len < 4 || len > buf.len() {
            break;
        }
        packets.push(Packet::Data(&buf[4..len]));
        buf = &buf[len..];
    }
    (packets, buf)
}
