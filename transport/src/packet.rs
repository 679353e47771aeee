//! Packet Wire Format
//!
//! Every artifact crossing the cluster network is one UDP datagram: a
//! fixed 15-byte little-endian header followed by a payload whose length
//! is implied by the kind and the subcarrier count.

use bytes::{Buf, BufMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use common::types::{Cf32, IqSample};

use crate::TransportError;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 15;

/// Largest datagram the cluster ever emits. Time-IQ packets for a 4096-bin
/// FFT stay well under this.
pub const MAX_PACKET_LEN: usize = 65000;

/// Wire-level packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    /// Raw time-domain samples from the RRU, one antenna-symbol each.
    TimeIq = 1,
    /// Post-FFT samples for one (antenna, symbol, subcarrier shard).
    FreqIq = 2,
    /// Zero-forcing matrix columns for a subcarrier range.
    Zf = 3,
    /// Soft demodulator output for one (symbol, UE, subcarrier shard).
    Demod = 4,
    /// Liveness nudge sent to the RRU while waiting for the first frame.
    Ping = 5,
}

/// Parsed packet header. Field order matches the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub frame: u32,
    pub symbol: u16,
    pub antenna_or_ue: u16,
    pub sc_start: u16,
    pub sc_len: u16,
    pub source_server: u16,
}

impl PacketHeader {
    /// Serialize into the first `HEADER_LEN` bytes of `buf`.
    pub fn encode(&self, mut buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_LEN);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.frame);
        buf.put_u16_le(self.symbol);
        buf.put_u16_le(self.antenna_or_ue);
        buf.put_u16_le(self.sc_start);
        buf.put_u16_le(self.sc_len);
        buf.put_u16_le(self.source_server);
    }

    /// Parse a received datagram; returns the header and the payload.
    pub fn decode(datagram: &[u8]) -> Result<(PacketHeader, &[u8]), TransportError> {
        if datagram.len() < HEADER_LEN {
            return Err(TransportError::MalformedPacket(format!(
                "{} bytes is shorter than the header",
                datagram.len()
            )));
        }
        let mut buf = datagram;
        let raw_kind = buf.get_u8();
        let kind = PacketKind::from_u8(raw_kind).ok_or(TransportError::UnknownKind(raw_kind))?;
        let header = PacketHeader {
            kind,
            frame: buf.get_u32_le(),
            symbol: buf.get_u16_le(),
            antenna_or_ue: buf.get_u16_le(),
            sc_start: buf.get_u16_le(),
            sc_len: buf.get_u16_le(),
            source_server: buf.get_u16_le(),
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }
}

/// Copy a little-endian IQ payload into sample slots. On little-endian
/// hosts this is a straight memcpy of the region.
pub fn payload_to_iq(payload: &[u8], dst: &mut [IqSample]) -> Result<(), TransportError> {
    if payload.len() != dst.len() * 4 {
        return Err(TransportError::MalformedPacket(format!(
            "IQ payload is {} bytes, expected {}",
            payload.len(),
            dst.len() * 4
        )));
    }
    #[cfg(target_endian = "little")]
    // SAFETY: IqSample is Complex<i16>, repr(C) { re, im }, matching the
    // wire layout exactly on little-endian hosts.
    unsafe {
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            dst.as_mut_ptr() as *mut u8,
            payload.len(),
        );
    }
    #[cfg(not(target_endian = "little"))]
    for (chunk, slot) in payload.chunks_exact(4).zip(dst.iter_mut()) {
        slot.re = i16::from_le_bytes([chunk[0], chunk[1]]);
        slot.im = i16::from_le_bytes([chunk[2], chunk[3]]);
    }
    Ok(())
}

/// Serialize IQ samples into a little-endian payload region.
pub fn iq_to_payload(src: &[IqSample], payload: &mut [u8]) {
    debug_assert_eq!(payload.len(), src.len() * 4);
    #[cfg(target_endian = "little")]
    // SAFETY: same layout argument as `payload_to_iq`.
    unsafe {
        std::ptr::copy_nonoverlapping(
            src.as_ptr() as *const u8,
            payload.as_mut_ptr(),
            payload.len(),
        );
    }
    #[cfg(not(target_endian = "little"))]
    for (slot, chunk) in src.iter().zip(payload.chunks_exact_mut(4)) {
        chunk[..2].copy_from_slice(&slot.re.to_le_bytes());
        chunk[2..].copy_from_slice(&slot.im.to_le_bytes());
    }
}

/// Copy a little-endian f32 complex payload (ZF matrix columns) into
/// coefficient slots.
pub fn payload_to_cf32(payload: &[u8], dst: &mut [Cf32]) -> Result<(), TransportError> {
    if payload.len() != dst.len() * 8 {
        return Err(TransportError::MalformedPacket(format!(
            "matrix payload is {} bytes, expected {}",
            payload.len(),
            dst.len() * 8
        )));
    }
    for (chunk, slot) in payload.chunks_exact(8).zip(dst.iter_mut()) {
        slot.re = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        slot.im = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
    }
    Ok(())
}

/// Serialize f32 complex coefficients into a little-endian payload.
pub fn cf32_to_payload(src: &[Cf32], payload: &mut [u8]) {
    debug_assert_eq!(payload.len(), src.len() * 8);
    for (slot, chunk) in src.iter().zip(payload.chunks_exact_mut(8)) {
        chunk[..4].copy_from_slice(&slot.re.to_le_bytes());
        chunk[4..].copy_from_slice(&slot.im.to_le_bytes());
    }
}
