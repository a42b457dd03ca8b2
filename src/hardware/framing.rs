//! HID packet framing.
//!
//! Each HID packet is 64 bytes on a fixed logical channel carrying a single
//! APDU payload tag. The first packet of a payload declares the total
//! length; continuation packets carry a sequence counter used to place
//! their bytes during reassembly.

use crate::domain::{ErrorKind, WalletError};

pub const PACKET_SIZE: usize = 64;
pub const CHANNEL: u16 = 0x0101;
pub const TAG_APDU: u8 = 0x05;

/// First packet: channel(2) + tag(1) + seq(2) + totalLen(2).
const FIRST_HEADER: usize = 7;
/// Continuation packet: channel(2) + tag(1) + seq(2).
const CONT_HEADER: usize = 5;

pub const FIRST_DATA: usize = PACKET_SIZE - FIRST_HEADER; // 57
pub const CONT_DATA: usize = PACKET_SIZE - CONT_HEADER; // 59

/// Segment an APDU payload into zero-padded 64-byte packets.
pub fn frame(payload: &[u8]) -> Vec<[u8; PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    let mut seq = 0u16;

    loop {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0..2].copy_from_slice(&CHANNEL.to_be_bytes());
        packet[2] = TAG_APDU;
        packet[3..5].copy_from_slice(&seq.to_be_bytes());

        let (header, capacity) = if seq == 0 {
            packet[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            (FIRST_HEADER, FIRST_DATA)
        } else {
            (CONT_HEADER, CONT_DATA)
        };

        let take = capacity.min(payload.len() - offset);
        packet[header..header + take].copy_from_slice(&payload[offset..offset + take]);
        packets.push(packet);
        offset += take;
        seq += 1;

        if offset >= payload.len() {
            break;
        }
    }

    packets
}

/// Inbound packet reassembler for one response.
#[derive(Debug, Default)]
pub struct Reassembler {
    total_len: Option<usize>,
    next_seq: u16,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one 64-byte packet. Returns the complete payload once received
    /// length reaches the declared total.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, WalletError> {
        if packet.len() != PACKET_SIZE {
            return Err(framing_error(format!(
                "packet must be {PACKET_SIZE} bytes, got {}",
                packet.len()
            )));
        }

        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if channel != CHANNEL {
            return Err(framing_error(format!("unexpected channel {channel:#06x}")));
        }
        if packet[2] != TAG_APDU {
            return Err(framing_error(format!("unexpected tag {:#04x}", packet[2])));
        }

        let seq = u16::from_be_bytes([packet[3], packet[4]]);
        if seq != self.next_seq {
            return Err(framing_error(format!(
                "out-of-order packet: expected seq {}, got {seq}",
                self.next_seq
            )));
        }

        let data = if seq == 0 {
            let declared = u16::from_be_bytes([packet[5], packet[6]]) as usize;
            self.total_len = Some(declared);
            self.buf = Vec::with_capacity(declared);
            &packet[FIRST_HEADER..]
        } else {
            if self.total_len.is_none() {
                return Err(framing_error("continuation packet before first packet"));
            }
            &packet[CONT_HEADER..]
        };

        let total = self.total_len.expect("set above");
        let remaining = total - self.buf.len();
        self.buf.extend_from_slice(&data[..remaining.min(data.len())]);
        self.next_seq += 1;

        if self.buf.len() >= total {
            let payload = std::mem::take(&mut self.buf);
            self.total_len = None;
            self.next_seq = 0;
            Ok(Some(payload))
        } else {
            Ok(None)
        }
    }
}

fn framing_error(message: impl Into<String>) -> WalletError {
    WalletError::new(ErrorKind::TransportError, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(packets: &[[u8; PACKET_SIZE]]) -> Vec<u8> {
        let mut r = Reassembler::new();
        for (i, packet) in packets.iter().enumerate() {
            match r.push(packet).unwrap() {
                Some(payload) => {
                    assert_eq!(i, packets.len() - 1, "completed early");
                    return payload;
                }
                None => continue,
            }
        }
        panic!("payload never completed");
    }

    #[test]
    fn test_hundred_byte_apdu_spans_two_packets() {
        let payload: Vec<u8> = (0..100u8).collect();
        let packets = frame(&payload);
        assert_eq!(packets.len(), 2);

        // First packet header: channel, tag, seq 0, totalLen 100.
        assert_eq!(&packets[0][0..2], &[0x01, 0x01]);
        assert_eq!(packets[0][2], 0x05);
        assert_eq!(&packets[0][3..5], &[0x00, 0x00]);
        assert_eq!(&packets[0][5..7], &[0x00, 0x64]);
        assert_eq!(&packets[0][7..], &payload[..FIRST_DATA]);

        // Second packet: seq 1, 43 data bytes, zero padding.
        assert_eq!(&packets[1][3..5], &[0x00, 0x01]);
        assert_eq!(&packets[1][5..5 + 43], &payload[FIRST_DATA..]);
        assert!(packets[1][5 + 43..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        for len in [0usize, 1, 56, 57, 58, 116, 117, 300, 1000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let packets = frame(&payload);
            assert!(packets.iter().all(|p| p.len() == PACKET_SIZE));
            assert_eq!(reassemble(&packets), payload, "len {len}");
        }
    }

    #[test]
    fn test_single_packet_payload() {
        let payload = vec![0xAB; 10];
        let packets = frame(&payload);
        assert_eq!(packets.len(), 1);
        assert_eq!(reassemble(&packets), payload);
    }

    #[test]
    fn test_out_of_order_packet_rejected() {
        let payload = vec![1u8; 200];
        let packets = frame(&payload);
        let mut r = Reassembler::new();
        r.push(&packets[0]).unwrap();
        let err = r.push(&packets[2]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_wrong_channel_rejected() {
        let mut packet = frame(&[1, 2, 3])[0];
        packet[0] = 0xFF;
        let err = Reassembler::new().push(&packet).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_continuation_without_first_rejected() {
        let packets = frame(&vec![1u8; 200]);
        let err = Reassembler::new().push(&packets[1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_reassembler_resets_after_completion() {
        let mut r = Reassembler::new();
        let first = frame(&[1, 2, 3]);
        assert_eq!(r.push(&first[0]).unwrap(), Some(vec![1, 2, 3]));
        let second = frame(&[9, 9]);
        assert_eq!(r.push(&second[0]).unwrap(), Some(vec![9, 9]));
    }
}
