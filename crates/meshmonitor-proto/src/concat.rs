//! Splitter for concatenated FromRadio blobs
//!
//! The HTTP transport variant of the radio returns several FromRadio
//! messages back-to-back with no outer framing. Because every top-level
//! field of FromRadio is optional and non-repeated, a field number seen
//! twice can only mean a new message started; the splitter cuts on that.
//!
//! The framed TCP transport never needs this and is preferred; see the
//! design notes on the heuristic's limits with pathological input.

use std::collections::HashSet;

use crate::mesh::{decode_from_radio, FromRadio};

/// Protobuf wire types.
const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn skip_field(buf: &[u8], pos: &mut usize, wire_type: u64) -> Option<()> {
    match wire_type {
        WIRE_VARINT => {
            read_varint(buf, pos)?;
        }
        WIRE_FIXED64 => {
            *pos = pos.checked_add(8).filter(|&p| p <= buf.len())?;
        }
        WIRE_LEN => {
            let len = read_varint(buf, pos)? as usize;
            *pos = pos.checked_add(len).filter(|&p| p <= buf.len())?;
        }
        WIRE_FIXED32 => {
            *pos = pos.checked_add(4).filter(|&p| p <= buf.len())?;
        }
        _ => return None,
    }
    Some(())
}

/// Split a blob into per-message byte ranges by the repeated-field-number
/// rule. A malformed tail is dropped rather than guessed at.
pub fn split_concatenated(blob: &[u8]) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut msg_start = 0usize;
    let mut pos = 0usize;

    while pos < blob.len() {
        let tag_start = pos;
        let tag = match read_varint(blob, &mut pos) {
            Some(t) => t,
            None => return chunks,
        };
        let field = tag >> 3;
        if field == 0 {
            return chunks;
        }

        if seen.contains(&field) {
            chunks.push(&blob[msg_start..tag_start]);
            seen.clear();
            msg_start = tag_start;
        }
        seen.insert(field);

        if skip_field(blob, &mut pos, tag & 0x07).is_none() {
            return chunks;
        }
    }

    if msg_start < blob.len() {
        chunks.push(&blob[msg_start..]);
    }
    chunks
}

/// Split and decode a concatenated blob; undecodable chunks are discarded.
pub fn parse_concatenated(blob: &[u8]) -> Vec<FromRadio> {
    split_concatenated(blob)
        .into_iter()
        .filter_map(|chunk| decode_from_radio(chunk).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{FromRadio, MeshPacket, MyNodeInfo};
    use prost::Message;

    fn sample(id: u32, packet_id: u32) -> FromRadio {
        let mut frame = FromRadio::from_packet(MeshPacket {
            from: 0x10,
            to: 0x20,
            id: packet_id,
            ..Default::default()
        });
        frame.id = id;
        frame
    }

    #[test]
    fn test_split_two_messages() {
        let first = sample(1, 100);
        let second = sample(2, 200);

        let mut blob = first.encode_to_vec();
        blob.extend_from_slice(&second.encode_to_vec());

        let parsed = parse_concatenated(&blob);
        assert_eq!(parsed, vec![first, second]);
    }

    #[test]
    fn test_single_message_stays_whole() {
        let mut frame = FromRadio::from_my_info(MyNodeInfo {
            my_node_num: 0xdeadbeef,
            ..Default::default()
        });
        frame.id = 7;

        let parsed = parse_concatenated(&frame.encode_to_vec());
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn test_empty_blob() {
        assert!(parse_concatenated(&[]).is_empty());
    }

    #[test]
    fn test_malformed_tail_dropped() {
        let frame = sample(1, 100);
        let mut blob = frame.encode_to_vec();
        // A truncated length-delimited field claiming more bytes than exist.
        blob.extend_from_slice(&[0x12, 0x7F, 0x01]);

        // The valid leading message still parses; the tail is discarded.
        let chunks = split_concatenated(&blob);
        assert_eq!(chunks.len(), 1);
        assert_eq!(parse_concatenated(&blob), vec![frame]);
    }
}
