// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG-2 Transport Stream packet framing (ISO/IEC 13818-1 §2.4.3) and PES header
//! parsing/writing (§2.4.3.6/§2.4.3.7): the byte-level layer `demux`/`mux` build on.

use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder};

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0101;
pub const AUDIO_PID: u16 = 0x0102;
pub const DATA_PID: u16 = 0x0103;

/// PMT `stream_type` values this engine recognizes (ISO/IEC 13818-1 table 2-34).
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
pub const STREAM_TYPE_TIMED_ID3: u8 = 0x15;

/// Elements a single TS packet was parsed into: its PID, whether it starts a new PES/PSI
/// unit, and the payload bytes past any adaptation field.
pub struct TsPacket<'a> {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub payload: &'a [u8],
}

/// Parses one 188-byte TS packet. Fails `Invalid` on a bad sync byte or a malformed
/// adaptation field.
pub fn parse_packet(data: &[u8]) -> Result<TsPacket<'_>, Error> {
    if data.len() != TS_PACKET_SIZE {
        bail!(Invalid, msg("TS packet must be {} bytes, got {}", TS_PACKET_SIZE, data.len()));
    }
    if data[0] != SYNC_BYTE {
        bail!(Invalid, msg("bad TS sync byte 0x{:02x}", data[0]));
    }
    let payload_unit_start = data[1] & 0x40 != 0;
    let pid = (((data[1] & 0x1F) as u16) << 8) | data[2] as u16;
    let adaptation_field_control = (data[3] >> 4) & 0x3;
    let mut pos = 4usize;
    if adaptation_field_control == 2 || adaptation_field_control == 3 {
        if pos >= data.len() {
            bail!(Invalid, msg("TS packet truncated before adaptation field length"));
        }
        let adaptation_len = data[pos] as usize;
        pos += 1 + adaptation_len;
        if pos > data.len() {
            bail!(Invalid, msg("adaptation field length {} exceeds packet", adaptation_len));
        }
    }
    let payload: &[u8] = if adaptation_field_control == 1 || adaptation_field_control == 3 {
        &data[pos..]
    } else {
        &[]
    };
    Ok(TsPacket { pid, payload_unit_start, payload })
}

/// Splits `payload` into fixed-size TS packets for `pid`, setting `payload_unit_start` on
/// the first packet and stuffing the final packet's adaptation field with `0xFF` if it
/// would otherwise be short.
pub fn write_packets(out: &mut Vec<u8>, pid: u16, payload: &[u8], continuity_counter: &mut u8) {
    let mut offset = 0usize;
    let mut first = true;
    while offset < payload.len() || first {
        let remaining = payload.len() - offset;
        let usable = TS_PACKET_SIZE - 4;
        let chunk_len = remaining.min(usable);
        let needs_stuffing = chunk_len < usable;

        out.push(SYNC_BYTE);
        let pusi_bit = if first { 0x40 } else { 0x00 };
        out.push(pusi_bit | ((pid >> 8) as u8 & 0x1F));
        out.push((pid & 0xFF) as u8);
        let adaptation_field_control = if needs_stuffing { 0x30 } else { 0x10 };
        out.push(adaptation_field_control | (*continuity_counter & 0x0F));
        *continuity_counter = continuity_counter.wrapping_add(1);

        if needs_stuffing {
            let stuffing_len = usable - chunk_len;
            // adaptation_field_length byte itself doesn't count toward the stuffing it describes.
            out.push((stuffing_len - 1) as u8);
            if stuffing_len >= 2 {
                out.push(0x00); // no flags set
                out.extend(std::iter::repeat(0xFFu8).take(stuffing_len - 2));
            }
        }
        out.extend_from_slice(&payload[offset..offset + chunk_len]);
        offset += chunk_len;
        first = false;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub header_len: usize,
}

fn read_timestamp(data: &[u8]) -> i64 {
    let a = ((data[0] >> 1) & 0x07) as i64;
    let b = BigEndian::read_u16(&data[1..3]) as i64 >> 1;
    let c = BigEndian::read_u16(&data[3..5]) as i64 >> 1;
    (a << 30) | (b << 15) | c
}

fn write_timestamp(out: &mut Vec<u8>, marker: u8, ts: i64) {
    let a = ((ts >> 30) & 0x07) as u8;
    let b = ((ts >> 15) & 0x7FFF) as u16;
    let c = (ts & 0x7FFF) as u16;
    out.push((marker << 4) | (a << 1) | 1);
    out.push((b >> 7) as u8);
    out.push((((b & 0x7F) << 1) | 1) as u8);
    out.push((c >> 7) as u8);
    out.push((((c & 0x7F) << 1) | 1) as u8);
}

/// Parses a PES packet header starting at `data[0..]` (the `00 00 01` start code prefix
/// included). Returns the header along with `header_len`, the byte offset of the PES
/// payload within `data`.
pub fn parse_pes_header(data: &[u8]) -> Result<PesHeader, Error> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        bail!(Invalid, msg("missing PES start code prefix"));
    }
    let stream_id = data[3];
    let flags = data[7];
    let pts_dts_flags = (flags >> 6) & 0x3;
    let pes_header_data_len = data[8] as usize;
    if 9 + pes_header_data_len > data.len() {
        bail!(Invalid, msg("PES header data length {} exceeds packet", pes_header_data_len));
    }
    let optional = &data[9..9 + pes_header_data_len];
    let (pts, dts) = match pts_dts_flags {
        0 => (None, None),
        2 => {
            if optional.len() < 5 {
                bail!(Invalid, msg("PES claims PTS but header data too short"));
            }
            (Some(read_timestamp(optional)), None)
        }
        3 => {
            if optional.len() < 10 {
                bail!(Invalid, msg("PES claims PTS+DTS but header data too short"));
            }
            (Some(read_timestamp(optional)), Some(read_timestamp(&optional[5..])))
        }
        _ => bail!(Invalid, msg("PES pts_dts_flags value 1 is forbidden")),
    };
    Ok(PesHeader { stream_id, pts, dts, header_len: 9 + pes_header_data_len })
}

/// Writes a PES header (stream_id + pts/dts) followed by `payload`. `PES_packet_length` is
/// left at 0 when the payload may exceed the 16-bit field (video streams do this
/// routinely; readers are expected to treat 0 as "unbounded", per §2.4.3.7).
pub fn write_pes(out: &mut Vec<u8>, stream_id: u8, pts: i64, dts: Option<i64>, payload: &[u8]) {
    out.extend_from_slice(&[0, 0, 1]);
    out.push(stream_id);
    let optional_len = if dts.is_some() { 10 } else { 5 };
    let packet_len = (optional_len + 3 + payload.len()) as u64;
    out.extend_from_slice(&(if packet_len > 0xFFFF { 0 } else { packet_len as u16 }).to_be_bytes());
    out.push(0x80); // '10' marker + no scrambling/priority/alignment/copyright flags
    let pts_dts_flags = if dts.is_some() { 0xC0 } else { 0x80 };
    out.push(pts_dts_flags);
    out.push(optional_len as u8);
    match dts {
        Some(dts) => {
            write_timestamp(out, 0x3, pts);
            write_timestamp(out, 0x1, dts);
        }
        None => write_timestamp(out, 0x2, pts),
    }
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trips_through_parse() {
        let mut out = Vec::new();
        let mut cc = 0u8;
        write_packets(&mut out, 0x101, &[1, 2, 3], &mut cc);
        assert_eq!(out.len(), TS_PACKET_SIZE);
        let p = parse_packet(&out).unwrap();
        assert_eq!(p.pid, 0x101);
        assert!(p.payload_unit_start);
        assert_eq!(p.payload, &[1, 2, 3]);
    }

    #[test]
    fn multi_packet_payload_splits_across_packets() {
        let payload: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
        let mut out = Vec::new();
        let mut cc = 0u8;
        write_packets(&mut out, 0x102, &payload, &mut cc);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert!(out.len() / TS_PACKET_SIZE >= 2);
        let mut reassembled = Vec::new();
        for chunk in out.chunks(TS_PACKET_SIZE) {
            reassembled.extend_from_slice(parse_packet(chunk).unwrap().payload);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn pes_header_round_trips_pts_and_dts() {
        let mut out = Vec::new();
        write_pes(&mut out, 0xE0, 90_000, Some(89_997), &[9, 9, 9]);
        let h = parse_pes_header(&out).unwrap();
        assert_eq!(h.stream_id, 0xE0);
        assert_eq!(h.pts, Some(90_000));
        assert_eq!(h.dts, Some(89_997));
        assert_eq!(&out[h.header_len..], &[9, 9, 9]);
    }

    #[test]
    fn rejects_bad_sync_byte() {
        let mut bad = [0u8; TS_PACKET_SIZE];
        bad[0] = 0x00;
        assert!(parse_packet(&bad).is_err());
    }
}
