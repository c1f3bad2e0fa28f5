// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! AVCC (length-prefixed) byte-stream scanning and Annex-B <-> AVCC conversion.

use crate::nal::annexb;
use crate::nal::sei;
use crate::nal::{NalLocation, NalType};
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder};

/// Scans `data`, an AVCC stream whose NALs are prefixed by an `n`-byte big-endian length
/// (`n` ∈ {2, 4}), calling `f(location)` for each.
pub fn scan(data: &[u8], n: u8, mut f: impl FnMut(NalLocation) -> Result<(), Error>) -> Result<(), Error> {
    if n != 2 && n != 4 {
        bail!(Unsupported, msg("AVCC length size {} unsupported", n));
    }
    let n = n as usize;
    let mut offset = 0usize;
    while offset < data.len() {
        if offset + n > data.len() {
            bail!(Invalid, msg("truncated length prefix at offset {}", offset));
        }
        let len = read_len(&data[offset..offset + n]);
        let nal_offset = offset + n;
        if nal_offset + len > data.len() {
            bail!(Invalid, msg("NAL of size {} at offset {} exceeds buffer", len, nal_offset));
        }
        if len == 0 {
            bail!(Invalid, msg("zero-length NAL at offset {}", offset));
        }
        let nal_type = NalType::from_header_byte(data[nal_offset]);
        f(NalLocation { nal_type, offset: nal_offset, size: len, prefix_size: n })?;
        offset = nal_offset + len;
    }
    Ok(())
}

pub fn locate_all(data: &[u8], n: u8) -> Result<Vec<NalLocation>, Error> {
    let mut out = Vec::new();
    scan(data, n, |l| {
        out.push(l);
        Ok(())
    })?;
    Ok(out)
}

fn read_len(b: &[u8]) -> usize {
    if b.len() == 2 {
        BigEndian::read_u16(b) as usize
    } else {
        BigEndian::read_u32(b) as usize
    }
}

fn write_len(out: &mut Vec<u8>, len: usize, n: usize) {
    if n == 2 {
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// Rewrites an Annex-B stream to AVCC with `n`-byte lengths. Start-code prefixes are
/// replaced one-for-one if they already happen to all be `n` bytes wide (the common
/// case — this still reallocates, since Annex-B prefixes and AVCC lengths have different
/// byte values even when the same width); any other prefix width forces reallocation too.
pub fn annexb_to_avcc(data: &[u8], n: u8) -> Result<Vec<u8>, Error> {
    if n != 2 && n != 4 {
        bail!(Unsupported, msg("AVCC length size {} unsupported", n));
    }
    let locs = annexb::locate_all(data)?;
    let mut out = Vec::with_capacity(data.len());
    for l in &locs {
        write_len(&mut out, l.size, n as usize);
        out.extend_from_slice(&data[l.offset..l.offset + l.size]);
    }
    Ok(out)
}

/// Rewrites an AVCC stream to Annex-B. Always reallocates: the 4-byte start-code prefix
/// is fixed regardless of the source NALU length size.
pub fn avcc_to_annexb(data: &[u8], n: u8) -> Result<Vec<u8>, Error> {
    let locs = locate_all(data, n)?;
    let mut out = Vec::with_capacity(data.len() + locs.len());
    for l in &locs {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[l.offset..l.offset + l.size]);
    }
    Ok(out)
}

/// Rewrites an AVCC stream, dropping any SEI NAL that carries at least one ITU-T T.35
/// caption payload. All other NALs (including SEI NALs carrying only other payload
/// types) pass through unchanged, length prefix and all.
pub fn strip_caption_sei(data: &[u8], n: u8) -> Result<Vec<u8>, Error> {
    let n_usize = n as usize;
    let locs = locate_all(data, n)?;
    let mut out = Vec::with_capacity(data.len());
    for l in &locs {
        if l.nal_type == NalType::Sei {
            let rbsp = &data[l.offset + 1..l.offset + l.size];
            if !sei::caption_payloads(rbsp)?.is_empty() {
                continue;
            }
        }
        write_len(&mut out, l.size, n_usize);
        out.extend_from_slice(&data[l.offset..l.offset + l.size]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annexb_round_trips_through_avcc() {
        let annexb = [0, 0, 0, 1, 0x67, 0xAA, 0xBB, 0, 0, 0, 1, 0x68, 0xCC];
        let avcc = annexb_to_avcc(&annexb, 4).unwrap();
        let back = avcc_to_annexb(&avcc, 4).unwrap();
        assert_eq!(back, annexb);
    }

    #[test]
    fn avcc_scan_reports_two_byte_length_size() {
        let avcc = [0, 2, 0x67, 0xAA, 0, 2, 0x68, 0xBB];
        let locs = locate_all(&avcc, 2).unwrap();
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].size, 2);
        assert_eq!(locs[1].offset, 6);
    }

    #[test]
    fn rejects_truncated_length_prefix() {
        let avcc = [0, 0, 0, 4, 1, 2];
        assert!(locate_all(&avcc, 4).is_err());
    }

    #[test]
    fn strip_caption_sei_drops_only_the_caption_carrying_sei_nal() {
        let slice_nal = [0, 0, 0, 2, 0x65, 0xAB];
        let caption_nal = sei::rebuild_caption_nal(&[b"hello"], 4);
        let mut avcc = slice_nal.to_vec();
        avcc.extend_from_slice(&caption_nal);
        assert_eq!(locate_all(&avcc, 4).unwrap().len(), 2);

        let stripped = strip_caption_sei(&avcc, 4).unwrap();
        let locs = locate_all(&stripped, 4).unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].nal_type, NalType::from_header_byte(0x65));
    }

    #[test]
    fn strip_caption_sei_is_a_no_op_without_captions() {
        let avcc = [0, 0, 0, 2, 0x65, 0xAB, 0, 0, 0, 2, 0x41, 0xCD];
        let stripped = strip_caption_sei(&avcc, 4).unwrap();
        assert_eq!(stripped, avcc);
    }
}
