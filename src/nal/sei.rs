// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! SEI (Supplemental Enhancement Information) payload scanning, for extracting and
//! re-injecting ITU-T T.35 user-data captions.

use base::{bail, Error};

/// `payload_type = 4`: user_data_registered_itu_t_t35, the caption carrier this engine cares about.
pub const PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35: u32 = 4;

/// One SEI message's payload, located within the containing NAL's byte buffer.
#[derive(Copy, Clone, Debug)]
pub struct SeiPayload {
    pub payload_type: u32,
    pub offset: usize,
    pub size: usize,
}

/// Reads a SEI payload-type or payload-size field: a chain of `0xFF` bytes (each worth
/// 255) terminated by a tail byte, per ITU-T Rec. H.264 Annex D.
fn read_ff_chain(nal: &[u8], mut i: usize) -> Result<(u32, usize), Error> {
    let mut value: u32 = 0;
    loop {
        if i >= nal.len() {
            bail!(Invalid, msg("SEI payload field truncated at offset {}", i));
        }
        let b = nal[i];
        value += b as u32;
        i += 1;
        if b != 0xFF {
            break;
        }
    }
    Ok((value, i))
}

/// Scans the RBSP of a single SEI NAL (NAL header byte already stripped) for messages,
/// calling `f(payload)` for each. Emulation-prevention bytes (`00 00 03`) embedded in a
/// payload still count toward its declared `payload_size`, as encoded — this scanner does
/// not un-escape them; callers needing the RBSP should do so before extracting bytes.
pub fn scan(rbsp: &[u8], mut f: impl FnMut(SeiPayload) -> Result<(), Error>) -> Result<(), Error> {
    let mut i = 0usize;
    while i < rbsp.len() && rbsp[i] != 0x80 {
        let (payload_type, after_type) = read_ff_chain(rbsp, i)?;
        let (payload_size, after_size) = read_ff_chain(rbsp, after_type)?;
        let offset = after_size;
        let size = payload_size as usize;
        if offset + size > rbsp.len() {
            bail!(Invalid, msg("SEI payload of size {} at offset {} exceeds NAL", size, offset));
        }
        f(SeiPayload { payload_type, offset, size })?;
        i = offset + size;
    }
    Ok(())
}

/// Collects the byte ranges of all ITU-T T.35 caption payloads in `rbsp`.
pub fn caption_payloads(rbsp: &[u8]) -> Result<Vec<(usize, usize)>, Error> {
    let mut out = Vec::new();
    scan(rbsp, |p| {
        if p.payload_type == PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35 {
            out.push((p.offset, p.size));
        }
        Ok(())
    })?;
    Ok(out)
}

/// Rebuilds a standalone, length-prefixed SEI NAL (AVCC dialect) from caption payload
/// bytes previously extracted by [`caption_payloads`]: NAL header `0x06`, one SEI message
/// per payload (type=4, size, bytes), trailing RBSP stop bit `0x80`, 4-byte length prefix.
pub fn rebuild_caption_nal(payloads: &[&[u8]], nalu_length_size: u8) -> Vec<u8> {
    let mut body = vec![0x06u8];
    for p in payloads {
        write_ff_chain(&mut body, PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35);
        write_ff_chain(&mut body, p.len() as u32);
        body.extend_from_slice(p);
    }
    body.push(0x80);
    let mut out = Vec::with_capacity(body.len() + nalu_length_size as usize);
    if nalu_length_size == 2 {
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(&body);
    out
}

fn write_ff_chain(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0xFF {
        out.push(0xFF);
        value -= 0xFF;
    }
    out.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_single_small_caption_payload() {
        let mut rbsp = vec![4u8, 3, b'a', b'b', b'c'];
        rbsp.push(0x80);
        let payloads = caption_payloads(&rbsp).unwrap();
        assert_eq!(payloads, vec![(2, 3)]);
    }

    #[test]
    fn ff_chain_handles_values_over_255() {
        let mut rbsp = Vec::new();
        write_ff_chain(&mut rbsp, 4); // payload_type
        write_ff_chain(&mut rbsp, 300); // payload_size > 255
        rbsp.extend(std::iter::repeat(0u8).take(300));
        rbsp.push(0x80);
        let payloads = caption_payloads(&rbsp).unwrap();
        assert_eq!(payloads[0].1, 300);
    }

    #[test]
    fn rebuild_round_trips_through_scan() {
        let nal = rebuild_caption_nal(&[b"hello"], 4);
        let len = u32::from_be_bytes(nal[0..4].try_into().unwrap()) as usize;
        let rbsp = &nal[5..5 + len - 1]; // skip NAL header byte
        let payloads = caption_payloads(rbsp).unwrap();
        assert_eq!(&rbsp[payloads[0].0..payloads[0].0 + payloads[0].1], b"hello");
    }
}
