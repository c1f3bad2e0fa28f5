// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! ADTS (Audio Data Transport Stream) header parsing — the framing AAC samples use on
//! the wire in MP2TS.

use crate::settings::AudioCodec;
use base::{bail, Error};

/// ISO/IEC 13818-7 table 35: sampling_frequency_index -> sample rate, Hz.
pub const SAMPLE_RATE_TABLE: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Copy, Clone, Debug)]
pub struct AdtsHeader {
    pub codec: AudioCodec,
    pub sampling_frequency_index: u8,
    pub sample_rate: u32,
    pub channel_configuration: u8,
    pub frame_length: u16,
    pub header_len: u8,
}

/// Parses a single ADTS header at the start of `data`. Fails `Unsupported` on an
/// unrecognized sync/version/layer/profile, and `Invalid` if fewer bytes than
/// `frame_length` claims remain (the frame straddles a PES boundary and the caller
/// should cache and retry once more data has arrived).
pub fn parse(data: &[u8]) -> Result<AdtsHeader, Error> {
    if data.len() < 7 {
        bail!(Invalid, msg("ADTS header needs at least 7 bytes, got {}", data.len()));
    }
    let sync = ((data[0] as u16) << 4) | (data[1] >> 4) as u16;
    if sync != 0xFFF {
        bail!(Unsupported, msg("bad ADTS sync word 0x{:03x}", sync));
    }
    let mpeg_version = (data[1] >> 3) & 0x1;
    let layer = (data[1] >> 1) & 0x3;
    if mpeg_version != 0 || layer != 0 {
        bail!(Unsupported, msg("unsupported ADTS MPEG version/layer ({}, {})", mpeg_version, layer));
    }
    let protection_absent = data[1] & 0x1;
    let profile = (data[2] >> 6) & 0x3;
    let codec = match profile {
        0 => AudioCodec::AacMain,
        1 => AudioCodec::AacLc,
        _ => bail!(Unsupported, msg("unsupported ADTS profile {}", profile)),
    };
    let sampling_frequency_index = (data[2] >> 2) & 0xF;
    if sampling_frequency_index as usize >= SAMPLE_RATE_TABLE.len() {
        bail!(Invalid, msg("sampling_frequency_index {} out of range", sampling_frequency_index));
    }
    let channel_configuration = ((data[2] & 0x1) << 2) | (data[3] >> 6);
    if channel_configuration != 1 && channel_configuration != 2 {
        bail!(Unsupported, msg("unsupported ADTS channel configuration {}", channel_configuration));
    }
    let frame_length = (((data[3] & 0x3) as u16) << 11) | ((data[4] as u16) << 3) | ((data[5] >> 5) as u16);
    let num_aac_frames = (data[6] & 0x3) + 1;
    if num_aac_frames != 1 {
        bail!(Unsupported, msg("ADTS frames with num_aac_frames {} unsupported", num_aac_frames));
    }
    let header_len: u8 = if protection_absent == 1 { 7 } else { 9 };
    if (frame_length as usize) < header_len as usize || (data.len() as u16) < frame_length {
        bail!(Invalid, msg("ADTS frame_length {} exceeds available {} bytes", frame_length, data.len()));
    }
    Ok(AdtsHeader {
        codec,
        sampling_frequency_index,
        sample_rate: SAMPLE_RATE_TABLE[sampling_frequency_index as usize],
        channel_configuration,
        frame_length,
        header_len,
    })
}

/// Reverse lookup into [`SAMPLE_RATE_TABLE`]. Fails `Unsupported` for a rate ADTS can't
/// express (e.g. anything outside the 13-entry MPEG-4 sampling-frequency table).
pub fn sampling_frequency_index_for_rate(sample_rate: u32) -> Result<u8, Error> {
    SAMPLE_RATE_TABLE
        .iter()
        .position(|&r| r == sample_rate)
        .map(|i| i as u8)
        .ok_or_else(|| base::err!(Unsupported, msg("sample rate {} has no ADTS sampling_frequency_index", sample_rate)))
}

/// Synthesizes a fresh 7-byte ADTS header (no CRC) wrapping `payload_len` bytes of raw AAC.
pub fn write_header(
    out: &mut Vec<u8>,
    sampling_frequency_index: u8,
    channel_configuration: u8,
    payload_len: usize,
) -> Result<(), Error> {
    if sampling_frequency_index as usize >= SAMPLE_RATE_TABLE.len() {
        bail!(Invalid, msg("sampling_frequency_index {} out of range", sampling_frequency_index));
    }
    let frame_length = 7usize + payload_len;
    if frame_length > 0x1FFF {
        bail!(Unsupported, msg("ADTS frame_length {} exceeds 13-bit field", frame_length));
    }
    let profile_minus_one = 1u8; // AAC-LC
    out.push(0xFF);
    out.push(0xF1); // version=0, layer=0, protection_absent=1
    out.push((profile_minus_one << 6) | (sampling_frequency_index << 2) | ((channel_configuration & 0x4) >> 2));
    out.push(((channel_configuration & 0x3) << 6) | ((frame_length >> 11) as u8));
    out.push(((frame_length >> 3) & 0xFF) as u8);
    out.push((((frame_length & 0x7) as u8) << 5) | 0x1F);
    out.push(0xFC);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_frame(payload_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, 4, 2, payload_len).unwrap(); // 44100 Hz, stereo
        out.extend(std::iter::repeat(0xABu8).take(payload_len));
        out
    }

    #[test]
    fn round_trips_written_header() {
        let frame = synth_frame(100);
        let h = parse(&frame).unwrap();
        assert_eq!(h.codec, AudioCodec::AacLc);
        assert_eq!(h.sample_rate, 44100);
        assert_eq!(h.channel_configuration, 2);
        assert_eq!(h.frame_length as usize, frame.len());
        assert_eq!(h.header_len, 7);
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let frame = synth_frame(100);
        assert!(parse(&frame[..frame.len() - 10]).is_err());
    }

    #[test]
    fn bad_sync_word_is_unsupported() {
        let mut frame = synth_frame(10);
        frame[0] = 0;
        assert_eq!(parse(&frame).unwrap_err().kind(), base::ErrorKind::Unsupported);
    }

    #[test]
    fn sampling_frequency_index_round_trips_table_entries() {
        assert_eq!(sampling_frequency_index_for_rate(44100).unwrap(), 4);
        assert_eq!(sampling_frequency_index_for_rate(48000).unwrap(), 3);
        assert!(sampling_frequency_index_for_rate(1234).is_err());
    }
}
