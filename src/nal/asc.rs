// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `AudioSpecificConfig` synthesis (ISO/IEC 14496-3 §1.6.2), for AAC-LC and AAC-LC+SBR.

use crate::settings::AudioCodec;
use base::{bail, Error};

const AUDIO_OBJECT_TYPE_AAC_LC: u8 = 2;
const AUDIO_OBJECT_TYPE_SBR: u8 = 5;
const SYNC_EXTENSION_TYPE_SBR: u16 = 0x2B7;

struct BitWriter {
    bytes: Vec<u8>,
    bit_buf: u32,
    bit_count: u32,
}

impl BitWriter {
    fn new() -> BitWriter {
        BitWriter { bytes: Vec::new(), bit_buf: 0, bit_count: 0 }
    }

    fn push(&mut self, value: u32, bits: u32) {
        self.bit_buf = (self.bit_buf << bits) | (value & ((1 << bits) - 1));
        self.bit_count += bits;
        while self.bit_count >= 8 {
            self.bit_count -= 8;
            self.bytes.push(((self.bit_buf >> self.bit_count) & 0xFF) as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            let pad = 8 - self.bit_count;
            self.bytes.push(((self.bit_buf << pad) & 0xFF) as u8);
        }
        self.bytes
    }
}

/// Synthesizes a 2-byte `AudioSpecificConfig` for plain AAC-LC, or a 5-byte one with the
/// explicit SBR signaling suffix for AAC-LC+SBR.
pub fn write(
    codec: AudioCodec,
    sampling_frequency_index: u8,
    channel_configuration: u8,
    extension_sampling_frequency_index: Option<u8>,
) -> Result<Vec<u8>, Error> {
    if !matches!(codec, AudioCodec::AacLc | AudioCodec::AacLcSbr) {
        bail!(Unsupported, msg("AudioSpecificConfig synthesis only supports AAC-LC/AAC-LC-SBR"));
    }
    let mut w = BitWriter::new();
    w.push(AUDIO_OBJECT_TYPE_AAC_LC as u32, 5);
    w.push(sampling_frequency_index as u32, 4);
    w.push(channel_configuration as u32, 4);
    w.push(0, 1); // frameLengthFlag
    w.push(0, 1); // dependsOnCoreCoder
    w.push(0, 1); // extensionFlag
    if codec == AudioCodec::AacLcSbr {
        let ext_sfi = extension_sampling_frequency_index
            .ok_or_else(|| base::err!(InvalidArguments, msg("SBR requires an extension sampling frequency index")))?;
        w.push(SYNC_EXTENSION_TYPE_SBR as u32, 11);
        w.push(AUDIO_OBJECT_TYPE_SBR as u32, 5);
        w.push(1, 1); // sbrPresentFlag
        w.push(ext_sfi as u32, 4);
    }
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aac_lc_is_two_bytes() {
        let asc = write(AudioCodec::AacLc, 4, 2, None).unwrap();
        assert_eq!(asc.len(), 2);
        assert_eq!(asc[0] >> 3, AUDIO_OBJECT_TYPE_AAC_LC);
    }

    #[test]
    fn sbr_is_five_bytes_and_carries_sync_extension() {
        let asc = write(AudioCodec::AacLcSbr, 3, 2, Some(8)).unwrap();
        assert_eq!(asc.len(), 5);
        let all_bits: u64 = asc.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
        let total_bits = asc.len() as u32 * 8;
        let sync_ext = (all_bits >> (total_bits - 16 - 11)) & 0x7FF;
        assert_eq!(sync_ext as u16, SYNC_EXTENSION_TYPE_SBR);
        let ext_object_type = (all_bits >> (total_bits - 16 - 11 - 5)) & 0x1F;
        assert_eq!(ext_object_type as u8, AUDIO_OBJECT_TYPE_SBR);
    }

    #[test]
    fn sbr_without_extension_sfi_is_rejected() {
        assert!(write(AudioCodec::AacLcSbr, 3, 2, None).is_err());
    }
}
