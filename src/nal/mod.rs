// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! NAL-unit codec layer: Annex-B/AVCC byte-stream conversion, SEI caption extraction,
//! and AAC ADTS/`AudioSpecificConfig` framing.

pub mod adts;
pub mod annexb;
pub mod asc;
pub mod avcc;
pub mod sei;
pub mod sps;

/// H.264 NAL unit types this engine recognizes by name (ISO/IEC 14496-10 table 7-1).
/// Anything else still scans, just tagged [`NalType::Unknown`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NalType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    Sps,
    Pps,
    Aud,
    EndOfSeq,
    EndOfStream,
    FillerData,
    Unknown(u8),
}

impl NalType {
    pub fn from_header_byte(b: u8) -> NalType {
        match b & NAL_TYPE_MASK {
            1 => NalType::NonIdrSlice,
            5 => NalType::IdrSlice,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            10 => NalType::EndOfSeq,
            11 => NalType::EndOfStream,
            12 => NalType::FillerData,
            n => NalType::Unknown(n),
        }
    }

    pub fn is_slice(self) -> bool {
        matches!(self, NalType::NonIdrSlice | NalType::IdrSlice)
    }
}

pub const NAL_TYPE_MASK: u8 = 0x1F;

/// One NAL unit located within a byte stream (Annex-B or AVCC): its type, its absolute
/// byte offset (of the NAL header byte, past any start code/length prefix), its payload
/// size (header byte included), and the size of the prefix that preceded it.
#[derive(Copy, Clone, Debug)]
pub struct NalLocation {
    pub nal_type: NalType,
    pub offset: usize,
    pub size: usize,
    pub prefix_size: usize,
}
