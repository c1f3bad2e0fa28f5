// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Track-level codec/timing/orientation metadata: per-track settings sum types and the
//! raw SPS/PPS extradata carrier.

use crate::data::Data;
use base::{bail, Error};

/// Rounds `x` down to the nearest even value.
pub fn even_floor(x: u32) -> u32 {
    x & !1
}

/// The raw SPS/PPS NAL bodies (header byte included, no start code/length prefix) plus the
/// AVCC NALU length size this track was encoded with.
#[derive(Clone, Debug)]
pub struct SpsPps {
    pub sps: Data<u8>,
    pub pps: Data<u8>,
    pub nalu_length_size: u8,
}

/// Which byte-stream dialect [`SpsPps::as_extradata`] should project to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ExtraDataType {
    /// ISO-BMFF `avcC` box body (ISO/IEC 14496-15 §5.2.4.1).
    Avcc,
    /// Annex-B byte stream: `00 00 00 01 <sps> 00 00 00 01 <pps>`.
    AnnexB,
    /// Length-prefixed NAL stream using this track's `nalu_length_size`.
    LengthPrefixed,
}

impl SpsPps {
    pub fn none() -> SpsPps {
        SpsPps {
            sps: Data::from_vec(Vec::new()),
            pps: Data::from_vec(Vec::new()),
            nalu_length_size: 4,
        }
    }

    pub fn as_extradata(&self, kind: ExtraDataType) -> Result<Data<u8>, Error> {
        match kind {
            ExtraDataType::Avcc => self.as_avcc(),
            ExtraDataType::AnnexB => Ok(Data::from_vec(self.as_annex_b())),
            ExtraDataType::LengthPrefixed => Ok(Data::from_vec(self.as_length_prefixed()?)),
        }
    }

    /// ISO/IEC 14496-15 `AVCDecoderConfigurationRecord`: version=1, profile/compat/level
    /// from SPS bytes 1..4, `lengthSizeMinusOne`, one SPS, one PPS.
    fn as_avcc(&self) -> Result<Data<u8>, Error> {
        let sps = self.sps.as_slice();
        if sps.len() < 4 {
            bail!(Invalid, msg("SPS too short to hold profile/level: {} bytes", sps.len()));
        }
        let mut out = Vec::with_capacity(11 + sps.len() + self.pps.as_slice().len());
        out.push(1); // configurationVersion
        out.push(sps[1]); // AVCProfileIndication
        out.push(sps[2]); // profile_compatibility
        out.push(sps[3]); // AVCLevelIndication
        out.push(0xFC | (self.nalu_length_size.saturating_sub(1) & 0x03));
        out.push(0xE1); // reserved(0b111) + numOfSequenceParameterSets(1)
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
        out.push(1); // numOfPictureParameterSets
        let pps = self.pps.as_slice();
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
        Ok(Data::from_vec(out))
    }

    fn as_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(self.sps.as_slice());
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(self.pps.as_slice());
        out
    }

    fn as_length_prefixed(&self) -> Result<Vec<u8>, Error> {
        let n = self.nalu_length_size;
        if n != 2 && n != 4 {
            bail!(Unsupported, msg("NALU length size {} unsupported", n));
        }
        let mut out = Vec::new();
        for part in [self.sps.as_slice(), self.pps.as_slice()] {
            if n == 4 {
                out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            } else {
                out.extend_from_slice(&(part.len() as u16).to_be_bytes());
            }
            out.extend_from_slice(part);
        }
        Ok(out)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Orientation {
    Landscape,
    Portrait,
    LandscapeReverse,
    PortraitReverse,
    Unknown,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VideoCodec {
    Unknown,
    H264,
    Vp8,
    Jpg,
    Png,
    Mpeg4,
    ProRes,
    Gif,
    Bmp,
    WebP,
    Tiff,
}

impl VideoCodec {
    /// True for still-image codecs this engine never decodes; the tag is still carried so
    /// a track can *name* its codec even when no decode path exists for it.
    pub fn is_image(self) -> bool {
        matches!(
            self,
            VideoCodec::Jpg
                | VideoCodec::Png
                | VideoCodec::Gif
                | VideoCodec::Bmp
                | VideoCodec::WebP
                | VideoCodec::Tiff
        )
    }
}

#[derive(Clone, Debug)]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub coded_width: u16,
    pub coded_height: u16,
    pub par_width: u16,
    pub par_height: u16,
    pub timescale: u32,
    pub orientation: Orientation,
    pub sps_pps: SpsPps,
}

impl VideoSettings {
    pub fn new(
        codec: VideoCodec,
        coded_width: u16,
        coded_height: u16,
        par_width: u16,
        par_height: u16,
        timescale: u32,
        orientation: Orientation,
        sps_pps: SpsPps,
    ) -> VideoSettings {
        VideoSettings {
            codec,
            coded_width,
            coded_height,
            par_width,
            par_height,
            timescale,
            orientation,
            sps_pps,
        }
    }

    pub fn square_pixel(
        codec: VideoCodec,
        width: u16,
        height: u16,
        timescale: u32,
        orientation: Orientation,
        sps_pps: SpsPps,
    ) -> VideoSettings {
        VideoSettings::new(codec, width, height, 1, 1, timescale, orientation, sps_pps)
    }

    /// The shorter pixel-aspect side is scaled down (even-floored).
    pub fn display_width(&self) -> u16 {
        if self.par_width >= self.par_height {
            self.coded_width
        } else {
            even_floor((self.coded_width as u32 * self.par_width as u32) / self.par_height as u32) as u16
        }
    }

    pub fn display_height(&self) -> u16 {
        if self.par_width <= self.par_height {
            self.coded_height
        } else {
            even_floor((self.coded_height as u32 * self.par_height as u32) / self.par_width as u32) as u16
        }
    }

    /// Returns a copy whose coded dimensions are the *display* dimensions and PAR is 1:1.
    pub fn to_square_pixel(&self) -> VideoSettings {
        VideoSettings {
            coded_width: self.display_width(),
            coded_height: self.display_height(),
            par_width: 1,
            par_height: 1,
            ..self.clone()
        }
    }
}

impl PartialEq for VideoSettings {
    fn eq(&self, o: &Self) -> bool {
        self.codec == o.codec
            && self.display_width() == o.display_width()
            && self.display_height() == o.display_height()
            && self.timescale == o.timescale
            && self.orientation == o.orientation
            && self.par_width == o.par_width
            && self.par_height == o.par_height
            && self.sps_pps.sps == o.sps_pps.sps
            && self.sps_pps.pps == o.sps_pps.pps
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AudioCodec {
    Unknown,
    AacMain,
    AacLc,
    AacLcSbr,
    Vorbis,
    PcmS16LE,
    PcmS16BE,
    PcmS24LE,
    PcmS24BE,
}

impl AudioCodec {
    pub fn is_aac(self) -> bool {
        matches!(self, AudioCodec::AacMain | AudioCodec::AacLc | AudioCodec::AacLcSbr)
    }

    pub fn is_pcm(self) -> bool {
        matches!(
            self,
            AudioCodec::PcmS16LE | AudioCodec::PcmS16BE | AudioCodec::PcmS24LE | AudioCodec::PcmS24BE
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioSettings {
    pub codec: AudioCodec,
    pub timescale: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DataCodec {
    Unknown,
    TimedId3,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSettings {
    pub codec: DataCodec,
    pub timescale: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CaptionCodec {
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptionSettings {
    pub codec: CaptionCodec,
    pub timescale: u32,
}

/// Sample-kind marker, generic parameter `K` of `Media<K, V>`. Each marker names the
/// `Settings` sum-type variant it is paired with.
pub trait Kind: Copy + Clone + std::fmt::Debug + Send + Sync + 'static {
    type Settings: Clone + std::fmt::Debug + Send + Sync + 'static;
}

#[derive(Copy, Clone, Debug)]
pub struct VideoKind;
impl Kind for VideoKind {
    type Settings = VideoSettings;
}

#[derive(Copy, Clone, Debug)]
pub struct AudioKind;
impl Kind for AudioKind {
    type Settings = AudioSettings;
}

#[derive(Copy, Clone, Debug)]
pub struct DataKind;
impl Kind for DataKind {
    type Settings = DataSettings;
}

#[derive(Copy, Clone, Debug)]
pub struct CaptionKind;
impl Kind for CaptionKind {
    type Settings = CaptionSettings;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_pps() -> SpsPps {
        SpsPps {
            sps: Data::from_vec(vec![0x67, 0x4d, 0x00, 0x1f]),
            pps: Data::from_vec(vec![0x68, 0xee, 0x3c, 0x80]),
            nalu_length_size: 4,
        }
    }

    #[test]
    fn display_dims_scale_shorter_par_side_even_floored() {
        let v = VideoSettings::new(
            VideoCodec::H264,
            640,
            480,
            40,
            33,
            30000,
            Orientation::Landscape,
            sps_pps(),
        );
        // par_width(40) > par_height(33) -> width stays 640, height shrinks.
        assert_eq!(v.display_width(), 640);
        assert_eq!(v.display_height(), even_floor(480 * 33 / 40));
    }

    #[test]
    fn to_square_pixel_resets_par_to_one() {
        let v = VideoSettings::square_pixel(VideoCodec::H264, 640, 360, 30000, Orientation::Landscape, sps_pps());
        let sq = v.to_square_pixel();
        assert_eq!(sq.par_width, 1);
        assert_eq!(sq.par_height, 1);
        assert_eq!(sq.coded_width, 640);
        assert_eq!(sq.coded_height, 360);
    }

    #[test]
    fn avcc_extradata_matches_iso_14496_15_layout() {
        let sp = sps_pps();
        let avcc = sp.as_extradata(ExtraDataType::Avcc).unwrap();
        let b = avcc.as_slice();
        assert_eq!(b[0], 1); // configurationVersion
        assert_eq!(b[1], 0x4d); // profile_idc
        assert_eq!(b[4] & 0x03, 3); // lengthSizeMinusOne for a 4-byte length
        assert_eq!(b[5], 0xE1);
    }
}
