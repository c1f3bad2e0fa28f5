// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `stsd` sample description parsing and writing: `avc1`/`avcC` for H.264, `mp4a`/`esds`
//! for AAC.

use crate::data::Data;
use crate::mp4::boxes::{self, BoxWriter};
use crate::settings::{AudioCodec, ExtraDataType, SpsPps, VideoCodec};
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder};

pub struct VideoSampleEntry {
    pub codec: VideoCodec,
    pub coded_width: u16,
    pub coded_height: u16,
    pub sps_pps: SpsPps,
}

/// Parses the first entry of a video `stsd` box (`data` is the full box body: version,
/// flags, and entry_count followed by one or more sample entries).
pub fn parse_video_stsd(data: &[u8]) -> Result<VideoSampleEntry, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("stsd needs at least 8 bytes, got {}", data.len()));
    }
    let h = boxes::find(data, (8, data.len()), b"avc1")?
        .ok_or_else(|| base::err!(Unsupported, msg("only avc1 video sample entries are supported")))?;
    let body = &data[h.body_start..h.body_end];
    if body.len() < 78 {
        bail!(Invalid, msg("avc1 sample entry needs at least 78 bytes, got {}", body.len()));
    }
    let coded_width = BigEndian::read_u16(&body[24..26]);
    let coded_height = BigEndian::read_u16(&body[26..28]);
    let avcc = boxes::find(body, (78, body.len()), b"avcC")?
        .ok_or_else(|| base::err!(Invalid, msg("avc1 sample entry missing avcC")))?;
    let sps_pps = parse_avcc(&body[avcc.body_start..avcc.body_end])?;
    Ok(VideoSampleEntry { codec: VideoCodec::H264, coded_width, coded_height, sps_pps })
}

/// Parses an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.2.4.1) into this crate's
/// [`SpsPps`]. Only the first SPS/PPS is kept; multi-SPS streams are unsupported.
pub fn parse_avcc(data: &[u8]) -> Result<SpsPps, Error> {
    if data.len() < 7 {
        bail!(Invalid, msg("avcC needs at least 7 bytes, got {}", data.len()));
    }
    let nalu_length_size = (data[4] & 0x03) + 1;
    let num_sps = data[5] & 0x1F;
    if num_sps == 0 {
        bail!(Invalid, msg("avcC declares zero SPS"));
    }
    let mut pos = 6usize;
    if pos + 2 > data.len() {
        bail!(Invalid, msg("avcC truncated before SPS length"));
    }
    let sps_len = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
    pos += 2;
    if pos + sps_len > data.len() {
        bail!(Invalid, msg("avcC SPS length {} exceeds buffer", sps_len));
    }
    let sps = Data::from_vec(data[pos..pos + sps_len].to_vec());
    pos += sps_len;
    if pos >= data.len() {
        bail!(Invalid, msg("avcC truncated before PPS count"));
    }
    let num_pps = data[pos];
    pos += 1;
    if num_pps == 0 {
        bail!(Invalid, msg("avcC declares zero PPS"));
    }
    if pos + 2 > data.len() {
        bail!(Invalid, msg("avcC truncated before PPS length"));
    }
    let pps_len = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
    pos += 2;
    if pos + pps_len > data.len() {
        bail!(Invalid, msg("avcC PPS length {} exceeds buffer", pps_len));
    }
    let pps = Data::from_vec(data[pos..pos + pps_len].to_vec());
    Ok(SpsPps { sps, pps, nalu_length_size })
}

pub struct AudioSampleEntry {
    pub codec: AudioCodec,
    pub channels: u8,
    pub sample_rate: u32,
    pub bitrate: u32,
}

/// Parses the first entry of an audio `stsd` box: `mp4a`/`esds` (AAC), or one of the PCM
/// sample-entry codes `sowt`/`twos` (16-bit) and `in24` (24-bit, endianness read from a
/// nested `wave`/`enda` atom).
pub fn parse_audio_stsd(data: &[u8]) -> Result<AudioSampleEntry, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("stsd needs at least 8 bytes, got {}", data.len()));
    }
    if let Some(h) = boxes::find(data, (8, data.len()), b"mp4a")? {
        let body = &data[h.body_start..h.body_end];
        let (channels, sample_rate) = read_channels_and_rate(body)?;
        let esds = boxes::find(body, (28, body.len()), b"esds")?
            .ok_or_else(|| base::err!(Invalid, msg("mp4a sample entry missing esds")))?;
        let bitrate = parse_esds_bitrate(&body[esds.body_start..esds.body_end])?;
        return Ok(AudioSampleEntry { codec: AudioCodec::AacLc, channels, sample_rate, bitrate });
    }
    if let Some(h) = boxes::find(data, (8, data.len()), b"sowt")? {
        let (channels, sample_rate) = read_channels_and_rate(&data[h.body_start..h.body_end])?;
        return Ok(AudioSampleEntry { codec: AudioCodec::PcmS16LE, channels, sample_rate, bitrate: 0 });
    }
    if let Some(h) = boxes::find(data, (8, data.len()), b"twos")? {
        let (channels, sample_rate) = read_channels_and_rate(&data[h.body_start..h.body_end])?;
        return Ok(AudioSampleEntry { codec: AudioCodec::PcmS16BE, channels, sample_rate, bitrate: 0 });
    }
    if let Some(h) = boxes::find(data, (8, data.len()), b"in24")? {
        let body = &data[h.body_start..h.body_end];
        let (channels, sample_rate) = read_channels_and_rate(body)?;
        let codec = if read_wave_enda(body)? { AudioCodec::PcmS24LE } else { AudioCodec::PcmS24BE };
        return Ok(AudioSampleEntry { codec, channels, sample_rate, bitrate: 0 });
    }
    bail!(Unsupported, msg("unsupported audio sample entry (expected mp4a, sowt, twos, or in24)"));
}

/// Reads `channels`/`samplerate` out of the common QuickTime sound sample-entry prefix
/// (reserved(6), data_reference_index(2), version/revision/vendor(8), channels(2),
/// samplesize(2), pre_defined(2), reserved(2), samplerate as 16.16 fixed point(4)) shared
/// by `mp4a`, `sowt`, `twos`, and `in24`.
fn read_channels_and_rate(body: &[u8]) -> Result<(u8, u32), Error> {
    if body.len() < 28 {
        bail!(Invalid, msg("audio sample entry needs at least 28 bytes, got {}", body.len()));
    }
    let channels = BigEndian::read_u16(&body[16..18]) as u8;
    let sample_rate = (BigEndian::read_u32(&body[24..28]) >> 16) as u32;
    Ok((channels, sample_rate))
}

/// Reads the `enda` atom nested in a sample entry's `wave` compatibility atom: value `1`
/// means little-endian PCM. A missing `wave` or `enda` atom defaults to big-endian, the
/// classic QuickTime convention for `in24` without an explicit format-flags blob.
fn read_wave_enda(body: &[u8]) -> Result<bool, Error> {
    let wave = match boxes::find(body, (28, body.len()), b"wave")? {
        Some(h) => h,
        None => return Ok(false),
    };
    let enda = match boxes::find(body, (wave.body_start, wave.body_end), b"enda")? {
        Some(h) => h,
        None => return Ok(false),
    };
    let enda_body = &body[enda.body_start..enda.body_end];
    if enda_body.len() < 2 {
        bail!(Invalid, msg("enda atom needs at least 2 bytes, got {}", enda_body.len()));
    }
    Ok(BigEndian::read_u16(&enda_body[0..2]) == 1)
}

/// `sample_size` in bits for each PCM codec this engine writes/reads; `None` for non-PCM.
pub fn pcm_bits_per_sample(codec: AudioCodec) -> Option<u16> {
    match codec {
        AudioCodec::PcmS16LE | AudioCodec::PcmS16BE => Some(16),
        AudioCodec::PcmS24LE | AudioCodec::PcmS24BE => Some(24),
        _ => None,
    }
}

const ES_DESCR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCR_TAG: u8 = 0x04;

/// Reads an MPEG-4 descriptor's tag and length, per ISO/IEC 14496-1 §8.3.3's variable-length
/// size field (each size byte's top bit signals continuation).
fn read_descriptor_header(data: &[u8], mut pos: usize) -> Result<(u8, usize, usize), Error> {
    if pos >= data.len() {
        bail!(Invalid, msg("descriptor tag missing at offset {}", pos));
    }
    let tag = data[pos];
    pos += 1;
    let mut size = 0usize;
    for _ in 0..4 {
        if pos >= data.len() {
            bail!(Invalid, msg("descriptor size truncated at offset {}", pos));
        }
        let b = data[pos];
        pos += 1;
        size = (size << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok((tag, pos, size))
}

/// Extracts the average bitrate field from `esds`'s nested `DecoderConfigDescriptor`.
/// `version/flags` (4 bytes) precede the descriptor tree.
fn parse_esds_bitrate(data: &[u8]) -> Result<u32, Error> {
    if data.len() < 4 {
        bail!(Invalid, msg("esds needs at least 4 bytes, got {}", data.len()));
    }
    let (tag, body_start, _) = read_descriptor_header(data, 4)?;
    if tag != ES_DESCR_TAG {
        bail!(Invalid, msg("esds missing ES_Descriptor tag"));
    }
    // ES_ID(2) + flags(1), then optional fields this crate doesn't need.
    let (tag, cfg_start, cfg_len) = read_descriptor_header(data, body_start + 3)?;
    if tag != DECODER_CONFIG_DESCR_TAG {
        bail!(Invalid, msg("esds missing DecoderConfigDescriptor tag"));
    }
    if cfg_len < 13 || cfg_start + 13 > data.len() {
        bail!(Invalid, msg("DecoderConfigDescriptor too short"));
    }
    Ok(BigEndian::read_u32(&data[cfg_start + 9..cfg_start + 13]))
}

/// Writes an MPEG-4 descriptor (ISO/IEC 14496-1 §8.3.3) with a single-byte length field.
/// Bodies this crate ever writes (`esds`'s descriptor tree) stay well under 128 bytes.
fn write_descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) -> Result<(), Error> {
    if body.len() >= 0x80 {
        bail!(Unsupported, msg("descriptor body of {} bytes exceeds this writer's single-byte length field", body.len()));
    }
    out.push(tag);
    out.push(body.len() as u8);
    out.extend_from_slice(body);
    Ok(())
}

fn write_esds(asc: &[u8], bitrate: u32) -> Result<Vec<u8>, Error> {
    let mut decoder_specific_info = Vec::new();
    write_descriptor(&mut decoder_specific_info, 0x05, asc)?;

    let mut decoder_config = vec![0x40, 0x15, 0, 0, 0]; // objectTypeIndication=AAC, streamType=audio
    decoder_config.extend_from_slice(&bitrate.to_be_bytes()); // maxBitrate
    decoder_config.extend_from_slice(&bitrate.to_be_bytes()); // avgBitrate
    decoder_config.extend_from_slice(&decoder_specific_info);
    let mut decoder_config_descr = Vec::new();
    write_descriptor(&mut decoder_config_descr, DECODER_CONFIG_DESCR_TAG, &decoder_config)?;

    let mut sl_config_descr = Vec::new();
    write_descriptor(&mut sl_config_descr, 0x06, &[0x02])?;

    let mut es_body = vec![0, 1, 0]; // ES_ID=1, flags=0
    es_body.extend_from_slice(&decoder_config_descr);
    es_body.extend_from_slice(&sl_config_descr);
    let mut es_descr = Vec::new();
    write_descriptor(&mut es_descr, ES_DESCR_TAG, &es_body)?;

    let mut out = vec![0, 0, 0, 0]; // version/flags
    out.extend_from_slice(&es_descr);
    Ok(out)
}

/// Writes a full `stsd` box body (version/flags/entry_count plus one `avc1` sample entry).
pub fn write_video_stsd(codec: VideoCodec, coded_width: u16, coded_height: u16, sps_pps: &SpsPps) -> Result<Vec<u8>, Error> {
    if codec != VideoCodec::H264 {
        bail!(Unsupported, msg("only H264 video sample entries can be written"));
    }
    let avcc = sps_pps.as_extradata(ExtraDataType::Avcc)?;
    let mut w = BoxWriter::new();
    w.append_u32(0); // version/flags
    w.append_u32(1); // entry_count
    w.write_box(b"avc1", |w| {
        w.append_bytes(&[0u8; 6]); // reserved
        w.append_u16(1); // data_reference_index
        w.append_u16(0); // pre_defined
        w.append_u16(0); // reserved
        w.append_bytes(&[0u8; 12]); // pre_defined[3]
        w.append_u16(coded_width);
        w.append_u16(coded_height);
        w.append_u32(0x00480000); // horizresolution, 72 dpi
        w.append_u32(0x00480000); // vertresolution, 72 dpi
        w.append_u32(0); // reserved
        w.append_u16(1); // frame_count
        w.append_bytes(&[0u8; 32]); // compressorname
        w.append_u16(0x0018); // depth
        w.append_i32(-1); // pre_defined
        w.write_box(b"avcC", |w| {
            w.append_bytes(avcc.as_slice());
            Ok(())
        })
    })?;
    Ok(w.into_vec())
}

/// Writes a full `stsd` box body (version/flags/entry_count plus one `mp4a` sample entry).
pub fn write_audio_stsd(
    codec: AudioCodec,
    channels: u8,
    sample_rate: u32,
    bitrate: u32,
    asc: &[u8],
) -> Result<Vec<u8>, Error> {
    if !codec.is_aac() {
        bail!(Unsupported, msg("only AAC audio sample entries can be written"));
    }
    let esds = write_esds(asc, bitrate)?;
    let mut w = BoxWriter::new();
    w.append_u32(0); // version/flags
    w.append_u32(1); // entry_count
    w.write_box(b"mp4a", |w| {
        w.append_bytes(&[0u8; 6]); // reserved
        w.append_u16(1); // data_reference_index
        w.append_u32(0); // version/revision
        w.append_u32(0); // vendor
        w.append_u16(channels as u16);
        w.append_u16(16); // samplesize
        w.append_u16(0); // pre_defined
        w.append_u16(0); // reserved
        w.append_u32((sample_rate as u32) << 16);
        w.write_box(b"esds", |w| {
            w.append_bytes(&esds);
            Ok(())
        })
    })?;
    Ok(w.into_vec())
}

/// Writes a full `stsd` box body for a PCM audio track: version/flags/entry_count plus
/// one `sowt`/`twos`/`in24` sample entry. 24-bit entries carry a `wave`/`enda` atom so
/// readers recover the endianness the sample-entry code alone can't express.
pub fn write_pcm_audio_stsd(codec: AudioCodec, channels: u8, sample_rate: u32) -> Result<Vec<u8>, Error> {
    let bits = pcm_bits_per_sample(codec).ok_or_else(|| base::err!(Unsupported, msg("{:?} is not a PCM codec", codec)))?;
    let (fourcc, little_endian): (&[u8; 4], bool) = match codec {
        AudioCodec::PcmS16LE => (b"sowt", true),
        AudioCodec::PcmS16BE => (b"twos", false),
        AudioCodec::PcmS24LE => (b"in24", true),
        AudioCodec::PcmS24BE => (b"in24", false),
        _ => unreachable!("checked by pcm_bits_per_sample above"),
    };
    let mut w = BoxWriter::new();
    w.append_u32(0); // version/flags
    w.append_u32(1); // entry_count
    w.write_box(fourcc, |w| {
        w.append_bytes(&[0u8; 6]); // reserved
        w.append_u16(1); // data_reference_index
        w.append_u32(0); // version/revision
        w.append_u32(0); // vendor
        w.append_u16(channels as u16);
        w.append_u16(bits);
        w.append_u16(0); // pre_defined
        w.append_u16(0); // reserved
        w.append_u32(sample_rate << 16);
        if fourcc == b"in24" {
            w.write_box(b"wave", |w| {
                w.write_box(b"enda", |w| {
                    w.append_u16(if little_endian { 1 } else { 0 });
                    Ok(())
                })
            })?;
        }
        Ok(())
    })?;
    Ok(w.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(box_type);
        out.extend_from_slice(body);
        out
    }

    fn synth_avcc() -> Vec<u8> {
        let sps = [0x67u8, 0x4d, 0x00, 0x1f, 0xAA];
        let pps = [0x68u8, 0xee, 0x3c, 0x80];
        let mut out = vec![1, sps[1], sps[2], sps[3], 0xFF, 0xE1];
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(&sps);
        out.push(1);
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(&pps);
        out
    }

    #[test]
    fn parses_avcc_sps_and_pps() {
        let sp = parse_avcc(&synth_avcc()).unwrap();
        assert_eq!(sp.nalu_length_size, 4);
        assert_eq!(sp.sps.as_slice(), &[0x67, 0x4d, 0x00, 0x1f, 0xAA]);
        assert_eq!(sp.pps.as_slice(), &[0x68, 0xee, 0x3c, 0x80]);
    }

    #[test]
    fn parses_video_stsd_dimensions() {
        let mut avc1_body = vec![0u8; 78 - 8];
        BigEndian::write_u16(&mut avc1_body[24 - 8..26 - 8], 1280);
        BigEndian::write_u16(&mut avc1_body[26 - 8..28 - 8], 720);
        avc1_body.extend_from_slice(&make_box(b"avcC", &synth_avcc()));
        let avc1 = make_box(b"avc1", &avc1_body);
        let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
        stsd.extend_from_slice(&avc1);
        let e = parse_video_stsd(&stsd).unwrap();
        assert_eq!(e.coded_width, 1280);
        assert_eq!(e.coded_height, 720);
        assert_eq!(e.codec, VideoCodec::H264);
    }

    #[test]
    fn parses_esds_bitrate() {
        let mut dec_cfg = vec![0x40u8, 0x15, 0, 0, 0]; // objectTypeIndication + flags + bufferSizeDB
        dec_cfg.extend_from_slice(&128_000u32.to_be_bytes()); // maxBitrate
        dec_cfg.extend_from_slice(&96_000u32.to_be_bytes()); // avgBitrate
        let mut dec_cfg_descr = vec![DECODER_CONFIG_DESCR_TAG, dec_cfg.len() as u8];
        dec_cfg_descr.extend_from_slice(&dec_cfg);
        let mut es_body = vec![0, 1, 0]; // ES_ID + flags
        es_body.extend_from_slice(&dec_cfg_descr);
        let mut es_descr = vec![ES_DESCR_TAG, es_body.len() as u8];
        es_descr.extend_from_slice(&es_body);
        let mut esds = vec![0, 0, 0, 0]; // version/flags
        esds.extend_from_slice(&es_descr);
        assert_eq!(parse_esds_bitrate(&esds).unwrap(), 96_000);
    }

    #[test]
    fn written_video_stsd_round_trips_through_parse() {
        let sps_pps = SpsPps {
            sps: Data::from_vec(vec![0x67, 0x4d, 0x00, 0x1f, 0xAA]),
            pps: Data::from_vec(vec![0x68, 0xee, 0x3c, 0x80]),
            nalu_length_size: 4,
        };
        let stsd = write_video_stsd(VideoCodec::H264, 1280, 720, &sps_pps).unwrap();
        let e = parse_video_stsd(&stsd).unwrap();
        assert_eq!(e.coded_width, 1280);
        assert_eq!(e.coded_height, 720);
        assert_eq!(e.sps_pps.sps, sps_pps.sps);
        assert_eq!(e.sps_pps.pps, sps_pps.pps);
    }

    #[test]
    fn written_audio_stsd_round_trips_through_parse() {
        let asc = crate::nal::asc::write(AudioCodec::AacLc, 4, 2, None).unwrap();
        let stsd = write_audio_stsd(AudioCodec::AacLc, 2, 44100, 96_000, &asc).unwrap();
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.channels, 2);
        assert_eq!(e.sample_rate, 44100);
        assert_eq!(e.bitrate, 96_000);
    }

    #[test]
    fn written_pcm_s16le_stsd_round_trips_through_parse() {
        let stsd = write_pcm_audio_stsd(AudioCodec::PcmS16LE, 2, 48_000).unwrap();
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS16LE);
        assert_eq!(e.channels, 2);
        assert_eq!(e.sample_rate, 48_000);
    }

    #[test]
    fn written_pcm_s16be_stsd_round_trips_through_parse() {
        let stsd = write_pcm_audio_stsd(AudioCodec::PcmS16BE, 1, 44_100).unwrap();
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS16BE);
        assert_eq!(e.channels, 1);
        assert_eq!(e.sample_rate, 44_100);
    }

    #[test]
    fn written_pcm_s24le_stsd_round_trips_through_parse() {
        let stsd = write_pcm_audio_stsd(AudioCodec::PcmS24LE, 2, 96_000).unwrap();
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS24LE);
        assert_eq!(e.channels, 2);
        assert_eq!(e.sample_rate, 96_000);
    }

    #[test]
    fn written_pcm_s24be_stsd_round_trips_through_parse() {
        let stsd = write_pcm_audio_stsd(AudioCodec::PcmS24BE, 2, 96_000).unwrap();
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS24BE);
    }

    #[test]
    fn in24_without_wave_enda_defaults_to_big_endian() {
        // A bare `in24` sample entry with no `wave`/`enda` child, built by hand rather than
        // through `write_pcm_audio_stsd` (which always emits the `wave`/`enda` box).
        let mut body = vec![0u8; 28];
        BigEndian::write_u16(&mut body[16..18], 2);
        BigEndian::write_u32(&mut body[24..28], 48_000 << 16);
        let in24 = make_box(b"in24", &body);
        let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
        stsd.extend_from_slice(&in24);
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS24BE);
    }

    #[test]
    fn sowt_sample_entry_parses_as_pcm_s16le() {
        let mut body = vec![0u8; 28];
        BigEndian::write_u16(&mut body[16..18], 1);
        BigEndian::write_u32(&mut body[24..28], 44_100 << 16);
        let sowt = make_box(b"sowt", &body);
        let mut stsd = vec![0, 0, 0, 0, 0, 0, 0, 1];
        stsd.extend_from_slice(&sowt);
        let e = parse_audio_stsd(&stsd).unwrap();
        assert_eq!(e.codec, AudioCodec::PcmS16LE);
        assert_eq!(e.channels, 1);
        assert_eq!(e.sample_rate, 44_100);
    }
}
