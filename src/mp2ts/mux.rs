// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The MPEG-2 Transport Stream multiplexer: PAT/PMT once up front, then every track's
//! samples packetized into PES and interleaved onto the output byte stream in DTS order.

use crate::mp2ts::pes;
use crate::nal::{adts, avcc};
use crate::sample::Sample;
use crate::settings::{AudioSettings, DataSettings, ExtraDataType, VideoSettings};
use base::{bail, Error};
use std::collections::HashMap;

pub struct VideoTrackInput<'a> {
    pub settings: &'a VideoSettings,
    pub samples: &'a [Sample],
}

pub struct AudioTrackInput<'a> {
    pub settings: &'a AudioSettings,
    pub samples: &'a [Sample],
}

pub struct DataTrackInput<'a> {
    pub settings: &'a DataSettings,
    pub samples: &'a [Sample],
}

/// One MP2TS output to produce from a set of demuxed/transcoded tracks.
pub struct MuxInput<'a> {
    pub video: Option<VideoTrackInput<'a>>,
    pub audio: Option<AudioTrackInput<'a>>,
    pub data: Option<DataTrackInput<'a>>,
    /// Caption samples, searched by matching pts against each video sample (§4.7).
    pub captions: Option<&'a [Sample]>,
}

const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;
const DATA_STREAM_ID: u8 = 0xFC;

/// Access unit delimiter NAL (primary_pic_type=7, "any slice type") prepended to every
/// access unit. Demuxing strips these to find frame boundaries, so muxing must
/// resynthesize one per sample or a re-demux of this output would never see one.
const AUD_ANNEXB: [u8; 6] = [0, 0, 0, 1, 0x09, 0xF0];

/// Per-track, per-PID bookkeeping the byte-stream writer carries across the whole mux call.
struct Writer {
    out: Vec<u8>,
    video_cc: u8,
    audio_cc: u8,
    data_cc: u8,
    pat_cc: u8,
    pmt_cc: u8,
}

impl Writer {
    fn new() -> Writer {
        Writer { out: Vec::new(), video_cc: 0, audio_cc: 0, data_cc: 0, pat_cc: 0, pmt_cc: 0 }
    }
}

/// Produces a complete MP2TS byte stream from `input`: PAT and PMT sections (emitted once,
/// per §4.7's "very long period" — this engine never needs to repeat them within a single
/// call), then every sample packetized as PES and interleaved across tracks by DTS.
pub fn mux(input: &MuxInput) -> Result<Vec<u8>, Error> {
    if input.video.is_none() && input.audio.is_none() && input.data.is_none() {
        bail!(InvalidArguments, msg("mux requires at least one track"));
    }
    let mut w = Writer::new();

    let video_pid = input.video.as_ref().map(|_| pes::VIDEO_PID);
    let audio_pid = input.audio.as_ref().map(|_| pes::AUDIO_PID);
    let data_pid = input.data.as_ref().map(|_| pes::DATA_PID);
    write_pat_pmt(&mut w, video_pid, audio_pid, data_pid)?;

    let captions_by_pts: HashMap<i64, &Sample> =
        input.captions.map(|c| c.iter().map(|s| (s.pts, s)).collect()).unwrap_or_default();

    let entries = order_samples(input);
    for entry in entries {
        match entry.tag {
            TrackTag::Video => write_video_sample(
                &mut w,
                input.video.as_ref().unwrap().settings,
                &input.video.as_ref().unwrap().samples[entry.index],
                &captions_by_pts,
            )?,
            TrackTag::Audio => write_audio_sample(
                &mut w,
                input.audio.as_ref().unwrap().settings,
                &input.audio.as_ref().unwrap().samples[entry.index],
            )?,
            TrackTag::Data => {
                write_data_sample(&mut w, &input.data.as_ref().unwrap().samples[entry.index])?
            }
        }
    }
    Ok(w.out)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum TrackTag {
    Video,
    Audio,
    Data,
}

struct OrderedEntry {
    tag: TrackTag,
    index: usize,
    dts_seconds: f64,
}

/// Flattens every track's samples into one DTS-ascending sequence, each timestamp
/// normalized to seconds via its own track's timescale (§5's "DTS-interleave" ordering
/// guarantee). Since the whole track set is already resident in memory, a single stable
/// sort reaches the same total order as a bounded two-track merge would, just without the
/// bounded-lookahead cache that streaming onto an unbounded live source would need.
fn order_samples(input: &MuxInput) -> Vec<OrderedEntry> {
    let mut out = Vec::new();
    if let Some(v) = &input.video {
        let ts = v.settings.timescale.max(1) as f64;
        out.extend((0..v.samples.len()).map(|i| OrderedEntry { tag: TrackTag::Video, index: i, dts_seconds: v.samples[i].dts as f64 / ts }));
    }
    if let Some(a) = &input.audio {
        let ts = a.settings.timescale.max(1) as f64;
        out.extend((0..a.samples.len()).map(|i| OrderedEntry { tag: TrackTag::Audio, index: i, dts_seconds: a.samples[i].dts as f64 / ts }));
    }
    if let Some(d) = &input.data {
        let ts = d.settings.timescale.max(1) as f64;
        out.extend((0..d.samples.len()).map(|i| OrderedEntry { tag: TrackTag::Data, index: i, dts_seconds: d.samples[i].dts as f64 / ts }));
    }
    out.sort_by(|a, b| a.dts_seconds.partial_cmp(&b.dts_seconds).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Builds the Annex-B access unit for one video sample: SPS/PPS (from track settings) and
/// any caption NAL prepended ahead of the sample's own NALs on keyframes, per §4.7.
fn write_video_sample(
    w: &mut Writer,
    settings: &VideoSettings,
    sample: &Sample,
    captions_by_pts: &HashMap<i64, &Sample>,
) -> Result<(), Error> {
    let payload = sample.payload()?;
    let mut annexb = Vec::new();
    annexb.extend_from_slice(&AUD_ANNEXB);
    if sample.keyframe {
        let extradata = settings.sps_pps.as_extradata(ExtraDataType::AnnexB)?;
        annexb.extend_from_slice(extradata.as_slice());
        if let Some(caption) = captions_by_pts.get(&sample.pts) {
            let caption_payload = caption.payload()?;
            if !caption_payload.as_slice().is_empty() {
                annexb.extend_from_slice(&avcc::avcc_to_annexb(caption_payload.as_slice(), 4)?);
            }
        }
    }
    annexb.extend_from_slice(&avcc::avcc_to_annexb(payload.as_slice(), 4)?);

    let mut pes_payload = Vec::with_capacity(annexb.len() + 20);
    pes::write_pes(&mut pes_payload, VIDEO_STREAM_ID, sample.pts, Some(sample.dts), &annexb);
    pes::write_packets(&mut w.out, pes::VIDEO_PID, &pes_payload, &mut w.video_cc);
    Ok(())
}

/// Wraps one raw AAC frame in a freshly synthesized ADTS header, per §4.7.
fn write_audio_sample(w: &mut Writer, settings: &AudioSettings, sample: &Sample) -> Result<(), Error> {
    let payload = sample.payload()?;
    let raw = payload.as_slice();
    let sfi = adts::sampling_frequency_index_for_rate(settings.sample_rate)?;
    let channel_configuration = if settings.channels == 1 { 1 } else { 2 };

    let mut frame = Vec::with_capacity(raw.len() + 7);
    adts::write_header(&mut frame, sfi, channel_configuration, raw.len())?;
    frame.extend_from_slice(raw);

    let mut pes_payload = Vec::with_capacity(frame.len() + 20);
    pes::write_pes(&mut pes_payload, AUDIO_STREAM_ID, sample.pts, Some(sample.dts), &frame);
    pes::write_packets(&mut w.out, pes::AUDIO_PID, &pes_payload, &mut w.audio_cc);
    Ok(())
}

fn write_data_sample(w: &mut Writer, sample: &Sample) -> Result<(), Error> {
    let payload = sample.payload()?;
    let mut pes_payload = Vec::with_capacity(payload.as_slice().len() + 20);
    pes::write_pes(&mut pes_payload, DATA_STREAM_ID, sample.pts, Some(sample.dts), payload.as_slice());
    pes::write_packets(&mut w.out, pes::DATA_PID, &pes_payload, &mut w.data_cc);
    Ok(())
}

/// MPEG-2 CRC32 (ISO/IEC 13818-1 Annex A): polynomial `0x04C1_1DB7`, no reflection, no
/// final XOR — the variant PAT/PMT sections (and nothing else in this codec stack) use.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
        }
    }
    crc
}

/// Wraps `body` (the section fields after `table_id`/`section_length`, before the CRC) into
/// a complete PSI section: version/current_next/section-number fields fixed at their
/// simplest legal values (single-section, version 0, current), plus the trailing CRC32.
fn build_psi_section(table_id: u8, table_id_extension: u16, body: &[u8]) -> Vec<u8> {
    let mut section = Vec::with_capacity(9 + body.len());
    section.push(table_id);
    section.push(0); // section_length placeholder, filled in below
    section.push(0);
    section.extend_from_slice(&table_id_extension.to_be_bytes());
    section.push(0xC1); // reserved(2)='11' + version_number(5)=0 + current_next_indicator(1)=1
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section.extend_from_slice(body);

    let section_length = (section.len() - 3) + 4; // from table_id_extension through CRC32
    section[1] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
    section[2] = (section_length & 0xFF) as u8;

    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn build_pat_section(pmt_pid: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // program_number
    body.extend_from_slice(&(0xE000 | (pmt_pid & 0x1FFF)).to_be_bytes());
    build_psi_section(0x00, 1, &body) // transport_stream_id = 1
}

fn build_pmt_section(video_pid: Option<u16>, audio_pid: Option<u16>, data_pid: Option<u16>) -> Vec<u8> {
    let pcr_pid = video_pid.or(audio_pid).or(data_pid).unwrap_or(0x1FFF);
    let mut body = Vec::new();
    body.extend_from_slice(&(0xE000 | (pcr_pid & 0x1FFF)).to_be_bytes());
    body.extend_from_slice(&0xF000u16.to_be_bytes()); // reserved + program_info_length=0
    let mut push_stream = |body: &mut Vec<u8>, stream_type: u8, pid: u16| {
        body.push(stream_type);
        body.extend_from_slice(&(0xE000 | (pid & 0x1FFF)).to_be_bytes());
        body.extend_from_slice(&0xF000u16.to_be_bytes()); // reserved + ES_info_length=0
    };
    if let Some(pid) = video_pid {
        push_stream(&mut body, pes::STREAM_TYPE_H264, pid);
    }
    if let Some(pid) = audio_pid {
        push_stream(&mut body, pes::STREAM_TYPE_AAC_ADTS, pid);
    }
    if let Some(pid) = data_pid {
        push_stream(&mut body, pes::STREAM_TYPE_TIMED_ID3, pid);
    }
    build_psi_section(0x02, 1, &body) // table_id_extension = program_number = 1
}

fn write_pat_pmt(w: &mut Writer, video_pid: Option<u16>, audio_pid: Option<u16>, data_pid: Option<u16>) -> Result<(), Error> {
    let pat = build_pat_section(pes::PMT_PID);
    let mut pat_payload = vec![0x00];
    pat_payload.extend_from_slice(&pat);
    pes::write_packets(&mut w.out, pes::PAT_PID, &pat_payload, &mut w.pat_cc);

    let pmt = build_pmt_section(video_pid, audio_pid, data_pid);
    let mut pmt_payload = vec![0x00];
    pmt_payload.extend_from_slice(&pmt);
    pes::write_packets(&mut w.out, pes::PMT_PID, &pmt_payload, &mut w.pmt_cc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::sample::SampleKind;
    use crate::settings::{AudioCodec, DataCodec, Orientation, SpsPps, VideoCodec};

    fn sps_pps() -> SpsPps {
        SpsPps {
            sps: Data::from_vec(vec![0x67, 0x42, 0x00, 0x1f, 0xAA]),
            pps: Data::from_vec(vec![0x68, 0xCE, 0x3C, 0x80]),
            nalu_length_size: 4,
        }
    }

    fn video_settings() -> VideoSettings {
        VideoSettings::square_pixel(VideoCodec::H264, 1280, 720, crate::limits::MP2TS_TIMESCALE, Orientation::Unknown, sps_pps())
    }

    fn avcc_nal(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(bytes);
        out
    }

    #[test]
    fn crc32_matches_known_zero_length_value() {
        assert_eq!(crc32_mpeg2(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn pat_section_round_trips_through_demux_parser() {
        let pat = build_pat_section(pes::PMT_PID);
        let pid = crate::mp2ts::demux::parse_pat(&pat).unwrap();
        assert_eq!(pid, Some(pes::PMT_PID));
    }

    #[test]
    fn pmt_section_round_trips_through_demux_parser() {
        let pmt = build_pmt_section(Some(pes::VIDEO_PID), Some(pes::AUDIO_PID), None);
        let mapping = crate::mp2ts::demux::parse_pmt(&pmt).unwrap();
        assert_eq!(mapping.video_pid, Some(pes::VIDEO_PID));
        assert_eq!(mapping.audio_pid, Some(pes::AUDIO_PID));
        assert_eq!(mapping.data_pid, None);
    }

    #[test]
    fn mux_prepends_sps_pps_on_keyframes_only() {
        let settings = video_settings();
        let samples = vec![
            Sample::from_data(0, 0, true, SampleKind::Video, Data::from_vec(avcc_nal(&[0x65, 1, 2, 3]))),
            Sample::from_data(3000, 3000, false, SampleKind::Video, Data::from_vec(avcc_nal(&[0x41, 4, 5]))),
        ];
        let input = MuxInput {
            video: Some(VideoTrackInput { settings: &settings, samples: &samples }),
            audio: None,
            data: None,
            captions: None,
        };
        let out = mux(&input).unwrap();
        assert_eq!(out.len() % pes::TS_PACKET_SIZE, 0);
        // First packet past PAT/PMT starts the keyframe's PES, which must contain the SPS NAL.
        let mut found_sps = false;
        for chunk in out.chunks_exact(pes::TS_PACKET_SIZE) {
            let p = pes::parse_packet(chunk).unwrap();
            if p.pid == pes::VIDEO_PID && p.payload_unit_start {
                let h = pes::parse_pes_header(p.payload).unwrap();
                let es = &p.payload[h.header_len..];
                if es.len() > 5 && es[4] & 0x1F == 7 {
                    found_sps = true;
                }
            }
        }
        assert!(found_sps);
    }

    #[test]
    fn mux_wraps_audio_frames_in_adts() {
        let settings = AudioSettings { codec: AudioCodec::AacLc, timescale: 90_000, sample_rate: 44100, channels: 2, bitrate: 0 };
        let samples = vec![Sample::from_data(0, 0, true, SampleKind::Audio, Data::from_vec(vec![0xAB; 50]))];
        let input = MuxInput { video: None, audio: Some(AudioTrackInput { settings: &settings, samples: &samples }), data: None, captions: None };
        let out = mux(&input).unwrap();
        let mut found_adts = false;
        for chunk in out.chunks_exact(pes::TS_PACKET_SIZE) {
            let p = pes::parse_packet(chunk).unwrap();
            if p.pid == pes::AUDIO_PID && p.payload_unit_start {
                let h = pes::parse_pes_header(p.payload).unwrap();
                let es = &p.payload[h.header_len..];
                assert_eq!(es[0], 0xFF);
                assert_eq!(es[1] & 0xF0, 0xF0);
                found_adts = true;
            }
        }
        assert!(found_adts);
    }

    #[test]
    fn data_track_samples_pass_through_pes() {
        let data_settings = DataSettings { codec: DataCodec::TimedId3, timescale: 90_000 };
        let samples = vec![Sample::from_data(0, 0, true, SampleKind::Data, Data::from_vec(b"ID3payload".to_vec()))];
        let input = MuxInput { video: None, audio: None, data: Some(DataTrackInput { settings: &data_settings, samples: &samples }), captions: None };
        let out = mux(&input).unwrap();
        let first = pes::parse_packet(&out[..pes::TS_PACKET_SIZE]).unwrap();
        assert_eq!(first.pid, pes::PAT_PID);
    }

    #[test]
    fn rejects_empty_input() {
        let input = MuxInput { video: None, audio: None, data: None, captions: None };
        assert!(mux(&input).is_err());
    }
}
