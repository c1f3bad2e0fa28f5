// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The MPEG-2 Transport Stream demuxer: walks PAT/PMT to find the video/audio/data PIDs,
//! reassembles each PID's TS packets into PES units, then reassembles each PES stream into
//! access units (AUD-delimited H.264 frames, ADTS-framed AAC, and raw timed-ID3 passthrough).

use crate::data::Data;
use crate::limits;
use crate::media::Media;
use crate::mp2ts::pes::{self, TS_PACKET_SIZE};
use crate::nal::{self, sei, sps, NalType};
use crate::reader::SharedReader;
use crate::sample::{Sample, SampleKind};
use crate::settings::{
    AudioKind, AudioSettings, CaptionCodec, CaptionKind, CaptionSettings, DataCodec, DataKind, DataSettings,
    Orientation, SpsPps, VideoCodec, VideoKind, VideoSettings,
};
use base::{bail, Error};
use std::collections::HashMap;
use tracing::debug;

pub struct Demuxed {
    pub video: Option<Media<VideoKind, Sample>>,
    pub audio: Option<Media<AudioKind, Sample>>,
    pub captions: Option<Media<CaptionKind, Sample>>,
    pub data: Option<Media<DataKind, Sample>>,
}

pub(crate) struct PmtMapping {
    pub(crate) video_pid: Option<u16>,
    pub(crate) audio_pid: Option<u16>,
    pub(crate) data_pid: Option<u16>,
}

/// A single collected PES unit: every byte a PUSI-bounded run of TS packets for one PID
/// contributed, plus that unit's own PES header (parsed once the run closes).
struct PesUnit {
    bytes: Vec<u8>,
}

/// Demuxes an MPEG-2 Transport Stream read in full from `reader`.
pub fn demux(reader: SharedReader) -> Result<Demuxed, Error> {
    let len = reader.len();
    if len > u32::MAX as u64 {
        bail!(Unsupported, msg("MP2TS input of {} bytes exceeds this engine's 32-bit offset support", len));
    }
    let buf = reader.read(0, len as u32)?;
    let data = buf.as_slice();
    if data.len() % TS_PACKET_SIZE != 0 {
        debug!(trailing = data.len() % TS_PACKET_SIZE, "MP2TS input length isn't a multiple of the packet size");
    }

    let mut units: HashMap<u16, Vec<PesUnit>> = HashMap::new();
    let mut pat_pmt_pid: Option<u16> = None;
    for chunk in data.chunks_exact(TS_PACKET_SIZE) {
        let p = pes::parse_packet(chunk)?;
        if p.pid == pes::PAT_PID {
            if p.payload_unit_start && !p.payload.is_empty() {
                let pointer = p.payload[0] as usize;
                if pointer + 1 <= p.payload.len() {
                    pat_pmt_pid = parse_pat(&p.payload[1 + pointer..])?;
                }
            }
            continue;
        }
        let list = units.entry(p.pid).or_default();
        if p.payload_unit_start || list.is_empty() {
            list.push(PesUnit { bytes: Vec::new() });
        }
        list.last_mut().unwrap().bytes.extend_from_slice(p.payload);
    }

    let pmt_pid = pat_pmt_pid.ok_or_else(|| base::err!(Invalid, msg("no PMT pid found in PAT")))?;
    let pmt_units = units
        .get(&pmt_pid)
        .ok_or_else(|| base::err!(Invalid, msg("no TS packets for PMT pid {}", pmt_pid)))?;
    let first_pmt = pmt_units.first().ok_or_else(|| base::err!(Invalid, msg("empty PMT unit")))?;
    let pointer = *first_pmt.bytes.first().unwrap_or(&0) as usize;
    let mapping = parse_pmt(&first_pmt.bytes[1 + pointer..])?;

    let video = mapping.video_pid.and_then(|pid| units.remove(&pid)).map(demux_video).transpose()?;
    let audio = mapping.audio_pid.and_then(|pid| units.remove(&pid)).map(demux_audio).transpose()?;
    let data_track = mapping.data_pid.and_then(|pid| units.remove(&pid)).map(demux_data).transpose()?;

    let captions = video.as_ref().map(|(_, _, captions)| captions.clone());
    let video = video.map(|(settings, samples, _)| Media::from_vec(settings, samples));
    let audio = audio.map(|(settings, samples)| Media::from_vec(settings, samples));
    let data_track = data_track.map(|samples| {
        Media::from_vec(DataSettings { codec: DataCodec::TimedId3, timescale: limits::MP2TS_TIMESCALE }, samples)
    });
    let captions = captions.map(|samples| {
        Media::from_vec(CaptionSettings { codec: CaptionCodec::Unknown, timescale: limits::MP2TS_TIMESCALE }, samples)
    });

    Ok(Demuxed { video, audio, captions, data: data_track })
}

pub(crate) fn parse_pat(section: &[u8]) -> Result<Option<u16>, Error> {
    if section.len() < 8 {
        bail!(Invalid, msg("PAT section too short"));
    }
    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let end = 3 + section_length;
    if end > section.len() || end < 8 {
        bail!(Invalid, msg("PAT section_length {} out of range", section_length));
    }
    let mut i = 8; // past table header + transport_stream_id/version/section numbers
    while i + 4 <= end - 4 {
        // -4 for the trailing CRC32
        let program_number = ((section[i] as u16) << 8) | section[i + 1] as u16;
        let pid = (((section[i + 2] & 0x1F) as u16) << 8) | section[i + 3] as u16;
        i += 4;
        if program_number != 0 {
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

pub(crate) fn parse_pmt(section: &[u8]) -> Result<PmtMapping, Error> {
    if section.len() < 12 {
        bail!(Invalid, msg("PMT section too short"));
    }
    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let end = 3 + section_length;
    if end > section.len() || end < 12 {
        bail!(Invalid, msg("PMT section_length {} out of range", section_length));
    }
    let program_info_length = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;
    let mut i = 12 + program_info_length;
    let mut mapping = PmtMapping { video_pid: None, audio_pid: None, data_pid: None };
    while i + 5 <= end - 4 {
        let stream_type = section[i];
        let pid = (((section[i + 1] & 0x1F) as u16) << 8) | section[i + 2] as u16;
        let es_info_length = (((section[i + 3] & 0x0F) as usize) << 8) | section[i + 4] as usize;
        match stream_type {
            pes::STREAM_TYPE_H264 => mapping.video_pid = Some(pid),
            pes::STREAM_TYPE_AAC_ADTS => mapping.audio_pid = Some(pid),
            pes::STREAM_TYPE_TIMED_ID3 => mapping.data_pid = Some(pid),
            _ => {}
        }
        i += 5 + es_info_length;
    }
    Ok(mapping)
}

struct VideoFrame {
    pts: i64,
    dts: i64,
    nals: Vec<u8>, // Annex-B, start codes included
}

/// Reassembles a video PID's PES units into AUD-delimited access units, per §4.5's
/// three-case rule: a PES that starts with an AUD (offset 0) closes out the previous
/// frame and opens a new one; a PES with no AUD at all is pure continuation; a PES whose
/// AUD lands mid-stream splits into both (its head finishes the old frame, its tail opens
/// the new one). Generalizes past exactly one AUD per PES by applying the same rule at
/// every AUD location in sequence.
fn demux_video(units: Vec<PesUnit>) -> Result<(VideoSettings, Vec<Sample>, Media<CaptionKind, Sample>), Error> {
    let mut frames: Vec<VideoFrame> = Vec::new();
    let mut cache: Option<(i64, i64, Vec<u8>)> = None;

    for unit in &units {
        let h = pes::parse_pes_header(&unit.bytes)?;
        let pts = h.pts.ok_or_else(|| base::err!(Invalid, msg("video PES missing PTS")))?;
        let dts = h.dts.unwrap_or(pts);
        let es = &unit.bytes[h.header_len..];

        let aud_starts: Vec<usize> = nal::annexb::locate_all(es)?
            .into_iter()
            .filter(|l| l.nal_type == NalType::Aud)
            .map(|l| l.offset - l.prefix_size)
            .collect();

        if aud_starts.is_empty() {
            match cache.as_mut() {
                Some((cpts, cdts, acc)) => {
                    if h.pts.is_some() && *cpts != pts {
                        bail!(Invalid, msg("PES timestamp {} doesn't match accumulating frame's {}", pts, cpts));
                    }
                    if h.dts.is_some() && *cdts != dts {
                        bail!(Invalid, msg("PES DTS {} doesn't match accumulating frame's {}", dts, cdts));
                    }
                    acc.extend_from_slice(es);
                }
                None => cache = Some((pts, dts, es.to_vec())),
            }
            continue;
        }

        let mut prev_end = 0usize;
        for &aud_start in &aud_starts {
            if aud_start > prev_end {
                if let Some((_, _, acc)) = cache.as_mut() {
                    acc.extend_from_slice(&es[prev_end..aud_start]);
                }
            }
            if let Some((fpts, fdts, facc)) = cache.take() {
                frames.push(VideoFrame { pts: fpts, dts: fdts, nals: facc });
            }
            cache = Some((pts, dts, Vec::new()));
            prev_end = aud_start;
        }
        if let Some((_, _, acc)) = cache.as_mut() {
            acc.extend_from_slice(&es[prev_end..]);
        }
    }
    if let Some((fpts, fdts, facc)) = cache.take() {
        frames.push(VideoFrame { pts: fpts, dts: fdts, nals: facc });
    }

    let mut sps_pps: Option<SpsPps> = None;
    let mut settings: Option<VideoSettings> = None;
    let mut samples = Vec::with_capacity(frames.len());
    let mut caption_samples = Vec::new();

    for frame in &frames {
        let locs = nal::annexb::locate_all(&frame.nals)?;
        let mut frame_sps: Option<(&[u8], (u16, u16))> = None;
        let mut frame_pps: Option<&[u8]> = None;
        let mut captions: Vec<&[u8]> = Vec::new();
        let mut keyframe_start: Option<usize> = None;

        for l in &locs {
            let body = &frame.nals[l.offset..l.offset + l.size];
            match l.nal_type {
                NalType::Sps => frame_sps = Some((body, sps::parse_dimensions(body)?)),
                NalType::Pps => frame_pps = Some(body),
                NalType::Sei => {
                    for &(off, sz) in &sei::caption_payloads(&body[1..])? {
                        captions.push(&body[1 + off..1 + off + sz]);
                    }
                }
                NalType::IdrSlice | NalType::NonIdrSlice => {
                    if keyframe_start.is_none() {
                        keyframe_start = Some(l.offset - l.prefix_size);
                    }
                }
                _ => {}
            }
        }

        if let (Some((sps_bytes, dims)), Some(pps_bytes)) = (frame_sps, frame_pps) {
            sps_pps = Some(SpsPps {
                sps: Data::from_vec(sps_bytes.to_vec()),
                pps: Data::from_vec(pps_bytes.to_vec()),
                nalu_length_size: 4,
            });
            if settings.is_none() {
                limits::check_dimension(dims.0 as u32)?;
                limits::check_dimension(dims.1 as u32)?;
                settings = Some(VideoSettings::square_pixel(
                    VideoCodec::H264,
                    dims.0,
                    dims.1,
                    limits::MP2TS_TIMESCALE,
                    Orientation::Unknown,
                    sps_pps.clone().unwrap(),
                ));
            }
        }

        let is_keyframe = locs.iter().any(|l| l.nal_type == NalType::IdrSlice);
        let start = keyframe_start.unwrap_or(0);
        let mut payload = Vec::new();
        if is_keyframe {
            if let Some(sp) = &sps_pps {
                let extradata = sp.as_extradata(crate::settings::ExtraDataType::LengthPrefixed)?;
                payload.extend_from_slice(extradata.as_slice());
            }
        }
        let annexb_tail = &frame.nals[start..];
        payload.extend_from_slice(&nal::avcc::annexb_to_avcc(annexb_tail, 4)?);
        limits::check_sample_size(payload.len())?;

        let payload_data = Data::from_vec(payload);
        samples.push(Sample::from_data(frame.pts, frame.dts, is_keyframe, SampleKind::Video, payload_data));

        if !captions.is_empty() {
            let nal = sei::rebuild_caption_nal(&captions, 4);
            caption_samples.push(Sample::from_data(frame.pts, frame.dts, is_keyframe, SampleKind::Caption, Data::from_vec(nal)));
        }
    }

    let settings = settings.ok_or_else(|| base::err!(Invalid, msg("no SPS/PPS found in video stream")))?;
    limits::check_sample_count(samples.len() as u32)?;
    let captions = Media::from_vec(
        CaptionSettings { codec: CaptionCodec::Unknown, timescale: limits::MP2TS_TIMESCALE },
        caption_samples,
    );
    Ok((settings, samples, captions))
}

fn demux_audio(units: Vec<PesUnit>) -> Result<(AudioSettings, Vec<Sample>), Error> {
    let mut samples = Vec::new();
    let mut settings: Option<AudioSettings> = None;
    let mut cache: Vec<u8> = Vec::new();

    for unit in &units {
        let h = pes::parse_pes_header(&unit.bytes)?;
        let pes_pts = h.pts.ok_or_else(|| base::err!(Invalid, msg("audio PES missing PTS")))?;
        let pes_dts = h.dts.unwrap_or(pes_pts);
        let es: Vec<u8> = if cache.is_empty() {
            unit.bytes[h.header_len..].to_vec()
        } else {
            let mut combined = std::mem::take(&mut cache);
            combined.extend_from_slice(&unit.bytes[h.header_len..]);
            combined
        };

        let mut offset = 0usize;
        let mut sub_frame = 0i64;
        loop {
            if offset >= es.len() {
                break;
            }
            match crate::nal::adts::parse(&es[offset..]) {
                Ok(header) => {
                    if settings.is_none() {
                        settings = Some(AudioSettings {
                            codec: header.codec,
                            timescale: limits::MP2TS_TIMESCALE,
                            sample_rate: header.sample_rate,
                            channels: if header.channel_configuration == 1 { 1 } else { 2 },
                            bitrate: 0,
                        });
                    }
                    let s = settings.as_ref().unwrap();
                    let frame_start = offset + header.header_len as usize;
                    let frame_end = offset + header.frame_length as usize;
                    let payload = Data::from_vec(es[frame_start..frame_end].to_vec());
                    let delta = (sub_frame * limits::AUDIO_FRAME_SIZE as i64 * limits::MP2TS_TIMESCALE as i64)
                        / s.sample_rate as i64;
                    samples.push(Sample::from_data(pes_pts + delta, pes_dts + delta, true, SampleKind::Audio, payload));
                    offset = frame_end;
                    sub_frame += 1;
                }
                Err(e) if e.kind() == base::ErrorKind::Invalid => {
                    cache = es[offset..].to_vec();
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }
    if !cache.is_empty() {
        bail!(Unsupported, msg("trailing {} bytes of audio never completed an ADTS frame", cache.len()));
    }
    let settings = settings.ok_or_else(|| base::err!(Invalid, msg("no ADTS frames found in audio stream")))?;
    limits::check_sample_count(samples.len() as u32)?;
    Ok((settings, samples))
}

fn demux_data(units: Vec<PesUnit>) -> Result<Vec<Sample>, Error> {
    let mut samples = Vec::with_capacity(units.len());
    for unit in &units {
        let h = pes::parse_pes_header(&unit.bytes)?;
        let pts = h.pts.unwrap_or(0);
        let dts = h.dts.unwrap_or(pts);
        let payload = Data::from_vec(unit.bytes[h.header_len..].to_vec());
        samples.push(Sample::from_data(pts, dts, true, SampleKind::Data, payload));
    }
    Ok(samples)
}
