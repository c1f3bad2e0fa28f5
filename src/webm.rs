// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! WebM (Matroska subset) demuxing and muxing: an EBML element walk down to `Segment` /
//! `Tracks` / `Cluster`, and a writer for the same shape back out. Video is restricted to
//! VP8 and audio to Vorbis; lacing is not supported (every block carries exactly one frame).

use crate::data::Data;
use crate::limits;
use crate::media::Media;
use crate::reader::{SharedReader, WeakReader};
use crate::sample::{Sample, SampleKind};
use crate::settings::{AudioCodec, AudioKind, AudioSettings, Orientation, SpsPps, VideoCodec, VideoKind, VideoSettings};
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tracing::debug;

mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
}

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;

/// This track's video timecodes are rescaled to a fixed 100 kHz-ish unit rather than the
/// file's own `TimestampScale`, so downstream pts/dts arithmetic never has to special-case a
/// per-file timescale for VP8.
const VIDEO_TIMESCALE: u32 = 100_000;

/// Default nanoseconds-per-tick when a `Segment\Info` omits `TimestampScale`.
const DEFAULT_TIMESTAMP_SCALE_NS: u64 = 1_000_000;

/// An unknown-size marker: all-ones vint payload, used by streamed `Segment`/`Cluster`
/// elements that don't know their size up front.
fn is_unknown_size(value: u64, width: usize) -> bool {
    value == (1u64 << (7 * width)) - 1
}

/// Reads one EBML element ID at `data[pos..]`, keeping its marker bit (IDs are compared as
/// the raw tag bytes, unlike sized values). Returns `(id, bytes consumed)`.
fn read_id(data: &[u8], pos: usize) -> Result<(u32, usize), Error> {
    let first = *data.get(pos).ok_or_else(|| base::err!(Invalid, msg("EBML ID truncated at {}", pos)))?;
    let width = vint_width(first)?;
    if pos + width > data.len() {
        bail!(Invalid, msg("EBML ID of width {} truncated at {}", width, pos));
    }
    let mut id: u32 = 0;
    for &b in &data[pos..pos + width] {
        id = (id << 8) | b as u32;
    }
    Ok((id, width))
}

/// Reads one EBML size/value vint at `data[pos..]`, clearing the marker bit. Returns
/// `(value, bytes consumed)`.
fn read_vint(data: &[u8], pos: usize) -> Result<(u64, usize), Error> {
    let first = *data.get(pos).ok_or_else(|| base::err!(Invalid, msg("EBML vint truncated at {}", pos)))?;
    let width = vint_width(first)?;
    if pos + width > data.len() {
        bail!(Invalid, msg("EBML vint of width {} truncated at {}", width, pos));
    }
    let clear_mask = !(0x80u8 >> (width - 1));
    let mut value: u64 = (first & clear_mask) as u64;
    for &b in &data[pos + 1..pos + width] {
        value = (value << 8) | b as u64;
    }
    Ok((value, width))
}

fn vint_width(first: u8) -> Result<usize, Error> {
    if first == 0 {
        bail!(Invalid, msg("EBML vint has a zero leading byte (width > 8)"));
    }
    Ok((first.leading_zeros() as usize) + 1)
}

/// One child element's header: its id, the byte range of its payload within `data`, and the
/// offset just past it (the next sibling's start).
struct Header {
    id: u32,
    start: usize,
    end: usize,
    next: usize,
}

/// Reads one element header at `data[pos..end_of_parent)`. `end_of_parent` bounds an
/// unknown-size element (rare here; only top-level `Segment` realistically uses it).
fn read_header(data: &[u8], pos: usize, end_of_parent: usize) -> Result<Header, Error> {
    let (id, id_len) = read_id(data, pos)?;
    let size_pos = pos + id_len;
    let (size, size_len) = read_vint(data, size_pos)?;
    let start = size_pos + size_len;
    let end = if is_unknown_size(size, size_len) { end_of_parent } else { start + size as usize };
    if end > data.len() || end > end_of_parent {
        bail!(Invalid, msg("EBML element {:#x} overruns its parent", id));
    }
    Ok(Header { id, start, end, next: end })
}

/// Walks the immediate children of `[start, end)`, calling `f` with each header.
fn walk_children(data: &[u8], start: usize, end: usize, mut f: impl FnMut(&Header) -> Result<(), Error>) -> Result<(), Error> {
    let mut pos = start;
    while pos < end {
        let h = read_header(data, pos, end)?;
        f(&h)?;
        pos = h.next;
    }
    Ok(())
}

fn find_child(data: &[u8], start: usize, end: usize, want: u32) -> Result<Option<Header>, Error> {
    let mut found = None;
    walk_children(data, start, end, |h| {
        if h.id == want && found.is_none() {
            found = Some(Header { id: h.id, start: h.start, end: h.end, next: h.next });
        }
        Ok(())
    })?;
    Ok(found)
}

fn read_unsigned(data: &[u8], h: &Header) -> u64 {
    let mut v: u64 = 0;
    for &b in &data[h.start..h.end] {
        v = (v << 8) | b as u64;
    }
    v
}

fn read_string(data: &[u8], h: &Header) -> String {
    String::from_utf8_lossy(&data[h.start..h.end]).into_owned()
}

/// `SamplingFrequency` is stored as an IEEE-754 float (4 or 8 bytes).
fn read_float(data: &[u8], h: &Header) -> Result<f64, Error> {
    match h.end - h.start {
        4 => Ok(BigEndian::read_f32(&data[h.start..h.end]) as f64),
        8 => Ok(BigEndian::read_f64(&data[h.start..h.end])),
        n => bail!(Invalid, msg("unexpected float element width {}", n)),
    }
}

fn round_divide(value: u128, num: u64, den: u64) -> u64 {
    ((value * num as u128 + (den as u128) / 2) / (den as u128)) as u64
}

pub struct Demuxed {
    pub video: Option<Media<VideoKind, Sample>>,
    pub audio: Option<Media<AudioKind, Sample>>,
}

struct TrackMeta {
    number: u64,
    track_type: u64,
    codec_id: String,
    width: Option<u16>,
    height: Option<u16>,
    sample_rate: Option<u32>,
    channels: Option<u8>,
}

/// Demuxes a WebM file from `reader`. Track payload thunks hold only a
/// [`crate::reader::WeakReader`], matching the MP4 demuxer's lifetime contract.
pub fn demux(reader: SharedReader) -> Result<Demuxed, Error> {
    let len = reader.len();
    if len > u32::MAX as u64 {
        bail!(Unsupported, msg("container of {} bytes exceeds this engine's 32-bit offset support", len));
    }
    let whole = reader.read(0, len as u32)?;
    let buf = whole.as_slice();
    let weak = reader.downgrade();

    let segment = find_child(buf, 0, buf.len(), ids::SEGMENT)?
        .ok_or_else(|| base::err!(Invalid, msg("no Segment element found")))?;

    let mut timestamp_scale_ns = DEFAULT_TIMESTAMP_SCALE_NS;
    if let Some(info) = find_child(buf, segment.start, segment.end, ids::INFO)? {
        if let Some(ts) = find_child(buf, info.start, info.end, ids::TIMESTAMP_SCALE)? {
            timestamp_scale_ns = read_unsigned(buf, &ts);
        }
    }

    let tracks_elem = find_child(buf, segment.start, segment.end, ids::TRACKS)?
        .ok_or_else(|| base::err!(Invalid, msg("Segment has no Tracks element")))?;
    let mut tracks = Vec::new();
    walk_children(buf, tracks_elem.start, tracks_elem.end, |h| {
        if h.id == ids::TRACK_ENTRY {
            tracks.push(parse_track_entry(buf, h)?);
        }
        Ok(())
    })?;

    let video_track = tracks.iter().find(|t| t.track_type == TRACK_TYPE_VIDEO);
    let audio_track = tracks.iter().find(|t| t.track_type == TRACK_TYPE_AUDIO);

    let video_settings = match video_track {
        Some(t) => Some(video_settings_from_track(t)?),
        None => None,
    };
    let audio_settings = match audio_track {
        Some(t) => Some(audio_settings_for_track(t)?),
        None => None,
    };

    let mut video_samples: Vec<Sample> = Vec::new();
    let mut audio_samples: Vec<Sample> = Vec::new();
    let mut video_bytes: u64 = 0;
    let mut audio_bytes: u64 = 0;

    walk_children(buf, segment.start, segment.end, |h| {
        if h.id != ids::CLUSTER {
            return Ok(());
        }
        let cluster_ts = find_child(buf, h.start, h.end, ids::TIMESTAMP)?
            .map(|ts| read_unsigned(buf, &ts))
            .unwrap_or(0);
        walk_children(buf, h.start, h.end, |child| {
            match child.id {
                ids::SIMPLE_BLOCK => {
                    if let Some(block) = parse_block(buf, child.start, child.end)? {
                        push_block_sample(
                            &block,
                            cluster_ts,
                            timestamp_scale_ns,
                            video_track,
                            audio_track,
                            &weak,
                            &mut video_samples,
                            &mut audio_samples,
                            &mut video_bytes,
                            &mut audio_bytes,
                        )?;
                    }
                }
                ids::BLOCK_GROUP => {
                    let mut keyframe = true;
                    let mut block_range = None;
                    walk_children(buf, child.start, child.end, |bg| {
                        match bg.id {
                            ids::BLOCK => block_range = Some((bg.start, bg.end)),
                            ids::REFERENCE_BLOCK => keyframe = false,
                            _ => {}
                        }
                        Ok(())
                    })?;
                    if let Some((s, e)) = block_range {
                        if let Some(mut block) = parse_block(buf, s, e)? {
                            block.keyframe = keyframe;
                            push_block_sample(
                                &block,
                                cluster_ts,
                                timestamp_scale_ns,
                                video_track,
                                audio_track,
                                &weak,
                                &mut video_samples,
                                &mut audio_samples,
                                &mut video_bytes,
                                &mut audio_bytes,
                            )?;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    })?;

    let video = video_settings.map(|s| Media::from_vec(s, video_samples));
    let audio = audio_settings.map(|s| {
        // total bits / duration, both expressed in the track's own timescale (sample rate).
        let duration_ticks = audio_total_duration(&audio_samples);
        let bitrate = if duration_ticks > 0 {
            round_divide(audio_bytes as u128 * 8, s.timescale as u64, duration_ticks) as u32
        } else {
            0
        };
        Media::from_vec(AudioSettings { bitrate, ..s }, audio_samples)
    });

    debug!(video_bytes, audio_bytes, "finished WebM demux");
    Ok(Demuxed { video, audio })
}

fn parse_track_entry(buf: &[u8], h: &Header) -> Result<TrackMeta, Error> {
    let mut m = TrackMeta {
        number: 0,
        track_type: 0,
        codec_id: String::new(),
        width: None,
        height: None,
        sample_rate: None,
        channels: None,
    };
    walk_children(buf, h.start, h.end, |c| {
        match c.id {
            ids::TRACK_NUMBER => m.number = read_unsigned(buf, c),
            ids::TRACK_TYPE => m.track_type = read_unsigned(buf, c),
            ids::CODEC_ID => m.codec_id = read_string(buf, c),
            ids::VIDEO => {
                walk_children(buf, c.start, c.end, |v| {
                    match v.id {
                        ids::PIXEL_WIDTH => m.width = Some(read_unsigned(buf, v) as u16),
                        ids::PIXEL_HEIGHT => m.height = Some(read_unsigned(buf, v) as u16),
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            ids::AUDIO => {
                walk_children(buf, c.start, c.end, |a| {
                    match a.id {
                        ids::SAMPLING_FREQUENCY => m.sample_rate = Some(read_float(buf, a)? as u32),
                        ids::CHANNELS => m.channels = Some(read_unsigned(buf, a) as u8),
                        _ => {}
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(m)
}

fn video_settings_from_track(t: &TrackMeta) -> Result<VideoSettings, Error> {
    if t.codec_id != "V_VP8" {
        bail!(Unsupported, msg("WebM video codec {:?} is not supported; only V_VP8 is", t.codec_id));
    }
    let width = t.width.ok_or_else(|| base::err!(Invalid, msg("video TrackEntry has no PixelWidth")))?;
    let height = t.height.ok_or_else(|| base::err!(Invalid, msg("video TrackEntry has no PixelHeight")))?;
    limits::check_dimension(width as u32)?;
    limits::check_dimension(height as u32)?;
    Ok(VideoSettings::new(
        VideoCodec::Vp8,
        width,
        height,
        width,
        height,
        VIDEO_TIMESCALE,
        Orientation::Landscape,
        SpsPps::none(),
    ))
}

fn audio_settings_for_track(t: &TrackMeta) -> Result<AudioSettings, Error> {
    if t.codec_id != "A_VORBIS" {
        bail!(Unsupported, msg("WebM audio codec {:?} is not supported; only A_VORBIS is", t.codec_id));
    }
    let sample_rate = t.sample_rate.ok_or_else(|| base::err!(Invalid, msg("audio TrackEntry has no SamplingFrequency")))?;
    let channels = t.channels.ok_or_else(|| base::err!(Invalid, msg("audio TrackEntry has no Channels")))?;
    if channels == 0 || channels > 2 {
        bail!(Unsupported, msg("WebM audio with {} channels is not supported", channels));
    }
    Ok(AudioSettings { codec: AudioCodec::Vorbis, timescale: sample_rate, sample_rate, channels, bitrate: 0 })
}

struct ParsedBlock {
    track_number: u64,
    relative_timecode: i16,
    keyframe: bool,
    payload_start: usize,
    payload_end: usize,
}

/// Parses a `SimpleBlock`/`Block` body: `vint track number, i16 timecode, u8 flags, frame`.
/// Returns `None` (rather than failing) for lacing, since the original this engine follows
/// never supported more than one frame per block either.
fn parse_block(data: &[u8], start: usize, end: usize) -> Result<Option<ParsedBlock>, Error> {
    let (track_number, tn_len) = read_vint(data, start)?;
    let ts_pos = start + tn_len;
    if ts_pos + 3 > end {
        bail!(Invalid, msg("block truncated before timecode/flags"));
    }
    let relative_timecode = BigEndian::read_i16(&data[ts_pos..ts_pos + 2]);
    let flags = data[ts_pos + 2];
    let lacing = (flags >> 1) & 0b11;
    if lacing != 0 {
        debug!(lacing, "skipping laced block; only single-frame blocks are supported");
        return Ok(None);
    }
    let keyframe = flags & 0x80 != 0;
    let payload_start = ts_pos + 3;
    Ok(Some(ParsedBlock { track_number, relative_timecode, keyframe, payload_start, payload_end: end }))
}

#[allow(clippy::too_many_arguments)]
fn push_block_sample(
    block: &ParsedBlock,
    cluster_ts: u64,
    timestamp_scale_ns: u64,
    video_track: Option<&TrackMeta>,
    audio_track: Option<&TrackMeta>,
    weak: &WeakReader,
    video_samples: &mut Vec<Sample>,
    audio_samples: &mut Vec<Sample>,
    video_bytes: &mut u64,
    audio_bytes: &mut u64,
) -> Result<(), Error> {
    let abs_ticks = (cluster_ts as i64) + (block.relative_timecode as i64);
    if abs_ticks < 0 {
        bail!(Invalid, msg("block timecode {} precedes its cluster", abs_ticks));
    }
    let time_ns = (abs_ticks as u128) * (timestamp_scale_ns as u128);

    let size = (block.payload_end - block.payload_start) as u32;
    limits::check_sample_size(size as usize)?;
    let offset = block.payload_start as u64;

    if Some(block.track_number) == video_track.map(|t| t.number) {
        let pts = round_divide(time_ns, VIDEO_TIMESCALE as u64, 1_000_000_000) as i64;
        let weak = weak.clone();
        let payload = move || -> Result<Data<u8>, Error> {
            let reader = weak.upgrade()?;
            reader.read(offset, size)
        };
        video_samples.push(Sample::new(pts, pts, block.keyframe, SampleKind::Video, payload).with_byte_range(offset, size));
        *video_bytes += size as u64;
    } else if Some(block.track_number) == audio_track.map(|t| t.number) {
        let timescale = audio_track.and_then(|t| t.sample_rate).unwrap_or(1) as u64;
        let pts = round_divide(time_ns, timescale, 1_000_000_000) as i64;
        let weak = weak.clone();
        let payload = move || -> Result<Data<u8>, Error> {
            let reader = weak.upgrade()?;
            reader.read(offset, size)
        };
        audio_samples.push(Sample::new(pts, pts, true, SampleKind::Audio, payload).with_byte_range(offset, size));
        *audio_bytes += size as u64;
    }
    Ok(())
}

fn audio_total_duration(samples: &[Sample]) -> u64 {
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if last.pts > first.pts => (last.pts - first.pts) as u64,
        _ => 0,
    }
}

// --- muxing -----------------------------------------------------------------------------

/// One track's settings and samples to mux into a WebM `Segment`.
pub enum MuxInput<'a> {
    Video(&'a Media<VideoKind, Sample>),
    Audio(&'a Media<AudioKind, Sample>),
}

fn write_vint_id(out: &mut Vec<u8>, id: u32) {
    if id <= 0xFF {
        out.push(id as u8);
    } else if id <= 0xFFFF {
        out.push((id >> 8) as u8);
        out.push(id as u8);
    } else if id <= 0xFF_FFFF {
        out.push((id >> 16) as u8);
        out.push((id >> 8) as u8);
        out.push(id as u8);
    } else {
        out.push((id >> 24) as u8);
        out.push((id >> 16) as u8);
        out.push((id >> 8) as u8);
        out.push(id as u8);
    }
}

/// Writes a definite-size vint using the smallest width that can hold `value`, per EBML's
/// "use the shortest encoding" convention.
fn write_vint_size(out: &mut Vec<u8>, value: u64) {
    let mut width = 1u32;
    while value >= (1u64 << (7 * width)) - 1 {
        width += 1;
    }
    let marker = 0x80u8 >> (width - 1);
    let mut bytes = [0u8; 8];
    BigEndian::write_u64(&mut bytes, value);
    let start = 8 - width as usize;
    out.push(bytes[start] | marker);
    out.extend_from_slice(&bytes[start + 1..]);
}

/// Writes one element with a pre-built body, prefixing id + size.
fn write_element(out: &mut Vec<u8>, id: u32, body: &[u8]) {
    write_vint_id(out, id);
    write_vint_size(out, body.len() as u64);
    out.extend_from_slice(body);
}

fn write_unsigned(out: &mut Vec<u8>, id: u32, mut value: u64) {
    let mut bytes = Vec::new();
    if value == 0 {
        bytes.push(0);
    }
    while value > 0 {
        bytes.push(value as u8);
        value >>= 8;
    }
    bytes.reverse();
    write_element(out, id, &bytes);
}

fn write_float(out: &mut Vec<u8>, id: u32, value: f64) {
    let mut body = Vec::with_capacity(8);
    body.write_f64::<BigEndian>(value).expect("Vec writes are infallible");
    write_element(out, id, &body);
}

fn write_string(out: &mut Vec<u8>, id: u32, value: &str) {
    write_element(out, id, value.as_bytes());
}

/// Muxes `video` and `audio` into a single-Cluster WebM `Segment` (EBML header included).
/// Every sample becomes one unlaced `SimpleBlock`; there is no splitting into multiple
/// clusters, since this engine only ever produces output small enough for one.
pub fn mux(video: Option<&Media<VideoKind, Sample>>, audio: Option<&Media<AudioKind, Sample>>) -> Result<Vec<u8>, Error> {
    if video.is_none() && audio.is_none() {
        bail!(InvalidArguments, msg("mux requires at least one of video or audio"));
    }

    let mut out = Vec::new();
    write_ebml_header(&mut out);

    let mut segment_body = Vec::new();
    write_info(&mut segment_body);
    write_tracks(&mut segment_body, video, audio)?;
    write_clusters(&mut segment_body, video, audio)?;

    write_element(&mut out, ids::SEGMENT, &segment_body);
    Ok(out)
}

fn write_ebml_header(out: &mut Vec<u8>) {
    let mut body = Vec::new();
    write_unsigned(&mut body, 0x4286, 1); // EBMLVersion
    write_unsigned(&mut body, 0x42F7, 1); // EBMLReadVersion
    write_unsigned(&mut body, 0x42F2, 4); // EBMLMaxIDLength
    write_unsigned(&mut body, 0x42F3, 8); // EBMLMaxSizeLength
    write_string(&mut body, 0x4282, "webm"); // DocType
    write_unsigned(&mut body, 0x4287, 2); // DocTypeVersion
    write_unsigned(&mut body, 0x4285, 2); // DocTypeReadVersion
    write_element(out, ids::EBML, &body);
}

fn write_info(out: &mut Vec<u8>) {
    let mut body = Vec::new();
    write_unsigned(&mut body, ids::TIMESTAMP_SCALE, DEFAULT_TIMESTAMP_SCALE_NS);
    write_element(out, ids::INFO, &body);
}

fn write_tracks(out: &mut Vec<u8>, video: Option<&Media<VideoKind, Sample>>, audio: Option<&Media<AudioKind, Sample>>) -> Result<(), Error> {
    let mut body = Vec::new();
    if let Some(v) = video {
        let s = v.settings();
        if s.codec != VideoCodec::Vp8 {
            bail!(Unsupported, msg("WebM mux only supports VP8 video, got {:?}", s.codec));
        }
        let mut entry = Vec::new();
        write_unsigned(&mut entry, ids::TRACK_NUMBER, 1);
        write_unsigned(&mut entry, ids::TRACK_TYPE, TRACK_TYPE_VIDEO);
        write_string(&mut entry, ids::CODEC_ID, "V_VP8");
        let mut video_body = Vec::new();
        write_unsigned(&mut video_body, ids::PIXEL_WIDTH, s.coded_width as u64);
        write_unsigned(&mut video_body, ids::PIXEL_HEIGHT, s.coded_height as u64);
        write_element(&mut entry, ids::VIDEO, &video_body);
        write_element(&mut body, ids::TRACK_ENTRY, &entry);
    }
    if let Some(a) = audio {
        let s = a.settings();
        if s.codec != AudioCodec::Vorbis {
            bail!(Unsupported, msg("WebM mux only supports Vorbis audio, got {:?}", s.codec));
        }
        let mut entry = Vec::new();
        write_unsigned(&mut entry, ids::TRACK_NUMBER, 2);
        write_unsigned(&mut entry, ids::TRACK_TYPE, TRACK_TYPE_AUDIO);
        write_string(&mut entry, ids::CODEC_ID, "A_VORBIS");
        let mut audio_body = Vec::new();
        write_float(&mut audio_body, ids::SAMPLING_FREQUENCY, s.sample_rate as f64);
        write_unsigned(&mut audio_body, ids::CHANNELS, s.channels as u64);
        write_element(&mut entry, ids::AUDIO, &audio_body);
        write_element(&mut body, ids::TRACK_ENTRY, &entry);
    }
    write_element(out, ids::TRACKS, &body);
    Ok(())
}

struct OrderedSample {
    track_number: u64,
    pts_ns: i64,
    keyframe: bool,
    payload: Data<u8>,
}

fn write_clusters(out: &mut Vec<u8>, video: Option<&Media<VideoKind, Sample>>, audio: Option<&Media<AudioKind, Sample>>) -> Result<(), Error> {
    let mut ordered = Vec::new();
    if let Some(v) = video {
        let timescale = v.settings().timescale as u64;
        for s in v.iter() {
            let pts_ns = round_divide((s.pts.max(0)) as u128, 1_000_000_000, timescale) as i64;
            ordered.push(OrderedSample { track_number: 1, pts_ns, keyframe: s.keyframe, payload: s.payload()? });
        }
    }
    if let Some(a) = audio {
        let timescale = a.settings().timescale as u64;
        for s in a.iter() {
            let pts_ns = round_divide((s.pts.max(0)) as u128, 1_000_000_000, timescale) as i64;
            ordered.push(OrderedSample { track_number: 2, pts_ns, keyframe: s.keyframe, payload: s.payload()? });
        }
    }
    ordered.sort_by_key(|s| s.pts_ns);

    if ordered.is_empty() {
        return Ok(());
    }

    let mut body = Vec::new();
    write_unsigned(&mut body, ids::TIMESTAMP, 0);
    for s in &ordered {
        let rel_ticks = round_divide(s.pts_ns.max(0) as u128, 1, DEFAULT_TIMESTAMP_SCALE_NS);
        if rel_ticks > i16::MAX as u64 {
            bail!(Unsupported, msg("sample timecode {} exceeds a single cluster's i16 range", rel_ticks));
        }
        let mut block = Vec::new();
        write_vint_size(&mut block, s.track_number);
        block.write_i16::<BigEndian>(rel_ticks as i16).expect("Vec writes are infallible");
        let mut flags = 0u8;
        if s.keyframe {
            flags |= 0x80;
        }
        block.push(flags);
        block.extend_from_slice(s.payload.as_slice());
        write_element(&mut body, ids::SIMPLE_BLOCK, &block);
    }
    write_element(out, ids::CLUSTER, &body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vint_width_reads_leading_zero_run() {
        assert_eq!(vint_width(0x82).unwrap(), 1);
        assert_eq!(vint_width(0x40).unwrap(), 2);
        assert_eq!(vint_width(0x01).unwrap(), 8);
    }

    #[test]
    fn read_vint_clears_marker_bit() {
        // 0x82 = width-1 marker (0b1000_0010) -> value 2.
        assert_eq!(read_vint(&[0x82], 0).unwrap(), (2, 1));
        // 0x40 0x01 = width-2 marker (0b0100_0000 ...) -> value 1.
        assert_eq!(read_vint(&[0x40, 0x01], 0).unwrap(), (1, 2));
    }

    #[test]
    fn read_id_keeps_marker_bit() {
        // Segment id is 0x18538067, four bytes, marker bit retained.
        let bytes = [0x18, 0x53, 0x80, 0x67];
        assert_eq!(read_id(&bytes, 0).unwrap(), (ids::SEGMENT, 4));
    }

    #[test]
    fn round_divide_rounds_to_nearest() {
        assert_eq!(round_divide(10, 1, 3), 3);
        assert_eq!(round_divide(11, 1, 3), 4);
    }

    #[test]
    fn write_vint_size_round_trips_through_read_vint() {
        for &value in &[0u64, 1, 127, 128, 16383, 16384, 2_097_151] {
            let mut out = Vec::new();
            write_vint_size(&mut out, value);
            let (decoded, len) = read_vint(&out, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(len, out.len());
        }
    }

    #[test]
    fn non_vp8_video_codec_is_rejected_on_mux() {
        let settings = VideoSettings::new(
            VideoCodec::H264,
            16,
            16,
            16,
            16,
            VIDEO_TIMESCALE,
            Orientation::Landscape,
            SpsPps::none(),
        );
        let track: Media<VideoKind, Sample> = Media::from_vec(settings, Vec::new());
        assert!(mux(Some(&track), None).is_err());
    }

    #[test]
    fn parse_block_rejects_lacing() {
        // track number 1 (vint 0x81), timecode 0, flags with lacing bits set (Xiph = 01 << 1).
        let bytes = [0x81, 0x00, 0x00, 0b0000_0010, 0xAA];
        assert!(parse_block(&bytes, 0, bytes.len()).unwrap().is_none());
    }

    #[test]
    fn parse_block_reads_keyframe_flag() {
        let bytes = [0x81, 0x00, 0x05, 0x80, 0xAA, 0xBB];
        let block = parse_block(&bytes, 0, bytes.len()).unwrap().unwrap();
        assert_eq!(block.track_number, 1);
        assert_eq!(block.relative_timecode, 5);
        assert!(block.keyframe);
        assert_eq!(&bytes[block.payload_start..block.payload_end], &[0xAA, 0xBB]);
    }

    #[test]
    fn audio_settings_reject_non_vorbis() {
        let t = TrackMeta {
            number: 1,
            track_type: TRACK_TYPE_AUDIO,
            codec_id: "A_OPUS".to_string(),
            width: None,
            height: None,
            sample_rate: Some(48_000),
            channels: Some(2),
        };
        assert!(audio_settings_for_track(&t).is_err());
    }
}
