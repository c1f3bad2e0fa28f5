// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The MP4/QuickTime demuxer: walks `moov`'s `trak` boxes, decodes each track's sample
//! table into a [`Media`] of lazily-read [`Sample`]s, and carries edit lists separately so
//! callers can interpret real presentation time via [`crate::editbox`].

use crate::data::Data;
use crate::editbox::EditBox;
use crate::media::Media;
use crate::mp4::boxes::{self, BoxHeader};
use crate::mp4::stsd;
use crate::mp4::tables::{self, StscEntry};
use crate::nal::sei;
use crate::reader::SharedReader;
use crate::sample::{Sample, SampleKind};
use crate::settings::{AudioKind, AudioSettings, CaptionCodec, CaptionKind, CaptionSettings, VideoKind, VideoSettings};
use base::{bail, Error};
use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

/// The three decoded track media a demuxed MP4 can carry. Captions are split out of the
/// video track's SEI NALs rather than demuxed from a `trak` of their own.
pub struct Demuxed {
    pub video: Option<Media<VideoKind, Sample>>,
    pub video_edits: Vec<EditBox>,
    pub audio: Option<Media<AudioKind, Sample>>,
    pub audio_edits: Vec<EditBox>,
    pub captions: Option<Media<CaptionKind, Sample>>,
    /// Cloned from `video_edits`: the caption track has no `trak`/`edts` of its own, since
    /// it is split out of the video track rather than demuxed independently.
    pub caption_edits: Vec<EditBox>,
}

struct TrackTables {
    handler_type: [u8; 4],
    timescale: u32,
    matrix: [i32; 9],
    width_fixed: u32,
    height_fixed: u32,
    stsd: Vec<u8>,
    durations: Vec<u32>,
    composition_offsets: Vec<i32>,
    byte_ranges: Vec<(u64, u32)>,
    sync_samples: Option<Vec<u32>>,
    edits: Vec<EditBox>,
}

/// Demuxes an MP4/QuickTime container from `reader`. Track payload thunks hold only a
/// [`crate::reader::WeakReader`], so dropping `reader`'s last strong handle after this
/// call poisons any not-yet-read sample rather than serving stale bytes.
pub fn demux(reader: SharedReader) -> Result<Demuxed, Error> {
    let len = reader.len();
    if len > u32::MAX as u64 {
        bail!(Unsupported, msg("container of {} bytes exceeds this engine's 32-bit offset support", len));
    }
    let whole = reader.read(0, len as u32)?;
    let buf = whole.as_slice();
    let weak = reader.downgrade();

    let moov = boxes::find(buf, (0, buf.len()), b"moov")?
        .ok_or_else(|| base::err!(Invalid, msg("no moov box found")))?;
    let traks = boxes::find_all(buf, (moov.body_start, moov.body_end), b"trak")?;
    if traks.is_empty() {
        bail!(Invalid, msg("moov has no trak boxes"));
    }

    let mut video: Option<(VideoSettings, Vec<(usize, Sample)>)> = None;
    let mut audio: Option<(AudioSettings, Vec<(usize, Sample)>)> = None;
    let mut video_edits = Vec::new();
    let mut audio_edits = Vec::new();
    let mut caption_samples: Vec<(usize, Sample)> = Vec::new();

    for trak in &traks {
        let t = parse_trak_tables(buf, *trak)?;
        match &t.handler_type {
            b"vide" => {
                let entry = stsd::parse_video_stsd(&t.stsd)?;
                let orientation = tables::matrix_to_orientation(&t.matrix);
                let (par_width, par_height) =
                    derive_par(entry.coded_width, entry.coded_height, t.width_fixed, t.height_fixed);
                let settings = VideoSettings::new(
                    entry.codec,
                    entry.coded_width,
                    entry.coded_height,
                    par_width,
                    par_height,
                    t.timescale,
                    orientation,
                    entry.sps_pps.clone(),
                );
                let samples = build_samples(&t, SampleKind::Video, &weak, Some(&entry.sps_pps))?;
                caption_samples.extend(extract_captions(&samples)?);
                video = Some((settings, strip_sei_from_video_samples(samples)));
                video_edits = t.edits;
            }
            b"soun" => {
                let entry = stsd::parse_audio_stsd(&t.stsd)?;
                let settings = AudioSettings {
                    codec: entry.codec,
                    timescale: t.timescale,
                    sample_rate: entry.sample_rate,
                    channels: entry.channels,
                    bitrate: entry.bitrate,
                };
                let samples = build_samples(&t, SampleKind::Audio, &weak, None)?;
                let samples = if entry.codec.is_pcm() {
                    coalesce_pcm_samples(samples, crate::limits::AUDIO_FRAME_SIZE)
                } else {
                    samples
                };
                audio = Some((settings, samples));
                audio_edits = t.edits;
            }
            other => {
                debug!(handler = ?std::str::from_utf8(other).unwrap_or("????"), "skipping unsupported track handler");
            }
        }
    }

    let video_media = video.map(|(settings, samples)| {
        Media::from_vec(settings, samples.into_iter().map(|(_, s)| s).collect())
    });
    let audio_media = audio.map(|(settings, samples)| {
        Media::from_vec(settings, samples.into_iter().map(|(_, s)| s).collect())
    });
    let captions = if caption_samples.is_empty() {
        None
    } else {
        let timescale = video_media.as_ref().map(|m: &Media<VideoKind, Sample>| m.settings().timescale).unwrap_or(1);
        Some(Media::from_vec(
            CaptionSettings { codec: CaptionCodec::Unknown, timescale },
            caption_samples.into_iter().map(|(_, s)| s).collect(),
        ))
    };

    let caption_edits = if captions.is_some() { video_edits.clone() } else { Vec::new() };

    Ok(Demuxed {
        video: video_media,
        video_edits,
        audio: audio_media,
        audio_edits,
        captions,
        caption_edits,
    })
}

fn parse_trak_tables(buf: &[u8], trak: BoxHeader) -> Result<TrackTables, Error> {
    let range = (trak.body_start, trak.body_end);
    let tkhd = boxes::find(buf, range, b"tkhd")?.ok_or_else(|| base::err!(Invalid, msg("trak missing tkhd")))?;
    let (matrix, width_fixed, height_fixed) = parse_tkhd(&buf[tkhd.body_start..tkhd.body_end])?;

    let mdia = boxes::find(buf, range, b"mdia")?.ok_or_else(|| base::err!(Invalid, msg("trak missing mdia")))?;
    let mdia_range = (mdia.body_start, mdia.body_end);
    let mdhd = boxes::find(buf, mdia_range, b"mdhd")?.ok_or_else(|| base::err!(Invalid, msg("mdia missing mdhd")))?;
    let timescale = parse_mdhd_timescale(&buf[mdhd.body_start..mdhd.body_end])?;
    let hdlr = boxes::find(buf, mdia_range, b"hdlr")?.ok_or_else(|| base::err!(Invalid, msg("mdia missing hdlr")))?;
    let handler_type = parse_hdlr_type(&buf[hdlr.body_start..hdlr.body_end])?;

    let minf = boxes::find(buf, mdia_range, b"minf")?.ok_or_else(|| base::err!(Invalid, msg("mdia missing minf")))?;
    let stbl = boxes::find(buf, (minf.body_start, minf.body_end), b"stbl")?
        .ok_or_else(|| base::err!(Invalid, msg("minf missing stbl")))?;
    let stbl_range = (stbl.body_start, stbl.body_end);

    let stsd_box = boxes::find(buf, stbl_range, b"stsd")?.ok_or_else(|| base::err!(Invalid, msg("stbl missing stsd")))?;
    let stsd_bytes = buf[stsd_box.body_start..stsd_box.body_end].to_vec();

    let stts_box = boxes::find(buf, stbl_range, b"stts")?.ok_or_else(|| base::err!(Invalid, msg("stbl missing stts")))?;
    let durations = tables::parse_stts(&buf[stts_box.body_start..stts_box.body_end])?;

    let composition_offsets = match boxes::find(buf, stbl_range, b"ctts")? {
        Some(h) => tables::parse_ctts(&buf[h.body_start..h.body_end])?,
        None => Vec::new(),
    };

    let stsc_box = boxes::find(buf, stbl_range, b"stsc")?.ok_or_else(|| base::err!(Invalid, msg("stbl missing stsc")))?;
    let stsc: Vec<StscEntry> = tables::parse_stsc(&buf[stsc_box.body_start..stsc_box.body_end])?;

    let stsz_box = boxes::find(buf, stbl_range, b"stsz")?.ok_or_else(|| base::err!(Invalid, msg("stbl missing stsz")))?;
    let sizes = tables::parse_stsz(&buf[stsz_box.body_start..stsz_box.body_end])?;

    let chunk_offsets = if let Some(h) = boxes::find(buf, stbl_range, b"co64")? {
        tables::parse_chunk_offsets(&buf[h.body_start..h.body_end], true)?
    } else {
        let h = boxes::find(buf, stbl_range, b"stco")?.ok_or_else(|| base::err!(Invalid, msg("stbl missing stco/co64")))?;
        tables::parse_chunk_offsets(&buf[h.body_start..h.body_end], false)?
    };

    let byte_ranges = tables::sample_byte_ranges(&stsc, &chunk_offsets, &sizes)?;

    let sync_samples = match boxes::find(buf, stbl_range, b"stss")? {
        Some(h) => Some(tables::parse_stss(&buf[h.body_start..h.body_end])?),
        None => None,
    };

    let edits = match boxes::find(buf, range, b"edts")? {
        Some(edts) => match boxes::find(buf, (edts.body_start, edts.body_end), b"elst")? {
            Some(elst) => tables::parse_elst(&buf[elst.body_start..elst.body_end])?,
            None => Vec::new(),
        },
        None => Vec::new(),
    };

    Ok(TrackTables {
        handler_type,
        timescale,
        matrix,
        width_fixed,
        height_fixed,
        stsd: stsd_bytes,
        durations,
        composition_offsets,
        byte_ranges,
        sync_samples,
        edits,
    })
}

fn parse_tkhd(body: &[u8]) -> Result<([i32; 9], u32, u32), Error> {
    if body.is_empty() {
        bail!(Invalid, msg("tkhd is empty"));
    }
    let version = body[0];
    let fixed_fields_end = if version == 1 { 4 + 32 } else { 4 + 20 };
    if body.len() < fixed_fields_end + 2 + 2 + 2 + 2 + 36 + 8 {
        bail!(Invalid, msg("tkhd too short for version {}", version));
    }
    let matrix_start = fixed_fields_end + 8;
    let matrix = tables::read_matrix(&body[matrix_start..matrix_start + 36])?;
    let dims_start = matrix_start + 36;
    let width_fixed = BigEndian::read_u32(&body[dims_start..dims_start + 4]);
    let height_fixed = BigEndian::read_u32(&body[dims_start + 4..dims_start + 8]);
    Ok((matrix, width_fixed, height_fixed))
}

fn parse_mdhd_timescale(body: &[u8]) -> Result<u32, Error> {
    if body.is_empty() {
        bail!(Invalid, msg("mdhd is empty"));
    }
    let version = body[0];
    let offset = if version == 1 { 4 + 16 } else { 4 + 8 };
    if body.len() < offset + 4 {
        bail!(Invalid, msg("mdhd too short for version {}", version));
    }
    Ok(BigEndian::read_u32(&body[offset..offset + 4]))
}

/// `tkhd`'s `width`/`height` (16.16 fixed point) encode the track's *display* dimensions;
/// when these differ from the sample entry's coded dimensions, the difference is the
/// track's pixel aspect ratio.
fn derive_par(coded_width: u16, coded_height: u16, width_fixed: u32, height_fixed: u32) -> (u16, u16) {
    let tkhd_width = width_fixed >> 16;
    let tkhd_height = height_fixed >> 16;
    if tkhd_width == 0 || tkhd_height == 0 || coded_width == 0 || coded_height == 0 {
        return (1, 1);
    }
    let num = tkhd_width * coded_height as u32;
    let den = tkhd_height * coded_width as u32;
    let g = gcd(num, den);
    if g == 0 {
        return (1, 1);
    }
    let (pw, ph) = (num / g, den / g);
    if pw == 0 || ph == 0 || pw > u16::MAX as u32 || ph > u16::MAX as u32 {
        (1, 1)
    } else {
        (pw as u16, ph as u16)
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn parse_hdlr_type(body: &[u8]) -> Result<[u8; 4], Error> {
    if body.len() < 12 {
        bail!(Invalid, msg("hdlr needs at least 12 bytes, got {}", body.len()));
    }
    Ok(body[8..12].try_into().unwrap())
}

/// Builds the pts-sorted rank of each sample index: `rank[i]` is `i`'s position were the
/// samples reordered by ascending pts. Open-GOP detection needs this to tell a true
/// keyframe (pts order agrees with decode order up to this point) from a sample the
/// container merely flags sync but that decode actually depends on a prior frame for.
fn pts_ranks(ptses: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..ptses.len()).collect();
    order.sort_by_key(|&i| ptses[i]);
    let mut rank = vec![0usize; ptses.len()];
    for (pos, &orig) in order.iter().enumerate() {
        rank[orig] = pos;
    }
    rank
}

fn build_samples(
    t: &TrackTables,
    kind: SampleKind,
    weak: &crate::reader::WeakReader,
    sps_pps: Option<&crate::settings::SpsPps>,
) -> Result<Vec<(usize, Sample)>, Error> {
    let n = t.byte_ranges.len();
    if t.durations.len() != n {
        bail!(Invalid, msg("stts describes {} samples, stsz/stsc/stco describe {}", t.durations.len(), n));
    }
    let mut dts: i64 = 0;
    let mut ptses = Vec::with_capacity(n);
    let mut dtses = Vec::with_capacity(n);
    for i in 0..n {
        let duration = t.durations[i];
        let offset = t.composition_offsets.get(i).copied().unwrap_or(0) as i64;
        ptses.push(dts + offset);
        dtses.push(dts);
        dts += duration as i64;
    }

    // Open-GOP detection (video only; audio/caption tracks have no sync-sample table and
    // every sample decodes independently of pts order): a sample is a true keyframe only
    // if the container's stss flag says so AND pts order agrees with decode order at that
    // position. Samples before the first true keyframe can't be decoded and are dropped.
    let ranks = if kind == SampleKind::Video { pts_ranks(&ptses) } else { Vec::new() };
    let is_true_keyframe = |i: usize| -> bool {
        let container_sync = match &t.sync_samples {
            Some(sync) => sync.binary_search(&((i as u32) + 1)).is_ok(),
            None => true,
        };
        if kind != SampleKind::Video {
            return container_sync;
        }
        container_sync && ranks[i] == i
    };

    let first_keyframe = if kind == SampleKind::Video {
        (0..n).find(|&i| is_true_keyframe(i)).unwrap_or(0)
    } else {
        0
    };

    let sps_pps = sps_pps.cloned();
    let mut out = Vec::with_capacity(n - first_keyframe);
    for i in first_keyframe..n {
        let (byte_offset, byte_size) = t.byte_ranges[i];
        let weak = weak.clone();
        let sps_pps_for_sample = sps_pps.clone();
        let payload = move || -> Result<Data<u8>, Error> {
            let reader = weak.upgrade()?;
            let raw = reader.read(byte_offset, byte_size)?;
            match &sps_pps_for_sample {
                Some(sp) if sp.nalu_length_size != 4 => {
                    let annexb = crate::nal::avcc::avcc_to_annexb(raw.as_slice(), sp.nalu_length_size)?;
                    let reconverted = crate::nal::avcc::annexb_to_avcc(&annexb, 4)?;
                    Ok(Data::from_vec(reconverted))
                }
                _ => Ok(raw),
            }
        };
        out.push((
            i,
            Sample::new(ptses[i], dtses[i], is_true_keyframe(i), kind, payload).with_byte_range(byte_offset, byte_size),
        ));
    }
    Ok(out)
}

/// Fuses consecutive PCM samples with contiguous byte ranges into multi-frame samples of
/// up to `frame_size` raw PCM frames. Fusion breaks at a contiguity discontinuity or once
/// `frame_size` frames have been gathered; only a frame-aligned fusion boundary (the first
/// raw frame's original index is a multiple of `frame_size`) is marked keyframe, since
/// only those are safe split points for a downstream decoder.
fn coalesce_pcm_samples(samples: Vec<(usize, Sample)>, frame_size: u32) -> Vec<(usize, Sample)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < samples.len() {
        let (first_idx, first) = &samples[i];
        let Some((start_offset, first_size)) = first.byte_range else {
            out.push(samples[i].clone());
            i += 1;
            continue;
        };
        let pts = first.pts;
        let dts = first.dts;
        let mut total_size = first_size;
        let mut count: u32 = 1;
        let mut j = i + 1;
        while j < samples.len() && count < frame_size {
            let Some((offset, size)) = samples[j].1.byte_range else { break };
            if offset != start_offset + total_size as u64 {
                break;
            }
            total_size += size;
            count += 1;
            j += 1;
        }
        let keyframe = (*first_idx as u32) % frame_size == 0;
        let group: Vec<Sample> = samples[i..j].iter().map(|(_, s)| s.clone()).collect();
        let payload = move || -> Result<Data<u8>, Error> {
            let mut buf = Vec::with_capacity(total_size as usize);
            for s in &group {
                buf.extend_from_slice(s.payload()?.as_slice());
            }
            Ok(Data::from_vec(buf))
        };
        out.push((
            *first_idx,
            Sample::new(pts, dts, keyframe, SampleKind::Audio, payload).with_byte_range(start_offset, total_size),
        ));
        i = j;
    }
    out
}

/// Wraps each already-demuxed video sample's payload thunk with an additional lazy step
/// that strips caption SEI NALs, so the video track's own payloads come out caption-free
/// (the caption track carries those bytes separately, extracted by [`extract_captions`]
/// from the pre-strip samples before this wrap is applied).
fn strip_sei_from_video_samples(samples: Vec<(usize, Sample)>) -> Vec<(usize, Sample)> {
    samples
        .into_iter()
        .map(|(i, sample)| {
            let byte_range = sample.byte_range;
            let inner = sample.clone();
            let stripped = move || -> Result<Data<u8>, Error> {
                let raw = inner.payload()?;
                let out = crate::nal::avcc::strip_caption_sei(raw.as_slice(), 4)?;
                Ok(Data::from_vec(out))
            };
            let mut s = Sample::new(sample.pts, sample.dts, sample.keyframe, sample.kind, stripped);
            if let Some((offset, size)) = byte_range {
                s = s.with_byte_range(offset, size);
            }
            (i, s)
        })
        .collect()
}

/// Splits ITU-T T.35 caption SEI messages out of each video sample's AVCC NAL stream,
/// producing a standalone caption track aligned one-to-one on the video sample index.
fn extract_captions(video_samples: &[(usize, Sample)]) -> Result<Vec<(usize, Sample)>, Error> {
    let mut out = Vec::new();
    for (i, sample) in video_samples {
        let payload = match sample.payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let locations = crate::nal::avcc::locate_all(payload.as_slice(), 4)?;
        let mut caption_payloads: Vec<Vec<u8>> = Vec::new();
        for loc in &locations {
            if loc.nal_type != crate::nal::NalType::Sei {
                continue;
            }
            let nal_start = loc.offset + 1;
            let nal_end = loc.offset + loc.size;
            if nal_start > nal_end || nal_end > payload.as_slice().len() {
                continue;
            }
            let rbsp = &payload.as_slice()[nal_start..nal_end];
            for (off, size) in sei::caption_payloads(rbsp)? {
                caption_payloads.push(rbsp[off..off + size].to_vec());
            }
        }
        if caption_payloads.is_empty() {
            continue;
        }
        let refs: Vec<&[u8]> = caption_payloads.iter().map(|v| v.as_slice()).collect();
        let nal = sei::rebuild_caption_nal(&refs, 4);
        out.push((
            *i,
            Sample::from_data(sample.pts, sample.dts, sample.keyframe, SampleKind::Caption, Data::from_vec(nal)),
        ));
    }
    Ok(out)
}
