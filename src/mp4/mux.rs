// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The MP4/QuickTime muxer: assembles `ftyp`/`moov`/`mdat` (or, in DASH mode, an init
//! segment's `moov`/`mvex` and a per-chunk `moof`/`mdat` fragment) from demuxed or
//! synthesized [`Media`](crate::media::Media) tracks.
//!
//! Byte layout mirrors ISO/IEC 14496-12 §6.2.3's suggested ordering: `ftyp`, then `moov`
//! (so players can start decoding before the trailing `mdat` has fully arrived), then the
//! sample data itself.

use crate::editbox::EditBox;
use crate::mp4::boxes::BoxWriter;
use crate::mp4::{stsd, tables};
use crate::sample::Sample;
use crate::settings::{AudioCodec, AudioSettings, VideoCodec, VideoSettings};
use base::{bail, Error};

const MOVIE_TIMESCALE: u32 = 1000;
const FTYP_MAJOR_BRAND: &[u8; 4] = b"isom";
const FTYP_COMPATIBLE_BRANDS: &[&[u8; 4]] = &[b"isom", b"iso2", b"avc1", b"mp41"];
const VIDEO_TRACK_ID: u32 = 1;
const AUDIO_TRACK_ID: u32 = 2;

pub struct VideoTrackInput<'a> {
    pub settings: &'a VideoSettings,
    pub samples: &'a [Sample],
    pub edits: &'a [EditBox],
}

pub struct AudioTrackInput<'a> {
    pub settings: &'a AudioSettings,
    pub samples: &'a [Sample],
    pub edits: &'a [EditBox],
}

/// One MP4 output to produce from a set of demuxed/transcoded tracks.
pub struct MuxInput<'a> {
    pub video: Option<VideoTrackInput<'a>>,
    pub audio: Option<AudioTrackInput<'a>>,
    /// Caption samples aligned one-to-one with `video.samples` by index; each is spliced
    /// back into its video sample's AVCC stream as a leading SEI NAL before muxing.
    pub captions: Option<&'a [Sample]>,
}

/// Which slice of the muxed output to produce.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OutputMode {
    /// `ftyp` + `moov` + `mdat`: a complete, standalone file.
    Regular,
    /// `ftyp` + `moov` only, with `stco` offsets computed as though `mdat` followed — for
    /// callers that will append sample bytes themselves (e.g. progressive HTTP serving).
    HeaderOnly,
    /// The `mdat` body alone, laid out to match a prior `HeaderOnly` call's offsets.
    SamplesOnly,
    /// A fragmented-MP4 / DASH initialization segment: `ftyp` + `moov` with empty sample
    /// tables and an `mvex`/`trex` declaring default fragment behavior, no media data.
    DashInit,
    /// A single fragmented-MP4 / DASH media segment: one `moof` + `mdat` pair covering
    /// every sample in `input`.
    DashData,
}

/// Sample-level metadata for one track, already flattened out of [`Sample`]'s lazy payload
/// thunks so the two-pass layout below never re-reads the source.
struct LaidOutTrack {
    track_id: u32,
    timescale: u32,
    durations: Vec<u32>,
    composition_offsets: Vec<i32>,
    sizes: Vec<u32>,
    keyframes: Vec<bool>,
    payloads: Vec<Vec<u8>>,
}

fn sample_durations(samples: &[Sample]) -> Vec<u32> {
    let mut out = Vec::with_capacity(samples.len());
    for i in 0..samples.len() {
        let d = if i + 1 < samples.len() {
            (samples[i + 1].dts - samples[i].dts).max(0) as u32
        } else if i > 0 {
            (samples[i].dts - samples[i - 1].dts).max(0) as u32
        } else {
            0
        };
        out.push(d);
    }
    out
}

fn composition_offsets(samples: &[Sample]) -> Vec<i32> {
    samples.iter().map(|s| (s.pts - s.dts) as i32).collect()
}

fn splice_captions(video_samples: &[Sample], captions: Option<&[Sample]>) -> Result<Vec<Vec<u8>>, Error> {
    let mut out = Vec::with_capacity(video_samples.len());
    for (i, s) in video_samples.iter().enumerate() {
        let video_payload = s.payload()?;
        match captions.and_then(|c| c.get(i)) {
            Some(caption) => {
                let mut merged = caption.payload()?.as_slice().to_vec();
                merged.extend_from_slice(video_payload.as_slice());
                out.push(merged);
            }
            None => out.push(video_payload.as_slice().to_vec()),
        }
    }
    Ok(out)
}

fn lay_out_video(v: &VideoTrackInput, captions: Option<&[Sample]>) -> Result<LaidOutTrack, Error> {
    let payloads = splice_captions(v.samples, captions)?;
    let sizes = payloads.iter().map(|p| p.len() as u32).collect();
    let keyframes = v.samples.iter().map(|s| s.keyframe).collect();
    Ok(LaidOutTrack {
        track_id: VIDEO_TRACK_ID,
        timescale: v.settings.timescale,
        durations: sample_durations(v.samples),
        composition_offsets: composition_offsets(v.samples),
        sizes,
        keyframes,
        payloads,
    })
}

fn lay_out_audio(a: &AudioTrackInput) -> Result<LaidOutTrack, Error> {
    let mut payloads = Vec::with_capacity(a.samples.len());
    let mut sizes = Vec::with_capacity(a.samples.len());
    for s in a.samples {
        let p = s.payload()?;
        sizes.push(p.as_slice().len() as u32);
        payloads.push(p.as_slice().to_vec());
    }
    Ok(LaidOutTrack {
        track_id: AUDIO_TRACK_ID,
        timescale: a.settings.timescale,
        durations: sample_durations(a.samples),
        composition_offsets: Vec::new(),
        sizes,
        keyframes: vec![true; a.samples.len()],
        payloads,
    })
}

fn track_duration(t: &LaidOutTrack) -> u64 {
    t.durations.iter().map(|&d| d as u64).sum()
}

fn movie_duration(tracks: &[&LaidOutTrack]) -> u64 {
    tracks
        .iter()
        .map(|t| {
            let d = track_duration(t);
            if t.timescale == 0 {
                0
            } else {
                d.saturating_mul(MOVIE_TIMESCALE as u64) / t.timescale as u64
            }
        })
        .max()
        .unwrap_or(0)
}

pub fn mux(input: &MuxInput, mode: OutputMode) -> Result<Vec<u8>, Error> {
    match mode {
        OutputMode::Regular => mux_regular(input),
        OutputMode::HeaderOnly => Ok(mux_header_and_mdat(input)?.0),
        OutputMode::SamplesOnly => Ok(mux_header_and_mdat(input)?.1),
        OutputMode::DashInit => mux_dash_init(input),
        OutputMode::DashData => mux_dash_data(input),
    }
}

fn mux_regular(input: &MuxInput) -> Result<Vec<u8>, Error> {
    let (mut header, mdat) = mux_header_and_mdat(input)?;
    header.extend_from_slice(&mdat);
    Ok(header)
}

/// Builds `ftyp`+`moov` and the `mdat` body as a matched pair: `moov`'s `stco` entries are
/// computed assuming the two buffers will be concatenated (or the caller otherwise knows
/// where `mdat`'s body will land, as for [`OutputMode::HeaderOnly`]/[`OutputMode::SamplesOnly`]).
fn mux_header_and_mdat(input: &MuxInput) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let video = input.video.as_ref().map(|v| lay_out_video(v, input.captions)).transpose()?;
    let audio = input.audio.as_ref().map(lay_out_audio).transpose()?;
    if video.is_none() && audio.is_none() {
        bail!(InvalidArguments, msg("mux requires at least one track"));
    }

    let ftyp = write_ftyp(FTYP_MAJOR_BRAND, FTYP_COMPATIBLE_BRANDS);

    let video_edits = input.video.as_ref().map(|v| v.edits).unwrap_or(&[]);
    let audio_edits = input.audio.as_ref().map(|a| a.edits).unwrap_or(&[]);
    let video_settings = input.video.as_ref().map(|v| v.settings);
    let audio_settings = input.audio.as_ref().map(|a| a.settings);

    // First pass: measure moov's size with placeholder (zero) chunk offsets. The box is
    // the same size regardless of the offset values themselves (fixed-width fields).
    let placeholder_moov = write_moov(video_settings, audio_settings, video.as_ref(), audio.as_ref(), video_edits, audio_edits, 0, 0)?;
    let mdat_base = (ftyp.len() + placeholder_moov.len() + 8) as u64;

    let video_len: u64 = video.as_ref().map(|v| v.sizes.iter().map(|&s| s as u64).sum()).unwrap_or(0);
    let audio_chunk_base = mdat_base + video_len;

    let moov = write_moov(video_settings, audio_settings, video.as_ref(), audio.as_ref(), video_edits, audio_edits, mdat_base, audio_chunk_base)?;
    base::check!(moov.len() == placeholder_moov.len(), "moov size must not depend on stco offset values");

    let mut mdat_body = Vec::new();
    if let Some(v) = &video {
        for p in &v.payloads {
            mdat_body.extend_from_slice(p);
        }
    }
    if let Some(a) = &audio {
        for p in &a.payloads {
            mdat_body.extend_from_slice(p);
        }
    }
    let mdat = {
        let mut w = BoxWriter::new();
        w.write_box(b"mdat", |w| {
            w.append_bytes(&mdat_body);
            Ok(())
        })?;
        w.into_vec()
    };

    let mut header = ftyp;
    header.extend_from_slice(&moov);
    Ok((header, mdat))
}

const FTYP_DASH_INIT_COMPATIBLE: &[&[u8; 4]] = &[b"mp42", b"mp41", b"iso6"];
const FTYP_DASH_DATA_COMPATIBLE: &[&[u8; 4]] = &[b"msix", b"mp42", b"mp41", b"iso6"];

fn write_ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.write_box(b"ftyp", |w| {
        w.append_fourcc(major);
        w.append_u32(0); // minor_version
        for b in compatible {
            w.append_fourcc(b);
        }
        Ok(())
    })
    .expect("ftyp body writer never fails");
    w.into_vec()
}

#[allow(clippy::too_many_arguments)]
fn write_moov(
    video_settings: Option<&VideoSettings>,
    audio_settings: Option<&AudioSettings>,
    video: Option<&LaidOutTrack>,
    audio: Option<&LaidOutTrack>,
    video_edits: &[EditBox],
    audio_edits: &[EditBox],
    video_chunk_base: u64,
    audio_chunk_base: u64,
) -> Result<Vec<u8>, Error> {
    let tracks: Vec<&LaidOutTrack> = [video, audio].into_iter().flatten().collect();
    let duration = movie_duration(&tracks);
    let next_track_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;

    let mut w = BoxWriter::new();
    w.write_box(b"moov", |w| {
        w.write_box(b"mvhd", |w| {
            w.append_u32(0); // version/flags
            w.append_u32(0); // creation_time
            w.append_u32(0); // modification_time
            w.append_u32(MOVIE_TIMESCALE);
            w.append_u32(duration as u32);
            w.append_i32(0x0001_0000); // rate
            w.append_u16(0x0100); // volume
            w.append_bytes(&[0u8; 2]); // reserved
            w.append_bytes(&[0u8; 8]); // reserved
            tables::write_matrix(&mut w.buf, &tables::MATRIX_LANDSCAPE);
            w.append_bytes(&[0u8; 24]); // pre_defined
            w.append_u32(next_track_id);
            Ok(())
        })?;
        if let (Some(settings), Some(v)) = (video_settings, video) {
            write_video_trak(w, settings, v, video_edits, video_chunk_base)?;
        }
        if let (Some(settings), Some(a)) = (audio_settings, audio) {
            write_audio_trak(w, settings, a, audio_edits, audio_chunk_base)?;
        }
        Ok(())
    })?;
    Ok(w.into_vec())
}

#[allow(clippy::too_many_arguments)]
fn write_tkhd(
    w: &mut BoxWriter,
    track_id: u32,
    movie_duration: u64,
    matrix: &[i32; 9],
    width_fixed: u32,
    height_fixed: u32,
    volume: u16,
) -> Result<(), Error> {
    w.write_box(b"tkhd", |w| {
        w.append_u32(0x0000_0007); // version=0, flags=enabled|in movie|in preview
        w.append_u32(0); // creation_time
        w.append_u32(0); // modification_time
        w.append_u32(track_id);
        w.append_u32(0); // reserved
        w.append_u32(movie_duration as u32);
        w.append_bytes(&[0u8; 8]); // reserved
        w.append_u16(0); // layer
        w.append_u16(0); // alternate_group
        w.append_u16(volume);
        w.append_u16(0); // reserved
        tables::write_matrix(&mut w.buf, matrix);
        w.append_u32(width_fixed);
        w.append_u32(height_fixed);
        Ok(())
    })
}

fn write_mdhd(w: &mut BoxWriter, timescale: u32, duration: u64) -> Result<(), Error> {
    w.write_box(b"mdhd", |w| {
        w.append_u32(0); // version/flags
        w.append_u32(0); // creation_time
        w.append_u32(0); // modification_time
        w.append_u32(timescale);
        w.append_u32(duration as u32);
        w.append_u16(0x55C4); // language = "und"
        w.append_u16(0); // pre_defined
        Ok(())
    })
}

fn write_hdlr(w: &mut BoxWriter, handler_type: &[u8; 4], name: &str) -> Result<(), Error> {
    w.write_box(b"hdlr", |w| {
        w.append_u32(0);
        w.append_u32(0); // pre_defined
        w.append_fourcc(handler_type);
        w.append_bytes(&[0u8; 12]); // reserved
        w.append_bytes(name.as_bytes());
        w.append_u8(0); // nul terminator
        Ok(())
    })
}

fn write_dinf(w: &mut BoxWriter) -> Result<(), Error> {
    w.write_box(b"dinf", |w| {
        w.write_box(b"dref", |w| {
            w.append_u32(0);
            w.append_u32(1); // entry_count
            w.write_box(b"url ", |w| {
                w.append_u32(1); // version/flags: media data is in this file
                Ok(())
            })
        })
    })
}

fn write_edts(w: &mut BoxWriter, edits: &[EditBox]) -> Result<(), Error> {
    if edits.is_empty() {
        return Ok(());
    }
    w.write_box(b"edts", |w| {
        w.write_box(b"elst", |w| {
            w.append_bytes(&tables::write_elst(edits));
            Ok(())
        })
    })
}

fn write_video_trak(w: &mut BoxWriter, settings: &VideoSettings, v: &LaidOutTrack, edits: &[EditBox], chunk_base: u64) -> Result<(), Error> {
    let duration_in_track_ts = track_duration(v);
    let movie_dur = duration_in_track_ts.saturating_mul(MOVIE_TIMESCALE as u64) / v.timescale.max(1) as u64;
    let matrix = tables::orientation_to_matrix(settings.orientation);
    let width_fixed = (settings.display_width() as u32) << 16;
    let height_fixed = (settings.display_height() as u32) << 16;
    w.write_box(b"trak", |w| {
        write_tkhd(w, v.track_id, movie_dur, &matrix, width_fixed, height_fixed, 0)?;
        write_edts(w, edits)?;
        w.write_box(b"mdia", |w| {
            write_mdhd(w, v.timescale, duration_in_track_ts)?;
            write_hdlr(w, b"vide", "VideoHandler")?;
            w.write_box(b"minf", |w| {
                w.write_box(b"vmhd", |w| {
                    w.append_u32(1); // flags = 1
                    w.append_u16(0); // graphicsmode
                    w.append_bytes(&[0u8; 6]); // opcolor
                    Ok(())
                })?;
                write_dinf(w)?;
                write_stbl_video(w, settings, v, chunk_base)
            })
        })
    })
}

fn write_audio_trak(w: &mut BoxWriter, settings: &AudioSettings, a: &LaidOutTrack, edits: &[EditBox], chunk_base: u64) -> Result<(), Error> {
    let duration_in_track_ts = track_duration(a);
    let movie_dur = duration_in_track_ts.saturating_mul(MOVIE_TIMESCALE as u64) / a.timescale.max(1) as u64;
    w.write_box(b"trak", |w| {
        write_tkhd(w, a.track_id, movie_dur, &tables::MATRIX_LANDSCAPE, 0, 0, 0x0100)?;
        write_edts(w, edits)?;
        w.write_box(b"mdia", |w| {
            write_mdhd(w, a.timescale, duration_in_track_ts)?;
            write_hdlr(w, b"soun", "SoundHandler")?;
            w.write_box(b"minf", |w| {
                w.write_box(b"smhd", |w| {
                    w.append_u32(0);
                    w.append_u16(0); // balance
                    w.append_u16(0); // reserved
                    Ok(())
                })?;
                write_dinf(w)?;
                write_stbl_audio(w, settings, a, chunk_base)
            })
        })
    })
}

fn write_stbl_video(w: &mut BoxWriter, settings: &VideoSettings, v: &LaidOutTrack, chunk_base: u64) -> Result<(), Error> {
    if settings.codec != VideoCodec::H264 {
        bail!(Unsupported, msg("only H264 video tracks can be muxed into MP4"));
    }
    w.write_box(b"stbl", |w| {
        w.write_box(b"stsd", |w| {
            w.append_bytes(&stsd::write_video_stsd(settings.codec, settings.coded_width, settings.coded_height, &settings.sps_pps)?);
            Ok(())
        })?;
        w.write_box(b"stts", |w| {
            w.append_bytes(&tables::write_stts(&v.durations));
            Ok(())
        })?;
        if let Some(ctts) = tables::write_ctts(&v.composition_offsets) {
            w.write_box(b"ctts", |w| {
                w.append_bytes(&ctts);
                Ok(())
            })?;
        }
        w.write_box(b"stsc", |w| {
            w.append_bytes(&tables::write_stsc_one_sample_per_chunk(v.sizes.len() as u32));
            Ok(())
        })?;
        w.write_box(b"stsz", |w| {
            w.append_bytes(&tables::write_stsz(&v.sizes));
            Ok(())
        })?;
        let offsets = write_chunk_offsets(chunk_base, &v.sizes);
        w.write_box(b"stco", |w| {
            w.append_bytes(&tables::write_stco(&offsets));
            Ok(())
        })?;
        if let Some(stss) = tables::write_stss(&v.keyframes) {
            w.write_box(b"stss", |w| {
                w.append_bytes(&stss);
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn write_stbl_audio(w: &mut BoxWriter, settings: &AudioSettings, a: &LaidOutTrack, chunk_base: u64) -> Result<(), Error> {
    if !settings.codec.is_aac() && !settings.codec.is_pcm() {
        bail!(Unsupported, msg("only AAC or PCM audio tracks can be muxed into MP4"));
    }
    w.write_box(b"stbl", |w| {
        w.write_box(b"stsd", |w| {
            let stsd_body = if settings.codec.is_aac() {
                let sfi = sampling_frequency_index(settings.sample_rate)?;
                let asc = crate::nal::asc::write(AudioCodec::AacLc, sfi, settings.channels, None)?;
                stsd::write_audio_stsd(settings.codec, settings.channels, settings.sample_rate, settings.bitrate, &asc)?
            } else {
                stsd::write_pcm_audio_stsd(settings.codec, settings.channels, settings.sample_rate)?
            };
            w.append_bytes(&stsd_body);
            Ok(())
        })?;
        w.write_box(b"stts", |w| {
            w.append_bytes(&tables::write_stts(&a.durations));
            Ok(())
        })?;
        w.write_box(b"stsc", |w| {
            w.append_bytes(&tables::write_stsc_one_sample_per_chunk(a.sizes.len() as u32));
            Ok(())
        })?;
        w.write_box(b"stsz", |w| {
            w.append_bytes(&tables::write_stsz(&a.sizes));
            Ok(())
        })?;
        let offsets = write_chunk_offsets(chunk_base, &a.sizes);
        w.write_box(b"stco", |w| {
            w.append_bytes(&tables::write_stco(&offsets));
            Ok(())
        })
    })
}

/// Maps a sample rate to its MPEG-4 `samplingFrequencyIndex` (ISO/IEC 14496-3 Table 1.16).
fn sampling_frequency_index(sample_rate: u32) -> Result<u8, Error> {
    const RATES: [u32; 13] = [96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350];
    RATES
        .iter()
        .position(|&r| r == sample_rate)
        .map(|i| i as u8)
        .ok_or_else(|| base::err!(Unsupported, msg("unsupported AAC sample rate {}", sample_rate)))
}

fn write_chunk_offsets(base: u64, sizes: &[u32]) -> Vec<u64> {
    let mut out = Vec::with_capacity(sizes.len());
    let mut offset = base;
    for &s in sizes {
        out.push(offset);
        offset += s as u64;
    }
    out
}

fn empty_laid_out(track_id: u32, timescale: u32) -> LaidOutTrack {
    LaidOutTrack {
        track_id,
        timescale,
        durations: Vec::new(),
        composition_offsets: Vec::new(),
        sizes: Vec::new(),
        keyframes: Vec::new(),
        payloads: Vec::new(),
    }
}

fn write_mvex(w: &mut BoxWriter, track_ids: &[u32]) -> Result<(), Error> {
    w.write_box(b"mvex", |w| {
        for &track_id in track_ids {
            w.write_box(b"trex", |w| {
                w.append_u32(0); // version/flags
                w.append_u32(track_id);
                w.append_u32(1); // default_sample_description_index
                w.append_u32(0); // default_sample_duration
                w.append_u32(0); // default_sample_size
                w.append_u32(0); // default_sample_flags
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// Builds the init segment's `moov`: the same track boxes `write_moov` produces, but with
/// empty sample tables (no `mdat` exists yet) and an `mvex`/`trex` per track declaring
/// fragment defaults, so a conformant DASH player knows to expect `moof`/`mdat` fragments.
fn write_moov_dash_init(video_settings: Option<&VideoSettings>, audio_settings: Option<&AudioSettings>) -> Result<Vec<u8>, Error> {
    let video_empty = video_settings.map(|s| empty_laid_out(VIDEO_TRACK_ID, s.timescale));
    let audio_empty = audio_settings.map(|s| empty_laid_out(AUDIO_TRACK_ID, s.timescale));
    let track_ids: Vec<u32> = [video_empty.as_ref(), audio_empty.as_ref()].into_iter().flatten().map(|t| t.track_id).collect();
    let next_track_id = track_ids.iter().copied().max().unwrap_or(0) + 1;

    let mut w = BoxWriter::new();
    w.write_box(b"moov", |w| {
        w.write_box(b"mvhd", |w| {
            w.append_u32(0);
            w.append_u32(0);
            w.append_u32(0);
            w.append_u32(MOVIE_TIMESCALE);
            w.append_u32(0); // duration is unknown ahead of the fragments that carry it
            w.append_i32(0x0001_0000);
            w.append_u16(0x0100);
            w.append_bytes(&[0u8; 2]);
            w.append_bytes(&[0u8; 8]);
            tables::write_matrix(&mut w.buf, &tables::MATRIX_LANDSCAPE);
            w.append_bytes(&[0u8; 24]);
            w.append_u32(next_track_id);
            Ok(())
        })?;
        if let (Some(settings), Some(v)) = (video_settings, &video_empty) {
            write_video_trak(w, settings, v, &[], 0)?;
        }
        if let (Some(settings), Some(a)) = (audio_settings, &audio_empty) {
            write_audio_trak(w, settings, a, &[], 0)?;
        }
        write_mvex(w, &track_ids)
    })?;
    Ok(w.into_vec())
}

fn mux_dash_init(input: &MuxInput) -> Result<Vec<u8>, Error> {
    if input.video.is_none() && input.audio.is_none() {
        bail!(InvalidArguments, msg("mux requires at least one track"));
    }
    let ftyp = write_ftyp(b"iso6", FTYP_DASH_INIT_COMPATIBLE);
    let moov = write_moov_dash_init(input.video.as_ref().map(|v| v.settings), input.audio.as_ref().map(|a| a.settings))?;
    let mut out = ftyp;
    out.extend_from_slice(&moov);
    Ok(out)
}

fn sample_flags(keyframe: bool) -> u32 {
    // ISO/IEC 14496-12 §8.8.3.1 sample_flags: sample_depends_on=2 (no dependents) for a
    // sync sample, 1 + sample_is_non_sync_sample=1 for a non-sync one.
    if keyframe {
        0x0200_0000
    } else {
        0x0101_0000
    }
}

fn write_trun(w: &mut BoxWriter, t: &LaidOutTrack, data_offset: u64, has_composition_offsets: bool) -> Result<(), Error> {
    if data_offset > i32::MAX as u64 {
        bail!(Unsupported, msg("DASH fragment data offset {} exceeds 32-bit range", data_offset));
    }
    w.write_box(b"trun", |w| {
        let mut flags: u32 = 0x0000_0001; // data-offset-present
        flags |= 0x0000_0100; // sample-duration-present
        flags |= 0x0000_0200; // sample-size-present
        flags |= 0x0000_0400; // sample-flags-present
        let version: u32 = if has_composition_offsets {
            flags |= 0x0000_0800; // sample-composition-time-offsets-present
            1
        } else {
            0
        };
        w.append_u32((version << 24) | flags);
        w.append_u32(t.sizes.len() as u32);
        w.append_i32(data_offset as i32);
        for i in 0..t.sizes.len() {
            w.append_u32(t.durations[i]);
            w.append_u32(t.sizes[i]);
            w.append_u32(sample_flags(t.keyframes[i]));
            if has_composition_offsets {
                w.append_i32(t.composition_offsets.get(i).copied().unwrap_or(0));
            }
        }
        Ok(())
    })
}

fn write_traf(w: &mut BoxWriter, t: &LaidOutTrack, data_offset: u64, has_composition_offsets: bool) -> Result<(), Error> {
    w.write_box(b"traf", |w| {
        w.write_box(b"tfhd", |w| {
            w.append_u32(0x02_0000); // flags: default-base-is-moof
            w.append_u32(t.track_id);
            Ok(())
        })?;
        w.write_box(b"tfdt", |w| {
            w.append_u32(0x0100_0000); // version=1, flags=0
            w.append_u64(0); // base_media_decode_time: one self-contained fragment per call
            Ok(())
        })?;
        write_trun(w, t, data_offset, has_composition_offsets)
    })
}

fn write_moof(sequence_number: u32, video: Option<&LaidOutTrack>, audio: Option<&LaidOutTrack>, video_data_offset: u64, audio_data_offset: u64) -> Result<Vec<u8>, Error> {
    let mut w = BoxWriter::new();
    w.write_box(b"moof", |w| {
        w.write_box(b"mfhd", |w| {
            w.append_u32(0);
            w.append_u32(sequence_number);
            Ok(())
        })?;
        if let Some(v) = video {
            write_traf(w, v, video_data_offset, true)?;
        }
        if let Some(a) = audio {
            write_traf(w, a, audio_data_offset, false)?;
        }
        Ok(())
    })?;
    Ok(w.into_vec())
}

/// Builds a single fragment (`moof`/`mdat`) covering every sample in `input`. Like
/// `mux_header_and_mdat`, this is a two-pass layout: the first pass measures `moof` with
/// placeholder (zero) `trun` data offsets, since `moof`'s size doesn't depend on their
/// values, then a second pass fills in the real ones.
fn mux_dash_data(input: &MuxInput) -> Result<Vec<u8>, Error> {
    let video = input.video.as_ref().map(|v| lay_out_video(v, input.captions)).transpose()?;
    let audio = input.audio.as_ref().map(lay_out_audio).transpose()?;
    if video.is_none() && audio.is_none() {
        bail!(InvalidArguments, msg("mux requires at least one track"));
    }

    let ftyp = write_ftyp(b"msdh", FTYP_DASH_DATA_COMPATIBLE);

    let placeholder_moof = write_moof(1, video.as_ref(), audio.as_ref(), 0, 0)?;
    // trun's data_offset is relative to moof's first byte; mdat's body starts 8 bytes past
    // moof's end (the mdat box header).
    let mdat_base = placeholder_moof.len() as u64 + 8;
    let video_len: u64 = video.as_ref().map(|v| v.sizes.iter().map(|&s| s as u64).sum()).unwrap_or(0);
    let video_data_offset = mdat_base;
    let audio_data_offset = mdat_base + video_len;

    let moof = write_moof(1, video.as_ref(), audio.as_ref(), video_data_offset, audio_data_offset)?;
    base::check!(moof.len() == placeholder_moof.len(), "moof size must not depend on data_offset values");

    let mut mdat_body = Vec::new();
    if let Some(v) = &video {
        for p in &v.payloads {
            mdat_body.extend_from_slice(p);
        }
    }
    if let Some(a) = &audio {
        for p in &a.payloads {
            mdat_body.extend_from_slice(p);
        }
    }
    let mdat = {
        let mut w = BoxWriter::new();
        w.write_box(b"mdat", |w| {
            w.append_bytes(&mdat_body);
            Ok(())
        })?;
        w.into_vec()
    };

    let mut out = ftyp;
    out.extend_from_slice(&moof);
    out.extend_from_slice(&mdat);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::sample::SampleKind;
    use crate::settings::{Orientation, SpsPps};
    use byteorder::{BigEndian, ByteOrder};

    fn video_sps_pps() -> SpsPps {
        SpsPps {
            sps: Data::from_vec(vec![0x67, 0x4d, 0x00, 0x1f, 0xAA]),
            pps: Data::from_vec(vec![0x68, 0xee, 0x3c, 0x80]),
            nalu_length_size: 4,
        }
    }

    fn video_sample(pts: i64, dts: i64, keyframe: bool, payload: Vec<u8>) -> Sample {
        Sample::from_data(pts, dts, keyframe, SampleKind::Video, Data::from_vec(payload))
    }

    #[test]
    fn muxes_single_video_track_and_round_trips_through_demux() {
        let settings = VideoSettings::square_pixel(VideoCodec::H264, 1280, 720, 90_000, Orientation::Landscape, video_sps_pps());
        let samples = vec![
            video_sample(0, 0, true, vec![0, 0, 0, 4, 0x65, 1, 2, 3]),
            video_sample(3000, 3000, false, vec![0, 0, 0, 3, 0x41, 9, 9]),
        ];
        let input = MuxInput {
            video: Some(VideoTrackInput { settings: &settings, samples: &samples, edits: &[] }),
            audio: None,
            captions: None,
        };
        let out = mux(&input, OutputMode::Regular).unwrap();

        let reader = shared_reader(out);
        let demuxed = crate::mp4::demux::demux(reader).unwrap();
        let video = demuxed.video.expect("video track");
        assert_eq!(video.settings().coded_width, 1280);
        assert_eq!(video.settings().coded_height, 720);
        let decoded: Vec<Sample> = video.iter().collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].payload().unwrap().as_slice(), samples[0].payload().unwrap().as_slice());
        assert!(decoded[0].keyframe);
        assert!(!decoded[1].keyframe);
    }

    #[test]
    fn header_only_and_samples_only_concatenate_to_a_valid_file() {
        let settings = VideoSettings::square_pixel(VideoCodec::H264, 640, 480, 30_000, Orientation::Landscape, video_sps_pps());
        let samples = vec![video_sample(0, 0, true, vec![0, 0, 0, 4, 0x65, 1, 2, 3])];
        let input = MuxInput {
            video: Some(VideoTrackInput { settings: &settings, samples: &samples, edits: &[] }),
            audio: None,
            captions: None,
        };
        let header = mux(&input, OutputMode::HeaderOnly).unwrap();
        let body = mux(&input, OutputMode::SamplesOnly).unwrap();
        let mut whole = header;
        whole.extend_from_slice(&body);
        let demuxed = crate::mp4::demux::demux(shared_reader(whole)).unwrap();
        assert!(demuxed.video.is_some());
    }

    #[test]
    fn rejects_empty_input() {
        let input = MuxInput { video: None, audio: None, captions: None };
        assert!(mux(&input, OutputMode::Regular).is_err());
    }

    fn shared_reader(data: Vec<u8>) -> crate::reader::SharedReader {
        crate::reader::SharedReader::new(std::sync::Arc::new(crate::reader::MemoryReader::new(Data::from_vec(data))))
    }

    #[test]
    fn dash_init_segment_carries_mvex_and_no_mdat() {
        let settings = VideoSettings::square_pixel(VideoCodec::H264, 640, 480, 30_000, Orientation::Landscape, video_sps_pps());
        let samples = vec![video_sample(0, 0, true, vec![0, 0, 0, 4, 0x65, 1, 2, 3])];
        let input = MuxInput {
            video: Some(VideoTrackInput { settings: &settings, samples: &samples, edits: &[] }),
            audio: None,
            captions: None,
        };
        let out = mux(&input, OutputMode::DashInit).unwrap();

        let ftyp = crate::mp4::boxes::find(&out, (0, out.len()), b"ftyp").unwrap().expect("ftyp");
        assert_eq!(&out[ftyp.body_start..ftyp.body_start + 4], b"iso6");
        assert!(crate::mp4::boxes::find(&out, (0, out.len()), b"mdat").unwrap().is_none());

        let moov = crate::mp4::boxes::find(&out, (0, out.len()), b"moov").unwrap().expect("moov");
        let mvex = crate::mp4::boxes::find(&out, (moov.body_start, moov.body_end), b"mvex").unwrap().expect("mvex");
        let trex = crate::mp4::boxes::find(&out, (mvex.body_start, mvex.body_end), b"trex").unwrap().expect("trex");
        assert_eq!(BigEndian::read_u32(&out[trex.body_start + 4..trex.body_start + 8]), VIDEO_TRACK_ID);

        let trak = crate::mp4::boxes::find(&out, (moov.body_start, moov.body_end), b"trak").unwrap().expect("trak");
        let mdia = crate::mp4::boxes::find(&out, (trak.body_start, trak.body_end), b"mdia").unwrap().expect("mdia");
        let minf = crate::mp4::boxes::find(&out, (mdia.body_start, mdia.body_end), b"minf").unwrap().expect("minf");
        let stbl = crate::mp4::boxes::find(&out, (minf.body_start, minf.body_end), b"stbl").unwrap().expect("stbl");
        let stsz = crate::mp4::boxes::find(&out, (stbl.body_start, stbl.body_end), b"stsz").unwrap().expect("stsz");
        assert_eq!(BigEndian::read_u32(&out[stsz.body_start + 4..stsz.body_start + 8]), 0, "init segment's stsz must describe zero samples");
    }

    #[test]
    fn dash_data_fragment_has_moof_then_mdat_with_matching_trun_sizes() {
        let settings = VideoSettings::square_pixel(VideoCodec::H264, 640, 480, 30_000, Orientation::Landscape, video_sps_pps());
        let samples = vec![
            video_sample(0, 0, true, vec![0, 0, 0, 4, 0x65, 1, 2, 3]),
            video_sample(3000, 3000, false, vec![0, 0, 0, 3, 0x41, 9, 9]),
        ];
        let input = MuxInput {
            video: Some(VideoTrackInput { settings: &settings, samples: &samples, edits: &[] }),
            audio: None,
            captions: None,
        };
        let out = mux(&input, OutputMode::DashData).unwrap();

        let ftyp = crate::mp4::boxes::find(&out, (0, out.len()), b"ftyp").unwrap().expect("ftyp");
        assert_eq!(&out[ftyp.body_start..ftyp.body_start + 4], b"msdh");
        let moof = crate::mp4::boxes::find(&out, (0, out.len()), b"moof").unwrap().expect("moof");
        let mdat = crate::mp4::boxes::find(&out, (0, out.len()), b"mdat").unwrap().expect("mdat");
        assert!(moof.body_end <= mdat.body_start - 8, "mdat must follow moof");

        let expected_len: usize = samples.iter().map(|s| s.payload().unwrap().as_slice().len()).sum();
        assert_eq!(mdat.body_end - mdat.body_start, expected_len);

        let traf = crate::mp4::boxes::find(&out, (moof.body_start, moof.body_end), b"traf").unwrap().expect("traf");
        let trun = crate::mp4::boxes::find(&out, (traf.body_start, traf.body_end), b"trun").unwrap().expect("trun");
        assert_eq!(BigEndian::read_u32(&out[trun.body_start + 4..trun.body_start + 8]), samples.len() as u32);
    }

    #[test]
    fn dash_modes_reject_empty_input() {
        let input = MuxInput { video: None, audio: None, captions: None };
        assert!(mux(&input, OutputMode::DashInit).is_err());
        assert!(mux(&input, OutputMode::DashData).is_err());
    }
}
