// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sample-table (`stbl`) box decoding and encoding: `stts`/`ctts` (timing), `stsc`/`stsz`/
//! `stco`/`co64` (byte layout), `stss` (sync samples), and `elst` (edit lists).

use crate::editbox::{EditBox, EditType, EMPTY_EDIT_BOX};
use crate::mp4::boxes::BoxWriter;
use base::{bail, check, Error};
use byteorder::{BigEndian, ByteOrder};

/// `stts`: run-length-encoded sample durations, expanded to one entry per sample.
pub fn parse_stts(data: &[u8]) -> Result<Vec<u32>, Error> {
    full_box_entries(data, 8, |e| {
        let count = BigEndian::read_u32(&e[0..4]);
        let delta = BigEndian::read_u32(&e[4..8]);
        Ok((count, delta))
    })
}

/// `ctts`: run-length-encoded composition-time offsets (pts - dts), expanded per sample.
/// Version 1 offsets are signed; version 0 are unsigned but treated identically here.
pub fn parse_ctts(data: &[u8]) -> Result<Vec<i32>, Error> {
    full_box_entries(data, 8, |e| {
        let count = BigEndian::read_u32(&e[0..4]);
        let offset = BigEndian::read_i32(&e[4..8]);
        Ok((count, offset))
    })
}

fn full_box_entries<T: Copy>(
    data: &[u8],
    entry_size: usize,
    parse_entry: impl Fn(&[u8]) -> Result<(u32, T), Error>,
) -> Result<Vec<T>, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("sample table box needs at least 8 bytes, got {}", data.len()));
    }
    let entry_count = BigEndian::read_u32(&data[4..8]) as usize;
    let body = &data[8..];
    if body.len() < entry_count * entry_size {
        bail!(Invalid, msg("sample table declares {} entries but body is too short", entry_count));
    }
    let mut out = Vec::new();
    for i in 0..entry_count {
        let e = &body[i * entry_size..(i + 1) * entry_size];
        let (count, value) = parse_entry(e)?;
        for _ in 0..count {
            out.push(value);
        }
    }
    Ok(out)
}

/// `stsz`: per-sample sizes. A nonzero `sample_size` field means every sample shares that
/// size and the per-sample table is absent.
pub fn parse_stsz(data: &[u8]) -> Result<Vec<u32>, Error> {
    if data.len() < 12 {
        bail!(Invalid, msg("stsz needs at least 12 bytes, got {}", data.len()));
    }
    let sample_size = BigEndian::read_u32(&data[4..8]);
    let sample_count = BigEndian::read_u32(&data[8..12]) as usize;
    if sample_size != 0 {
        return Ok(vec![sample_size; sample_count]);
    }
    let body = &data[12..];
    if body.len() < sample_count * 4 {
        bail!(Invalid, msg("stsz declares {} samples but body is too short", sample_count));
    }
    Ok((0..sample_count).map(|i| BigEndian::read_u32(&body[i * 4..i * 4 + 4])).collect())
}

/// One `stsc` entry: `first_chunk` is 1-based.
#[derive(Copy, Clone, Debug)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

pub fn parse_stsc(data: &[u8]) -> Result<Vec<StscEntry>, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("stsc needs at least 8 bytes, got {}", data.len()));
    }
    let entry_count = BigEndian::read_u32(&data[4..8]) as usize;
    let body = &data[8..];
    if body.len() < entry_count * 12 {
        bail!(Invalid, msg("stsc declares {} entries but body is too short", entry_count));
    }
    Ok((0..entry_count)
        .map(|i| {
            let e = &body[i * 12..(i + 1) * 12];
            StscEntry {
                first_chunk: BigEndian::read_u32(&e[0..4]),
                samples_per_chunk: BigEndian::read_u32(&e[4..8]),
            }
        })
        .collect())
}

/// `stco`/`co64`: absolute file offset of each chunk's first sample.
pub fn parse_chunk_offsets(data: &[u8], is_64_bit: bool) -> Result<Vec<u64>, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("chunk offset box needs at least 8 bytes, got {}", data.len()));
    }
    let entry_count = BigEndian::read_u32(&data[4..8]) as usize;
    let entry_size = if is_64_bit { 8 } else { 4 };
    let body = &data[8..];
    if body.len() < entry_count * entry_size {
        bail!(Invalid, msg("chunk offset box declares {} entries but body is too short", entry_count));
    }
    Ok((0..entry_count)
        .map(|i| {
            let e = &body[i * entry_size..(i + 1) * entry_size];
            if is_64_bit {
                BigEndian::read_u64(e)
            } else {
                BigEndian::read_u32(e) as u64
            }
        })
        .collect())
}

/// `stss`: 1-based sample numbers of sync (key)frames. Absent `stss` means every sample
/// is a sync sample (the caller is expected to treat `None` that way).
pub fn parse_stss(data: &[u8]) -> Result<Vec<u32>, Error> {
    if data.len() < 8 {
        bail!(Invalid, msg("stss needs at least 8 bytes, got {}", data.len()));
    }
    let entry_count = BigEndian::read_u32(&data[4..8]) as usize;
    let body = &data[8..];
    if body.len() < entry_count * 4 {
        bail!(Invalid, msg("stss declares {} entries but body is too short", entry_count));
    }
    Ok((0..entry_count).map(|i| BigEndian::read_u32(&body[i * 4..i * 4 + 4])).collect())
}

/// Expands `(stsc, chunk_offsets, sample_sizes)` into each sample's absolute `(offset, size)`.
pub fn sample_byte_ranges(
    stsc: &[StscEntry],
    chunk_offsets: &[u64],
    sample_sizes: &[u32],
) -> Result<Vec<(u64, u32)>, Error> {
    check!(!stsc.is_empty() || sample_sizes.is_empty(), "stsc must be present when samples exist");
    let mut out = Vec::with_capacity(sample_sizes.len());
    let mut sample_index = 0usize;
    for (entry_i, entry) in stsc.iter().enumerate() {
        let next_first_chunk = stsc.get(entry_i + 1).map(|e| e.first_chunk).unwrap_or(chunk_offsets.len() as u32 + 1);
        for chunk_number in entry.first_chunk..next_first_chunk {
            let chunk_index = (chunk_number - 1) as usize;
            if chunk_index >= chunk_offsets.len() {
                break;
            }
            let mut offset = chunk_offsets[chunk_index];
            for _ in 0..entry.samples_per_chunk {
                if sample_index >= sample_sizes.len() {
                    bail!(Invalid, msg("stsc/stco describe more samples than stsz provides"));
                }
                let size = sample_sizes[sample_index];
                out.push((offset, size));
                offset += size as u64;
                sample_index += 1;
            }
        }
    }
    if sample_index != sample_sizes.len() {
        bail!(Invalid, msg("stsc/stco describe fewer samples ({}) than stsz provides ({})", sample_index, sample_sizes.len()));
    }
    Ok(out)
}

/// `elst`: edit list entries, translated to this crate's [`EditBox`] representation. Media
/// time `-1` (`elst`'s own empty-edit sentinel) maps directly onto [`EMPTY_EDIT_BOX`].
pub fn parse_elst(data: &[u8]) -> Result<Vec<EditBox>, Error> {
    if data.is_empty() {
        bail!(Invalid, msg("elst needs a version/flags word"));
    }
    let version = data[0];
    let entry_count = BigEndian::read_u32(&data[4..8]) as usize;
    let mut pos = 8usize;
    let mut out = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let (segment_duration, media_time, rate);
        if version == 1 {
            if pos + 20 > data.len() {
                bail!(Invalid, msg("elst v1 entry truncated at offset {}", pos));
            }
            segment_duration = BigEndian::read_u64(&data[pos..pos + 8]);
            media_time = BigEndian::read_i64(&data[pos + 8..pos + 16]);
            rate = BigEndian::read_i32(&data[pos + 16..pos + 20]);
            pos += 20;
        } else {
            if pos + 12 > data.len() {
                bail!(Invalid, msg("elst v0 entry truncated at offset {}", pos));
            }
            segment_duration = BigEndian::read_u32(&data[pos..pos + 4]) as u64;
            media_time = BigEndian::read_i32(&data[pos + 4..pos + 8]) as i64;
            rate = BigEndian::read_i32(&data[pos + 8..pos + 12]);
            pos += 12;
        }
        let edit_type = if media_time == -1 { EditType::Empty } else { EditType::Normal };
        let start_pts = if edit_type == EditType::Empty { EMPTY_EDIT_BOX } else { media_time };
        out.push(EditBox::new(start_pts, segment_duration, rate as f64 / 65536.0, edit_type));
    }
    Ok(out)
}

/// ISO/IEC 14496-12 `unity_matrix` rows for the four cardinal orientations this engine
/// recognizes in `tkhd`'s transformation matrix.
pub const MATRIX_LANDSCAPE: [i32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];
pub const MATRIX_PORTRAIT: [i32; 9] = [0, 0x00010000, 0, -0x00010000, 0, 0, 0, 0, 0x40000000];
pub const MATRIX_LANDSCAPE_REVERSE: [i32; 9] = [-0x00010000, 0, 0, 0, -0x00010000, 0, 0, 0, 0x40000000];
pub const MATRIX_PORTRAIT_REVERSE: [i32; 9] = [0, -0x00010000, 0, 0x00010000, 0, 0, 0, 0, 0x40000000];

pub fn matrix_to_orientation(matrix: &[i32; 9]) -> crate::settings::Orientation {
    use crate::settings::Orientation;
    if *matrix == MATRIX_LANDSCAPE {
        Orientation::Landscape
    } else if *matrix == MATRIX_PORTRAIT {
        Orientation::Portrait
    } else if *matrix == MATRIX_LANDSCAPE_REVERSE {
        Orientation::LandscapeReverse
    } else if *matrix == MATRIX_PORTRAIT_REVERSE {
        Orientation::PortraitReverse
    } else {
        Orientation::Unknown
    }
}

pub fn orientation_to_matrix(o: crate::settings::Orientation) -> [i32; 9] {
    use crate::settings::Orientation;
    match o {
        Orientation::Landscape | Orientation::Unknown => MATRIX_LANDSCAPE,
        Orientation::Portrait => MATRIX_PORTRAIT,
        Orientation::LandscapeReverse => MATRIX_LANDSCAPE_REVERSE,
        Orientation::PortraitReverse => MATRIX_PORTRAIT_REVERSE,
    }
}

pub fn read_matrix(data: &[u8]) -> Result<[i32; 9], Error> {
    if data.len() < 36 {
        bail!(Invalid, msg("tkhd matrix needs 36 bytes, got {}", data.len()));
    }
    let mut m = [0i32; 9];
    for (i, slot) in m.iter_mut().enumerate() {
        *slot = BigEndian::read_i32(&data[i * 4..i * 4 + 4]);
    }
    Ok(m)
}

pub fn write_matrix(out: &mut Vec<u8>, m: &[i32; 9]) {
    for v in m {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Writes `stts` from per-sample durations, run-length-encoding consecutive equal deltas.
pub fn write_stts(durations: &[u32]) -> Vec<u8> {
    let runs = run_length_encode(durations);
    let mut w = BoxWriter::new();
    w.append_u32(0); // version/flags
    w.append_u32(runs.len() as u32);
    for (count, delta) in runs {
        w.append_u32(count);
        w.append_u32(delta);
    }
    w.into_vec()
}

/// Writes `ctts` from per-sample composition offsets. Returns `None` if every offset is
/// zero, since an all-zero `ctts` carries no information a decoder needs.
pub fn write_ctts(offsets: &[i32]) -> Option<Vec<u8>> {
    if offsets.iter().all(|&o| o == 0) {
        return None;
    }
    let runs = run_length_encode(offsets);
    let mut w = BoxWriter::new();
    w.append_u32(0);
    w.append_u32(runs.len() as u32);
    for (count, offset) in runs {
        w.append_u32(count);
        w.append_i32(offset);
    }
    Some(w.into_vec())
}

fn run_length_encode<T: Copy + PartialEq>(values: &[T]) -> Vec<(u32, T)> {
    let mut runs = Vec::new();
    for &v in values {
        match runs.last_mut() {
            Some((count, last)) if *last == v => *count += 1,
            _ => runs.push((1, v)),
        }
    }
    runs
}

/// Writes `stsz` with one size per sample (never uses the constant-size fast path, since
/// this engine's samples are rarely uniform after transcoding/SEI splicing).
pub fn write_stsz(sizes: &[u32]) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.append_u32(0);
    w.append_u32(0); // sample_size = 0 means "see table"
    w.append_u32(sizes.len() as u32);
    for &s in sizes {
        w.append_u32(s);
    }
    w.into_vec()
}

/// Writes `stsc` with one sample per chunk, the simplest layout a muxer can emit.
pub fn write_stsc_one_sample_per_chunk(sample_count: u32) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.append_u32(0);
    w.append_u32(if sample_count == 0 { 0 } else { 1 });
    if sample_count > 0 {
        w.append_u32(1); // first_chunk
        w.append_u32(1); // samples_per_chunk
        w.append_u32(1); // sample_description_index
    }
    w.into_vec()
}

pub fn write_stco(chunk_offsets: &[u64]) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.append_u32(0);
    w.append_u32(chunk_offsets.len() as u32);
    for &o in chunk_offsets {
        w.append_u32(o as u32);
    }
    w.into_vec()
}

/// Writes `stss` from 0-based keyframe indices. Returns `None` if every sample is a sync
/// sample, matching the demuxer's "absent `stss` means all keyframes" convention.
pub fn write_stss(keyframes: &[bool]) -> Option<Vec<u8>> {
    if keyframes.iter().all(|&k| k) {
        return None;
    }
    let numbers: Vec<u32> = keyframes
        .iter()
        .enumerate()
        .filter(|(_, &k)| k)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut w = BoxWriter::new();
    w.append_u32(0);
    w.append_u32(numbers.len() as u32);
    for n in numbers {
        w.append_u32(n);
    }
    Some(w.into_vec())
}

/// Writes `elst` (version 1: 64-bit segment durations and media times) from this crate's
/// [`EditBox`] list.
pub fn write_elst(edits: &[EditBox]) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.append_u8(1); // version
    w.append_bytes(&[0, 0, 0]); // flags
    w.append_u32(edits.len() as u32);
    for e in edits {
        w.append_u64(e.duration_pts);
        w.append_i64(e.start_pts);
        w.append_i32((e.rate * 65536.0) as i32);
    }
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_box(version_flags: u32, entry_count: u32, entries: &[u8]) -> Vec<u8> {
        let mut out = version_flags.to_be_bytes().to_vec();
        out.extend_from_slice(&entry_count.to_be_bytes());
        out.extend_from_slice(entries);
        out
    }

    #[test]
    fn stts_expands_run_length_durations() {
        let entries = [0, 0, 0, 2, 0, 0, 0, 10]; // count=2, delta=10
        let data = full_box(0, 1, &entries);
        assert_eq!(parse_stts(&data).unwrap(), vec![10, 10]);
    }

    #[test]
    fn stsz_constant_size_skips_table() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(&100u32.to_be_bytes()); // sample_size
        data.extend_from_slice(&3u32.to_be_bytes()); // sample_count
        assert_eq!(parse_stsz(&data).unwrap(), vec![100, 100, 100]);
    }

    #[test]
    fn sample_byte_ranges_walks_chunks_in_order() {
        let stsc = vec![StscEntry { first_chunk: 1, samples_per_chunk: 2 }];
        let chunk_offsets = vec![1000u64, 2000];
        let sizes = vec![10u32, 20, 30, 40];
        let ranges = sample_byte_ranges(&stsc, &chunk_offsets, &sizes).unwrap();
        assert_eq!(ranges, vec![(1000, 10), (1010, 20), (2000, 30), (2030, 40)]);
    }

    #[test]
    fn elst_media_time_negative_one_is_empty_edit() {
        let mut entries = Vec::new();
        entries.extend_from_slice(&1000u32.to_be_bytes());
        entries.extend_from_slice(&(-1i32).to_be_bytes());
        entries.extend_from_slice(&0x00010000i32.to_be_bytes());
        let data = full_box(0, 1, &entries);
        let edits = parse_elst(&data).unwrap();
        assert_eq!(edits[0].start_pts, EMPTY_EDIT_BOX);
        assert_eq!(edits[0].duration_pts, 1000);
    }

    #[test]
    fn matrix_round_trips_orientation() {
        for o in [
            crate::settings::Orientation::Landscape,
            crate::settings::Orientation::Portrait,
            crate::settings::Orientation::LandscapeReverse,
            crate::settings::Orientation::PortraitReverse,
        ] {
            assert_eq!(matrix_to_orientation(&orientation_to_matrix(o)), o);
        }
    }

    #[test]
    fn written_stts_round_trips_through_parse() {
        let durations = vec![512u32, 512, 512, 600];
        let stts = write_stts(&durations);
        assert_eq!(parse_stts(&stts).unwrap(), durations);
    }

    #[test]
    fn written_stsz_stsc_stco_round_trip_to_byte_ranges() {
        let sizes = vec![10u32, 20, 30];
        let stsz = write_stsz(&sizes);
        let stsc = write_stsc_one_sample_per_chunk(3);
        let stco = write_stco(&[1000, 1010, 1030]);
        assert_eq!(parse_stsz(&stsz).unwrap(), sizes);
        let ranges = sample_byte_ranges(
            &parse_stsc(&stsc).unwrap(),
            &parse_chunk_offsets(&stco, false).unwrap(),
            &parse_stsz(&stsz).unwrap(),
        )
        .unwrap();
        assert_eq!(ranges, vec![(1000, 10), (1010, 20), (1030, 30)]);
    }

    #[test]
    fn write_stss_omits_box_when_all_keyframes() {
        assert!(write_stss(&[true, true, true]).is_none());
        let stss = write_stss(&[true, false, true]).unwrap();
        assert_eq!(parse_stss(&stss).unwrap(), vec![1, 3]);
    }

    #[test]
    fn written_elst_round_trips_through_parse() {
        let edits = vec![EditBox::new(100, 5000, 1.0, EditType::Normal)];
        let elst = write_elst(&edits);
        let parsed = parse_elst(&elst).unwrap();
        assert_eq!(parsed[0].start_pts, 100);
        assert_eq!(parsed[0].duration_pts, 5000);
    }
}
