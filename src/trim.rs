// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The trim operator: given a track and its edit list, cuts out the samples whose
//! *playback* time falls within a `[start_ms, start_ms + duration_ms)` window and
//! produces a new edit list that re-expresses that window.

use crate::editbox::{self, EditBox, EditType};
use crate::media::Media;
use crate::sample::Sample;
use crate::settings::Kind;
use base::{bail, Error};

fn ms_to_pts(ms: u64, timescale: u32) -> Result<u64, Error> {
    ms.checked_mul(timescale as u64)
        .map(|v| v / 1000)
        .ok_or_else(|| base::err!(Overflow, msg("{} ms overflows at timescale {}", ms, timescale)))
}

/// The playback-pts window `[start, end)` a trim call covers, in the track's own
/// timescale.
struct Window {
    start: u64,
    end: u64,
}

fn window(timescale: u32, start_ms: u64, duration_ms: u64) -> Result<Window, Error> {
    if duration_ms == 0 {
        bail!(InvalidArguments, msg("trim duration must be nonzero"));
    }
    let start = ms_to_pts(start_ms, timescale)?;
    let len = ms_to_pts(duration_ms, timescale)?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| base::err!(Overflow, msg("trim window end overflows")))?;
    Ok(Window { start, end })
}

/// Clips `edit_boxes` to `w` and rebases the result so the trimmed track's own playback
/// pts starts at zero: the first surviving edit box's `start_pts` still points at the
/// original decode pts where the window begins, but carries no leading empty edit, so
/// `RealPts` of that first sample comes out `0` rather than `start_ms`.
fn trim_edit_boxes(edit_boxes: &[EditBox], w: &Window) -> Vec<EditBox> {
    let mut out = Vec::new();

    if edit_boxes.is_empty() {
        out.push(EditBox::new(w.start as i64, w.end - w.start, 1.0, EditType::Normal));
        return out;
    }

    let mut cum: u64 = 0;
    for eb in edit_boxes {
        let overlap_start = cum.max(w.start);
        let overlap_end = (cum + eb.duration_pts).min(w.end);
        if overlap_start < overlap_end {
            let clipped_duration = overlap_end - overlap_start;
            out.push(if eb.start_pts == editbox::EMPTY_EDIT_BOX {
                EditBox::empty(clipped_duration)
            } else {
                let shift_in_box = (overlap_start - cum) as i64;
                EditBox::new(eb.start_pts + shift_in_box, clipped_duration, eb.rate, eb.edit_type)
            });
        }
        cum += eb.duration_pts;
    }
    out
}

fn plays_in_window(sample: &Sample, edit_boxes: &[EditBox], w: &Window) -> bool {
    if sample.pts < 0 {
        return false;
    }
    match editbox::real_pts(edit_boxes, sample.pts as u64) {
        Ok(Some(playback_pts)) => {
            let playback_pts = playback_pts as u64;
            playback_pts >= w.start && playback_pts < w.end
        }
        _ => false,
    }
}

/// Trims one track to the playback window `[start_ms, start_ms + duration_ms)`.
///
/// Returns the filtered track (samples unchanged, same decode pts/dts — only the edit
/// list remaps them) and the new edit list expressing the window. Fails
/// `InvalidArguments` for a zero duration, `Invalid` if `edit_boxes` is malformed.
pub fn trim<K: Kind>(
    track: &Media<K, Sample>,
    edit_boxes: &[EditBox],
    timescale: u32,
    start_ms: u64,
    duration_ms: u64,
) -> Result<(Media<K, Sample>, Vec<EditBox>), Error> {
    if !edit_boxes.is_empty() && !editbox::valid(edit_boxes) {
        bail!(Invalid, msg("edit box list is not well formed"));
    }
    let w = window(timescale, start_ms, duration_ms)?;
    let new_edit_boxes = trim_edit_boxes(edit_boxes, &w);

    let edit_boxes_owned = edit_boxes.to_vec();
    let trimmed = track.filter(move |s| plays_in_window(s, &edit_boxes_owned, &w));
    Ok((trimmed, new_edit_boxes))
}
