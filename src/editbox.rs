// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Edit lists: the presentation-time windows a track should actually play, expressed as
//! an ordered list of `(start_pts, duration_pts)` segments over the track's own timescale.
//! A leading segment with `start_pts == EMPTY_EDIT_BOX` represents an initial gap (the
//! track is silent/blank before playback starts).

use base::{bail, Error};

/// Sentinel `start_pts` marking a leading "empty edit": a gap before playback begins,
/// rather than a window into decoded samples.
pub const EMPTY_EDIT_BOX: i64 = -1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EditType {
    Normal,
    Empty,
}

#[derive(Copy, Clone, Debug)]
pub struct EditBox {
    pub start_pts: i64,
    pub duration_pts: u64,
    pub rate: f64,
    pub edit_type: EditType,
}

impl EditBox {
    pub fn new(start_pts: i64, duration_pts: u64, rate: f64, edit_type: EditType) -> EditBox {
        EditBox { start_pts, duration_pts, rate, edit_type }
    }

    pub fn empty(duration_pts: u64) -> EditBox {
        EditBox { start_pts: EMPTY_EDIT_BOX, duration_pts, rate: 1.0, edit_type: EditType::Empty }
    }

    /// Returns a copy shifted by `offset`. Fails `InvalidArguments` if a nonzero offset is
    /// applied to an empty edit box, or if shifting negative would underflow `start_pts`;
    /// fails `Overflow` if shifting positive would overflow it.
    pub fn shift(&self, offset: i64) -> Result<EditBox, Error> {
        if offset != 0 && self.start_pts == EMPTY_EDIT_BOX {
            bail!(InvalidArguments, msg("cannot shift an empty edit box"));
        }
        if offset < 0 {
            if -offset > self.start_pts {
                bail!(InvalidArguments, msg("shift {} would underflow start_pts {}", offset, self.start_pts));
            }
        } else if offset > 0 && i64::MAX - self.start_pts < offset {
            bail!(Overflow, msg("shift {} would overflow start_pts {}", offset, self.start_pts));
        }
        Ok(EditBox { start_pts: self.start_pts + offset, ..*self })
    }
}

/// True if `edit_boxes` is well formed: non-overlapping, and if an empty edit box is
/// present it is the first and only the first entry (a single empty edit box alone is
/// also invalid, since there would be nothing to play).
pub fn valid(edit_boxes: &[EditBox]) -> bool {
    let mut last_end_pts: u64 = 0;
    for (i, eb) in edit_boxes.iter().enumerate() {
        if eb.start_pts == EMPTY_EDIT_BOX {
            if i != 0 || edit_boxes.len() == 1 {
                return false;
            }
        } else if (eb.start_pts as u64) < last_end_pts {
            return false;
        } else {
            last_end_pts = eb.start_pts as u64 + eb.duration_pts;
        }
    }
    true
}

/// Maps an original decode-order `pts` to its real, edit-list-adjusted presentation pts,
/// or `None` if `pts` falls in a gap the edit list skips over.
pub fn real_pts(edit_boxes: &[EditBox], pts: u64) -> Result<Option<i64>, Error> {
    if edit_boxes.is_empty() {
        return Ok(Some(pts as i64));
    }
    let mut new_pts: i64 = 0;
    let mut last_end_pts: u64 = 0;
    for eb in edit_boxes {
        if eb.start_pts == EMPTY_EDIT_BOX {
            if new_pts != 0 {
                bail!(Invalid, msg("empty edit box must be the first entry"));
            }
            new_pts = eb.duration_pts as i64;
            continue;
        }
        let start_pts = eb.start_pts as u64;
        let end_pts = start_pts + eb.duration_pts;
        if start_pts < last_end_pts {
            bail!(Invalid, msg("edit boxes overlap at start_pts {}", start_pts));
        }
        last_end_pts = end_pts;
        if pts >= start_pts && pts < end_pts {
            new_pts += (pts - start_pts) as i64;
            return Ok(Some(new_pts));
        } else if pts > end_pts {
            new_pts += eb.duration_pts as i64;
        } else {
            break;
        }
    }
    Ok(None)
}

/// Convenience wrapper: whether `pts` falls within a window the edit list actually plays.
pub fn plays(edit_boxes: &[EditBox], pts: u64) -> Result<bool, Error> {
    Ok(real_pts(edit_boxes, pts)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_edit_boxes_passes_pts_through() {
        assert_eq!(real_pts(&[], 1234).unwrap(), Some(1234));
    }

    #[test]
    fn pts_inside_window_shifts_by_start() {
        let edits = vec![EditBox::new(100, 50, 1.0, EditType::Normal)];
        assert_eq!(real_pts(&edits, 120).unwrap(), Some(20));
    }

    #[test]
    fn pts_in_gap_does_not_play() {
        let edits = vec![EditBox::new(100, 50, 1.0, EditType::Normal)];
        assert_eq!(real_pts(&edits, 90).unwrap(), None);
        assert!(!plays(&edits, 90).unwrap());
    }

    #[test]
    fn leading_empty_edit_box_offsets_following_windows() {
        let edits = vec![EditBox::empty(30), EditBox::new(0, 50, 1.0, EditType::Normal)];
        assert_eq!(real_pts(&edits, 0).unwrap(), Some(30));
        assert_eq!(real_pts(&edits, 49).unwrap(), Some(79));
    }

    #[test]
    fn valid_rejects_non_leading_empty_edit_box() {
        let edits = vec![
            EditBox::new(0, 50, 1.0, EditType::Normal),
            EditBox::empty(10),
        ];
        assert!(!valid(&edits));
    }

    #[test]
    fn valid_rejects_single_empty_edit_box() {
        assert!(!valid(&[EditBox::empty(10)]));
    }

    #[test]
    fn valid_rejects_overlapping_windows() {
        let edits = vec![
            EditBox::new(0, 50, 1.0, EditType::Normal),
            EditBox::new(40, 20, 1.0, EditType::Normal),
        ];
        assert!(!valid(&edits));
    }

    #[test]
    fn shift_rejects_nonzero_offset_on_empty_edit_box() {
        let eb = EditBox::empty(10);
        assert!(eb.shift(5).is_err());
        assert!(eb.shift(0).is_ok());
    }

    #[test]
    fn shift_rejects_underflow() {
        let eb = EditBox::new(10, 50, 1.0, EditType::Normal);
        assert!(eb.shift(-20).is_err());
        assert!(eb.shift(-10).is_ok());
    }
}
