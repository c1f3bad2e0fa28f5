// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The encoded sample: a timestamp/keyframe/kind tuple plus a lazily evaluated payload.

use crate::data::Data;
use base::{bail, Error};
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SampleKind {
    Video,
    Audio,
    Data,
    Caption,
}

type PayloadThunk = Arc<dyn Fn() -> Result<Data<u8>, Error> + Send + Sync>;

/// An encoded sample. `payload()` is lazy: the thunk is only invoked when the payload is
/// actually needed, and may itself perform I/O via a [`crate::reader::Reader`].
#[derive(Clone)]
pub struct Sample {
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub kind: SampleKind,
    payload: PayloadThunk,
    pub byte_range: Option<(u64, u32)>,
}

impl Sample {
    pub fn new(
        pts: i64,
        dts: i64,
        keyframe: bool,
        kind: SampleKind,
        payload: impl Fn() -> Result<Data<u8>, Error> + Send + Sync + 'static,
    ) -> Sample {
        Sample { pts, dts, keyframe, kind, payload: Arc::new(payload), byte_range: None }
    }

    pub fn with_byte_range(mut self, offset: u64, size: u32) -> Sample {
        self.byte_range = Some((offset, size));
        self
    }

    /// Eagerly wraps an already-materialized buffer, for samples synthesized in memory
    /// (PCM coalescing, SEI re-injection, ADTS wrapping) rather than read from a container.
    pub fn from_data(pts: i64, dts: i64, keyframe: bool, kind: SampleKind, data: Data<u8>) -> Sample {
        Sample::new(pts, dts, keyframe, kind, move || Ok(data.clone()))
    }

    pub fn payload(&self) -> Result<Data<u8>, Error> {
        (self.payload)()
    }

    /// Returns a new sample with pts/dts shifted by `offset`. Fails `Overflow`/`OutOfRange`
    /// on over/underflow.
    pub fn shift(&self, offset: i64) -> Result<Sample, Error> {
        let pts = checked_shift(self.pts, offset)?;
        let dts = checked_shift(self.dts, offset)?;
        Ok(Sample { pts, dts, ..self.clone() })
    }
}

fn checked_shift(v: i64, offset: i64) -> Result<i64, Error> {
    v.checked_add(offset)
        .ok_or_else(|| base::err!(Overflow, msg("shifting {} by {} overflows i64", v, offset)))
}

impl PartialEq for Sample {
    /// Metadata-only equality; payloads are compared only on explicit request via
    /// [`Sample::payload_eq`].
    fn eq(&self, other: &Self) -> bool {
        self.pts == other.pts
            && self.dts == other.dts
            && self.keyframe == other.keyframe
            && self.kind == other.kind
            && self.byte_range == other.byte_range
    }
}

impl Sample {
    pub fn payload_eq(&self, other: &Sample) -> Result<bool, Error> {
        Ok(self.payload()?.as_slice() == other.payload()?.as_slice())
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("keyframe", &self.keyframe)
            .field("kind", &self.kind)
            .field("byte_range", &self.byte_range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pts: i64, dts: i64) -> Sample {
        Sample::from_data(pts, dts, true, SampleKind::Video, Data::from_vec(vec![1u8, 2, 3]))
    }

    #[test]
    fn shift_moves_pts_and_dts() {
        let s = sample(100, 90).shift(10).unwrap();
        assert_eq!(s.pts, 110);
        assert_eq!(s.dts, 100);
    }

    #[test]
    fn shift_overflow_fails() {
        let s = sample(i64::MAX, 0);
        assert_eq!(s.shift(1).unwrap_err().kind(), base::ErrorKind::Overflow);
    }

    #[test]
    fn equality_ignores_payload() {
        let a = sample(1, 1);
        let b = Sample::from_data(1, 1, true, SampleKind::Video, Data::from_vec(vec![9u8]));
        assert_eq!(a, b);
        assert!(!a.payload_eq(&b).unwrap());
    }
}
