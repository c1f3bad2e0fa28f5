// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MP4/QuickTime (ISO/IEC 14496-12/-14) demuxing and muxing.
//!
//! Boxes are written in the order most progressive-download-friendly players expect:
//! `ftyp`, then `moov` (so playback can start before the trailing `mdat` arrives in full),
//! then `mdat`. `boxes` holds the generic box-walking/box-writing primitives; `tables` and
//! `stsd` handle the `stbl` children; `demux`/`mux` drive the two directions.

mod boxes;
mod demux;
mod mux;
mod stsd;
mod tables;

pub use demux::{demux, Demuxed};
pub use mux::{mux, AudioTrackInput, MuxInput, OutputMode, VideoTrackInput};
