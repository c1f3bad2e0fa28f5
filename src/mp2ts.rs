// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MPEG-2 Transport Stream demuxing and muxing (ISO/IEC 13818-1): TS/PES framing, PAT/PMT
//! bookkeeping, and the AUD/ADTS access-unit reassembly and re-framing this container needs
//! on top of it.

mod demux;
mod mux;
mod pes;

pub use demux::{demux, Demuxed};
pub use mux::{mux, AudioTrackInput, DataTrackInput, MuxInput, VideoTrackInput};
