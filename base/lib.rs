// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

mod error;
pub mod logging;

pub use crate::error::{Builder, Error, ErrorKind, ResultExt};
