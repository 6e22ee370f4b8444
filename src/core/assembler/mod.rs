// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Diagnostics and listing support shared by the assembler passes.

pub mod error;
pub mod listing;
