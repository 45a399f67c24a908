// Copyright The Citadel SM Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

/// True if the build is configured with debug assertions on.
pub const DEBUG: bool = cfg!(debug_assertions);
