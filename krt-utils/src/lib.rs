//
// Copyright (c) The Krt Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod bgp;
pub mod ip;
pub mod southbound;
pub mod task;
