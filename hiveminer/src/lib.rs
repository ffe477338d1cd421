// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Core of the hiveminer fleet coordinator: address allocation over a shared
//! registry, challenge and solution ledgers, and the per-worker mining
//! orchestrator driving an external miner binary.

pub mod allocator;
pub mod api;
pub mod backoff;
pub mod challenges;
pub mod dispatch;
pub mod error;
pub mod hal;
pub mod halt;
pub mod heartbeat;
pub mod hub;
pub mod miner;
pub mod reclaimer;
pub mod register;
pub mod registry;
pub mod signer;
pub mod solutions;
pub mod stats;
pub mod submit;
pub mod work;

pub mod test_utils;

// reexport clap for binaries building on the config crate's argument layering
pub use hiveminer_config::clap;

pub use hub::{Capabilities, Core};
