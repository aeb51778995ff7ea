// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw definitions for the hypervisor memory device (`/dev/hvmem`).
//!
//! Structures here are shared verbatim with the kernel component and must
//! keep their `#[repr(C)]` layout.

pub mod ioctls;
mod structs;

pub use ioctls::*;
pub use structs::*;

/// Size of a guest page, as seen by the hypervisor memory device.
pub const HVMEM_PAGE_SIZE: usize = 4096;

/// Maximum number of frames accepted by a single capture or populate
/// request.  Bounded by the region of the transport buffer which the device
/// can address in one call.
pub const HVMEM_MAX_BATCH: usize = 1023;

/// This is the interface version against which hvmem_api expects to operate.
/// All constants and structs defined by the crate are done so in terms of
/// that specific version.
pub const HVMEM_CURRENT_INTERFACE_VERSION: u32 = 3;
