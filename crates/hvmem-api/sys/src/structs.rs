// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use libc::size_t;

/// Frame belongs to the running VM.
pub const HVMEM_GI_FLAG_VM: u32 = 1 << 0;
/// Frame belongs to the template the VM was cloned from.
pub const HVMEM_GI_FLAG_TEMPLATE: u32 = 1 << 1;
/// Unmap the frame from the VM physmap once its contents are captured.
pub const HVMEM_GI_FLAG_REMOVE_PFN: u32 = 1 << 2;

/// Page contents are present in the transport buffer.
pub const HVMEM_GI_TYPE_NORMAL: u32 = 1;
/// Mask covering the page type, excluding modifier bits.
pub const HVMEM_GI_TYPE_MASK: u32 = 0x7fff;
/// Page contents are LZ4 compressed, prefixed by a u16 compressed length.
pub const HVMEM_GI_TYPE_COMPRESSED: u32 = 0x8000;

/// Per-frame request (and response) record for `HVMEM_CAPTURE`.
///
/// `gpfn` and `flags` are filled by the caller.  The device fills `type_`
/// and `offset` (relative to the start of the transport buffer) for each
/// frame it fulfills.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct hvmem_gpfn_info {
    pub gpfn: u64,
    pub flags: u32,
    pub type_: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct hvmem_capture {
    pub nr_gpfns: u32,
    /// Output: number of leading entries which were fulfilled
    pub nr_done: u32,
    pub gpfn_info_list: *mut hvmem_gpfn_info,
    pub buffer: *mut u8,
    pub buffer_size: size_t,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct hvmem_populate {
    pub nr_gpfns: u32,
    pub _pad: u32,
    pub gpfn_list: *const u64,
    pub buffer: *const u8,
    pub buffer_size: size_t,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct hvmem_vm_exists {
    pub uuid: [u8; 16],
    /// Output: non-zero if a VM with `uuid` is running
    pub exists: u32,
    pub _pad: u32,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<hvmem_gpfn_info>(), 24);
        assert_eq!(size_of::<hvmem_capture>(), 32);
        assert_eq!(size_of::<hvmem_populate>(), 32);
        assert_eq!(size_of::<hvmem_vm_exists>(), 24);
    }
}
