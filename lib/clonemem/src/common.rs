// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub const PAGE_SIZE: usize = hvmem_api::HVMEM_PAGE_SIZE;
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_OFFSET: usize = 0xfff;

/// Maximum number of frames submitted to the hypervisor in a single call.
pub const MAX_BATCH: usize = hvmem_api::HVMEM_MAX_BATCH;

/// Size of a per-thread transport buffer: one batch worth of pages.
pub const TRANSPORT_SIZE: usize = MAX_BATCH * PAGE_SIZE;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const _: () = assert!(PAGE_OFFSET == PAGE_SIZE - 1);

/// Round `len` up to the next multiple of `align`, which must be a power of
/// two.  Returns `None` on overflow.
pub(crate) fn round_up(len: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    len.checked_add(align - 1).map(|l| l & !(align - 1))
}

/// A reference to a guest frame, as handed to the engine by an orchestrator.
///
/// The high bit marks frames backed by the immutable template image.  Those
/// are captured without being taken away from the template.  All other frames
/// are privately owned by the VM.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Gfn(u64);

impl Gfn {
    pub const TEMPLATE_FLAG: u64 = 1 << 63;

    /// A frame privately owned by the running VM.
    pub const fn vm(pfn: u64) -> Self {
        Self(pfn & !Self::TEMPLATE_FLAG)
    }

    /// A frame backed by the template image.
    pub const fn template(pfn: u64) -> Self {
        Self(pfn | Self::TEMPLATE_FLAG)
    }

    /// Wrap a raw, possibly flag-tagged, frame reference.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value, template flag included.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The frame number with the template flag stripped.
    pub const fn pfn(self) -> u64 {
        self.0 & !Self::TEMPLATE_FLAG
    }

    pub const fn is_template(self) -> bool {
        self.0 & Self::TEMPLATE_FLAG != 0
    }
}

impl std::fmt::Debug for Gfn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_template() {
            write!(f, "Gfn(template {:#x})", self.pfn())
        } else {
            write!(f, "Gfn({:#x})", self.pfn())
        }
    }
}

impl std::fmt::Display for Gfn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        core::fmt::LowerHex::fmt(&self.pfn(), f)
    }
}

impl From<Gfn> for u64 {
    fn from(value: Gfn) -> Self {
        value.0
    }
}
