// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Define constants from sys/hvmem_dev.h

const HVMEMCTL_IOC_BASE: i32 = ((b'H' as i32) << 16) | ((b'M' as i32) << 8);
const HVMEM_IOC_BASE: i32 = ((b'h' as i32) << 16) | ((b'm' as i32) << 8);

// Operations performed on the hvmemctl device
pub const HVMEM_INTERFACE_VERSION: i32 = HVMEMCTL_IOC_BASE | 0x01;
pub const HVMEM_VM_EXISTS: i32 = HVMEMCTL_IOC_BASE | 0x02;

// Operations performed in the context of a given VM
pub const HVMEM_CAPTURE: i32 = HVMEM_IOC_BASE | 0x01;
pub const HVMEM_POPULATE: i32 = HVMEM_IOC_BASE | 0x02;
pub const HVMEM_RELEASE_ALL: i32 = HVMEM_IOC_BASE | 0x03;
