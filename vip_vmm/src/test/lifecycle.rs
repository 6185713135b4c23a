/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use super::{get_test_config, get_test_vmm, DYNAMIC_SIZE, HEAP_BASE, HEAP_SIZE};
use crate::{
    modules::{device_memory::SimulatedDeviceMemory, mmu_hardware::SimulatedMmuHardware},
    video_memory::{AllocFlags, CacheOp},
    Feature, FeatureSet, VipVmm, VmmConfig, VmmError,
};

fn translate(vmm: &VipVmm<SimulatedDeviceMemory>, pid: u64, address: u64) -> Option<u64> {
    let (index, context) = vmm.mmu().acquire(pid).unwrap();
    let res = context.translate(address).unwrap();
    vmm.mmu().release(index).unwrap();
    res
}

#[test]
fn test_buffer_outlives_free_while_pinned() {
    let test_vmm = get_test_vmm(get_test_config());
    let vmm = &test_vmm.vmm;

    let flags = AllocFlags::MAP_USER | AllocFlags::CACHEABLE;
    let (id, logical, address) = vmm.mem_allocate(0x5000, 0x1000, flags, 7).unwrap();
    assert!(logical.is_some());

    let info = vmm.mem_get_info(id).unwrap();
    assert_eq!(info.physical, HEAP_BASE);
    assert_eq!(info.logical, logical);
    assert_eq!(translate(vmm, 7, address + 0x4fff), Some(HEAP_BASE + 0x4fff));

    vmm.mem_flush_cache(id, CacheOp::Clean).unwrap();
    assert_eq!(test_vmm.heap.cache_op_count(), 1);

    // a second user still has the buffer when its handle is freed
    let memory = vmm.memory().pin(id).unwrap();
    vmm.mem_free(id).unwrap();
    assert_eq!(vmm.mem_get_info(id), Err(VmmError::InvalidArgument));
    assert_eq!(vmm.mem_free(id), Err(VmmError::InvalidArgument));
    assert_eq!(translate(vmm, 7, address), Some(HEAP_BASE));
    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE - 0x8000);

    drop(memory);
    assert_eq!(translate(vmm, 7, address), None);
    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE);
    assert_eq!(vmm.memory().count(), Ok(0));
}

#[test]
fn test_many_buffers_grow_the_database() {
    let test_vmm = get_test_vmm(get_test_config());
    let vmm = &test_vmm.vmm;

    let mut buffers = Vec::new();
    for i in 0..20u64 {
        let flags = if i % 2 == 0 {
            AllocFlags::NONE
        } else {
            AllocFlags::NO_HEAP
        };
        let (id, _, address) = vmm.mem_allocate(0x1000 * (i + 1), 0x1000, flags, 3).unwrap();
        buffers.push((id, address, 0x1000 * (i + 1)));
    }
    assert_eq!(vmm.memory().count(), Ok(20));

    for (id, address, size) in buffers.iter() {
        let info = vmm.mem_get_info(*id).unwrap();
        assert_eq!(info.virtual_address, *address);
        assert_eq!(info.size, *size);
        assert_eq!(translate(vmm, 3, *address), Some(info.physical));
    }

    assert_eq!(vmm.mem_free_process(3), Ok(20));
    assert_eq!(vmm.memory().count(), Ok(0));
    assert_eq!(vmm.mmu().context_count(), Ok(0));
    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE);
    assert_eq!(test_vmm.dynamic.free_bytes(), DYNAMIC_SIZE);
    assert_eq!(test_vmm.device.allocated_bytes(), 0);
}

#[test]
fn test_wrapped_pages_and_raw_mappings() {
    let test_vmm = get_test_vmm(get_test_config());
    let vmm = &test_vmm.vmm;

    let wrapped = vmm
        .mem_wrap_physical(
            &[0x9000_0000, 0x9000_2000],
            &[0x2000, 0x1000],
            AllocFlags::READ_ONLY,
            5,
        )
        .unwrap();
    let info = vmm.mem_get_info(wrapped).unwrap();
    assert_eq!(info.logical, None);
    assert_eq!(info.size, 0x3000);
    assert_eq!(translate(vmm, 5, info.virtual_address + 0x2800), Some(0x9000_2800));

    // caller owned pages are never flushed
    vmm.mem_flush_cache(wrapped, CacheOp::Flush).unwrap();
    assert_eq!(test_vmm.heap.cache_op_count(), 0);

    let (handle, address) = vmm
        .mmu_map(5, &[0xa000_0000], &[0x1800], true, false)
        .unwrap();
    assert_ne!(address, info.virtual_address);
    assert_eq!(translate(vmm, 5, address + 0x17ff), Some(0xa000_17ff));
    assert_eq!(vmm.mmu().context_count(), Ok(1));

    vmm.mmu_unmap(handle).unwrap();
    assert_eq!(translate(vmm, 5, address), None);

    assert_eq!(vmm.mem_free_process(5), Ok(1));
    assert_eq!(vmm.mmu().context_count(), Ok(0));
    assert_eq!(test_vmm.device.allocated_bytes(), 0);
}

#[test]
fn test_free_process_waits_for_pinned_buffers() {
    let test_vmm = get_test_vmm(get_test_config());
    let vmm = &test_vmm.vmm;

    let (id, _, address) = vmm.mem_allocate(0x1000, 0x1000, AllocFlags::NONE, 11).unwrap();
    let memory = vmm.memory().pin(id).unwrap();

    assert_eq!(vmm.mem_free_process(11), Ok(1));
    // the mapping still references the context
    assert_eq!(vmm.mmu().context_count(), Ok(1));
    assert_eq!(memory.address(), address);

    drop(memory);
    assert_eq!(vmm.mmu().context_count(), Ok(0));
    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE);
    assert_eq!(test_vmm.device.allocated_bytes(), 0);
}

#[test]
fn test_activate_in_pd_mode() {
    let test_vmm = get_test_vmm(VmmConfig {
        features: FeatureSet::empty()
            .with(Feature::Mmu)
            .with(Feature::Va40Bit)
            .with(Feature::PdMode),
        flush_poll_retries: 3,
        ..get_test_config()
    });
    let vmm = &test_vmm.vmm;

    let (_, _, buffer) = vmm.mem_allocate(0x1000, 0x1000, AllocFlags::NONE, 2).unwrap();

    let hardware = SimulatedMmuHardware::new(2);
    vmm.activate_context(2, &hardware).unwrap();
    assert_eq!(hardware.flush_count(), 1);
    assert_eq!(translate(vmm, 2, buffer), Some(HEAP_BASE));

    let (address, pd_mode) = hardware.page_table().unwrap();
    assert!(pd_mode);
    let (index, context) = vmm.mmu().acquire(2).unwrap();
    let entry_block = context.hold().unwrap().inspect(|table| table.page_table_address());
    vmm.mmu().release(index).unwrap();
    assert_eq!(entry_block, Ok(address));

    // the MMU never settles within the configured polls
    let stuck = SimulatedMmuHardware::new(4);
    assert_eq!(vmm.activate_context(2, &stuck), Err(VmmError::Timeout));
}

#[test]
fn test_without_mmu() {
    let test_vmm = get_test_vmm(VmmConfig {
        features: FeatureSet::empty(),
        ..get_test_config()
    });
    let vmm = &test_vmm.vmm;

    let (id, _, address) = vmm.mem_allocate(0x3000, 0x1000, AllocFlags::NONE, 1).unwrap();
    assert_eq!(address, HEAP_BASE);
    assert!(!vmm.memory().pin(id).unwrap().is_mmu_mapped());

    assert_eq!(
        vmm.mmu_map(1, &[0x9000_0000], &[0x1000], true, false),
        Err(VmmError::NotSupported)
    );
    assert_eq!(
        vmm.activate_context(1, &SimulatedMmuHardware::new(0)),
        Err(VmmError::NotSupported)
    );

    // only the low 4GiB are reachable without translation
    assert_eq!(
        vmm.mem_allocate(0x1000, 0x1000, AllocFlags::NO_HEAP, 1),
        Err(VmmError::NotSupported)
    );
    assert_eq!(test_vmm.dynamic.free_bytes(), DYNAMIC_SIZE);
    assert_eq!(
        vmm.mem_wrap_physical(&[0x1_2000_0000], &[0x1000], AllocFlags::NONE, 1),
        Err(VmmError::NotSupported)
    );
    assert_eq!(
        vmm.mem_wrap_physical(&[0xffff_f000], &[0x2000], AllocFlags::NONE, 1),
        Err(VmmError::NotSupported)
    );
    let wrapped = vmm
        .mem_wrap_physical(&[0xffff_f000], &[0x1000], AllocFlags::NONE, 1)
        .unwrap();
    assert_eq!(vmm.mem_get_info(wrapped).unwrap().virtual_address, 0xffff_f000);

    assert_eq!(vmm.mem_free_process(1), Ok(2));
    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE);
    assert_eq!(test_vmm.device.allocated_bytes(), 0);
}

#[test]
fn test_oversized_requests() {
    let test_vmm = get_test_vmm(get_test_config());
    let vmm = &test_vmm.vmm;

    for size in [u64::MAX, u64::MAX - 0xfff, (1 << 40) + 0x1000] {
        assert_eq!(
            vmm.mem_allocate(size, 0x1000, AllocFlags::NONE, 1),
            Err(VmmError::InvalidArgument)
        );
    }
    assert_eq!(
        vmm.mem_allocate(0x1000, 1 << 63, AllocFlags::NONE, 1),
        Err(VmmError::InvalidArgument)
    );

    // representable, but no allocator is that large
    assert_eq!(
        vmm.mem_allocate(1 << 40, 0x1000, AllocFlags::CONTIGUOUS_16M, 1),
        Err(VmmError::OutOfMemory)
    );
    assert_eq!(
        vmm.mem_wrap_physical(&[0x1000, 0x3000], &[u64::MAX, 0x1000], AllocFlags::NONE, 1),
        Err(VmmError::InvalidArgument)
    );

    assert_eq!(test_vmm.heap.free_bytes(), HEAP_SIZE);
    assert_eq!(test_vmm.dynamic.free_bytes(), DYNAMIC_SIZE);
    assert_eq!(vmm.memory().count(), Ok(0));
}
