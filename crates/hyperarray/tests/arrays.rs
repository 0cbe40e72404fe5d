//! Integration tests for array lifetime and data movement.

mod common;

use hyperarray::prelude::*;

#[test]
fn test_shared_buffer_reference_counts() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver.clone());
    let store = manager.arrays();

    let a = store
        .create_array(&[6], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], Placement::Device)
        .unwrap();
    let mut b = store.empty_array(ElementType::F32, &[6]).unwrap();
    store.share_device(&a, &mut b).unwrap();

    assert_eq!(a.device_reference_count(), 2);
    assert_eq!(a.device_ptr(), b.device_ptr());

    drop(a);
    assert_eq!(b.device_reference_count(), 1);
    assert_eq!(driver.stats().frees, 0);

    store.release_device(&mut b).unwrap();
    assert_eq!(driver.stats().frees, 1);
    assert_eq!(driver.stats().live_allocations(), 0);
}

#[test]
fn test_sharing_replaces_previous_buffer() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver.clone());
    let store = manager.arrays();

    let a = store.create_array(&[4], &[1i32; 4], Placement::Device).unwrap();
    let mut b = store.create_array(&[4], &[2i32; 4], Placement::Device).unwrap();
    store.share_device(&a, &mut b).unwrap();

    // b's original allocation had no other owner
    assert_eq!(driver.stats().frees, 1);
    let mut out = [0i32; 4];
    store.get_device(&b, &mut out).unwrap();
    assert_eq!(out, [1; 4]);
}

#[test]
fn test_sharing_requires_matching_layout() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver);
    let store = manager.arrays();

    let a = store.create_array(&[4], &[1.0f32; 4], Placement::Host).unwrap();
    let mut wrong_len = store.empty_array(ElementType::F32, &[5]).unwrap();
    let mut wrong_type = store.empty_array(ElementType::F64, &[4]).unwrap();

    assert!(matches!(
        store.share_host(&a, &mut wrong_len),
        Err(ComputeError::LengthMismatch { expected: 5, actual: 4 })
    ));
    assert!(matches!(
        store.share_host(&a, &mut wrong_type),
        Err(ComputeError::ElementTypeMismatch { .. })
    ));
    assert!(!wrong_len.is_host_allocated());
    assert_eq!(a.host_reference_count(), 1);
}

#[test]
fn test_shape_fixed_after_creation() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver);
    let store = manager.arrays();

    let mut array = store
        .create_array(&[2, 3, 4], &[0u8; 24], Placement::Host)
        .unwrap();
    assert_eq!(array.ndim(), 3);
    assert_eq!(array.dims(), &[2, 3, 4]);
    assert_eq!(array.strides(), &[12, 4, 1]);

    store.allocate_device(&mut array).unwrap();
    store.sync_to_device(&array).unwrap();
    store.release_host(&mut array).unwrap();
    assert_eq!(array.dims(), &[2, 3, 4]);
    assert_eq!(array.byte_len(), 24);
}

#[test]
fn test_round_trip_through_device() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver.clone());
    let store = manager.arrays();

    let data: Vec<f64> = (0..12).map(|i| i as f64 * 0.5).collect();
    let mut array = store.create_array(&[3, 4], &data, Placement::Host).unwrap();
    store.allocate_device(&mut array).unwrap();
    store.sync_to_device(&array).unwrap();

    store.write_host(&array, &[0.0f64; 12]).unwrap();
    store.sync_to_host(&array).unwrap();

    let mut out = vec![0.0f64; 12];
    store.get_host(&array, &mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(driver.stats().htod_copies, 1);
    assert_eq!(driver.stats().dtoh_copies, 1);
}

#[test]
fn test_sync_requires_both_buffers() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver.clone());
    let store = manager.arrays();

    let host_only = store.create_array(&[3], &[1u32, 2, 3], Placement::Host).unwrap();
    assert!(matches!(
        store.sync_to_device(&host_only),
        Err(ComputeError::NotAllocated {
            side: BufferSide::Device
        })
    ));

    let device_only = store.create_array(&[3], &[1u32, 2, 3], Placement::Device).unwrap();
    let copies = driver.stats().htod_copies;
    assert!(matches!(
        store.sync_to_device(&device_only),
        Err(ComputeError::NotAllocated {
            side: BufferSide::Host
        })
    ));
    assert!(store.sync_to_host(&device_only).is_err());
    assert_eq!(driver.stats().htod_copies, copies);
    assert_eq!(driver.stats().dtoh_copies, 0);

    let mut out = [0u32; 3];
    store.get_device(&device_only, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3]);
}

#[test]
fn test_foreign_pointer_is_never_freed() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver.clone());
    let store = manager.arrays();

    let owner = store.create_array(&[8], &[7i64; 8], Placement::Device).unwrap();
    let ptr = store.share_device_to_ptr(&owner).unwrap();

    let mut alias = store.empty_array(ElementType::I64, &[8]).unwrap();
    store.share_device_from_ptr(ptr, &mut alias).unwrap();
    assert_eq!(alias.device_buffer().unwrap().ownership(), Ownership::Foreign);

    let mut out = [0i64; 8];
    store.get_device(&alias, &mut out).unwrap();
    assert_eq!(out, [7; 8]);

    drop(alias);
    assert_eq!(driver.stats().frees, 0);
    drop(owner);
    assert_eq!(driver.stats().frees, 1);
}

#[test]
fn test_host_slice_view() {
    let driver = common::sim_driver();
    let manager = common::bare_manager(driver);
    let store = manager.arrays();

    let array = store
        .create_array(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0], Placement::Host)
        .unwrap();
    let total = store
        .share_host_to_slice(&array, |values: &[f32]| values.iter().sum::<f32>())
        .unwrap();
    assert_eq!(total, 10.0);
    assert!(store
        .share_host_to_slice(&array, |values: &[i32]| values.len())
        .is_err());
}
