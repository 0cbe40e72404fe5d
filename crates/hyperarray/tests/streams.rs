//! Integration tests for stream families.

mod common;

use hyperarray::prelude::*;

#[test]
fn test_destroyed_slot_is_reused() {
    let driver = common::sim_driver();
    let mut manager = common::bare_manager(driver.clone());

    let first = manager.create_stream(StreamFamily::Physics).unwrap();
    let second = manager.create_stream(StreamFamily::Physics).unwrap();
    assert_eq!((first.index, second.index), (0, 1));

    manager.destroy_stream(first).unwrap();
    let third = manager.create_stream(StreamFamily::Physics).unwrap();
    assert_eq!(third.index, 0);
    assert_eq!(manager.streams().family_len(StreamFamily::Physics), 2);
    assert_eq!(manager.streams().stats().reused, 1);
    assert_eq!(driver.live_streams(), 2);
}

#[test]
fn test_numeric_family_ids() {
    let driver = common::sim_driver();
    let mut manager = common::bare_manager(driver);

    let slot = manager.streams_mut().create_stream_in_family(2).unwrap();
    assert_eq!(slot.family, StreamFamily::Geometry);
    assert!(matches!(
        manager.streams_mut().create_stream_in_family(9),
        Err(ComputeError::UnknownStreamFamily(9))
    ));

    let handle = manager.streams().resolve(2, 0);
    assert!(!handle.is_null());
    assert!(manager.streams().resolve(-1, 0).is_null());
    assert!(manager.streams().resolve(2, 5).is_null());

    manager.streams_mut().delete_stream_from_family(2, 0).unwrap();
    assert!(manager.streams_mut().delete_stream_from_family(2, 0).is_err());
}

#[test]
fn test_shutdown_destroys_streams() {
    let driver = common::sim_driver();
    let mut manager = common::bare_manager(driver.clone());
    for family in StreamFamily::ALL {
        manager.create_stream(family).unwrap();
    }
    assert_eq!(driver.live_streams(), StreamFamily::COUNT);

    manager.shutdown();
    assert_eq!(driver.live_streams(), 0);
    assert!(manager.create_stream(StreamFamily::Render).is_err());
}
