//! Stream pool organised by workload family.
//!
//! Each [`StreamFamily`] owns a growable list of slots. A slot holds a live
//! driver stream or nothing; indices are stable once handed out and freed
//! slots are reused before the family grows.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::{check, Driver, EventHandle, StreamHandle};
use crate::error::{ComputeError, Result};

/// Workload category a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamFamily {
    /// Rendering work.
    Render = 0,
    /// General compute work.
    Compute = 1,
    /// Geometry processing.
    Geometry = 2,
    /// Physics simulation.
    Physics = 3,
    /// Anything else.
    Custom = 4,
}

impl StreamFamily {
    /// Number of families.
    pub const COUNT: usize = 5;

    /// All families in id order.
    pub const ALL: [StreamFamily; Self::COUNT] = [
        StreamFamily::Render,
        StreamFamily::Compute,
        StreamFamily::Geometry,
        StreamFamily::Physics,
        StreamFamily::Custom,
    ];

    /// Numeric family id.
    #[must_use]
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Lowercase family name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            StreamFamily::Render => "render",
            StreamFamily::Compute => "compute",
            StreamFamily::Geometry => "geometry",
            StreamFamily::Physics => "physics",
            StreamFamily::Custom => "custom",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<i32> for StreamFamily {
    type Error = ComputeError;

    fn try_from(id: i32) -> Result<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(ComputeError::UnknownStreamFamily(id))
    }
}

impl fmt::Display for StreamFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of one stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSlot {
    /// Owning family.
    pub family: StreamFamily,
    /// Index within the family.
    pub index: usize,
}

impl StreamSlot {
    /// Creates a slot address.
    #[must_use]
    pub fn new(family: StreamFamily, index: usize) -> Self {
        Self { family, index }
    }
}

impl fmt::Display for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.family, self.index)
    }
}

/// Counters for stream lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPoolStats {
    /// Streams created through the driver.
    pub created: u64,
    /// Streams destroyed through the driver.
    pub destroyed: u64,
    /// Creations that reused a freed slot.
    pub reused: u64,
    /// Streams currently live.
    pub live: usize,
}

impl fmt::Display for StreamPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamPool: {} live, {} created ({} reused slots), {} destroyed",
            self.live, self.created, self.reused, self.destroyed
        )
    }
}

/// Slots for every stream family.
///
/// Mutating calls take `&mut self`; sharing the pool across threads requires
/// external serialization.
pub struct StreamPool {
    driver: Arc<dyn Driver>,
    families: [Vec<Option<StreamHandle>>; StreamFamily::COUNT],
    created: u64,
    destroyed: u64,
    reused: u64,
}

impl StreamPool {
    /// Creates an empty pool.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            families: Default::default(),
            created: 0,
            destroyed: 0,
            reused: 0,
        }
    }

    /// Creates a stream in `family`, reusing the first empty slot.
    ///
    /// On driver failure no slot is consumed.
    pub fn create_stream(&mut self, family: StreamFamily) -> Result<StreamSlot> {
        let handle = check(
            self.driver.as_ref(),
            "cuStreamCreate",
            self.driver.stream_create(),
        )?;
        self.created += 1;

        let slots = &mut self.families[family.index()];
        let index = match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(handle);
                self.reused += 1;
                index
            }
            None => {
                slots.push(Some(handle));
                slots.len() - 1
            }
        };
        debug!(%family, slot = index, "Created stream");
        Ok(StreamSlot::new(family, index))
    }

    /// Creates a stream in the family with numeric id `family_id`.
    pub fn create_stream_in_family(&mut self, family_id: i32) -> Result<StreamSlot> {
        let family = match StreamFamily::try_from(family_id) {
            Ok(family) => family,
            Err(err) => {
                warn!(family = family_id, "Unknown stream family");
                return Err(err);
            }
        };
        self.create_stream(family)
    }

    /// Destroys the stream in `slot` and marks the slot empty.
    ///
    /// Pending work on the stream is not awaited.
    pub fn destroy_stream(&mut self, slot: StreamSlot) -> Result<()> {
        let entry = match self.families[slot.family.index()].get_mut(slot.index) {
            Some(entry) => entry,
            None => return reject_slot(slot, "index out of range"),
        };
        let handle = match *entry {
            Some(handle) => handle,
            None => return reject_slot(slot, "slot is empty"),
        };
        check(
            self.driver.as_ref(),
            "cuStreamDestroy",
            self.driver.stream_destroy(handle),
        )?;
        *entry = None;
        self.destroyed += 1;
        debug!(family = %slot.family, slot = slot.index, "Destroyed stream");
        Ok(())
    }

    /// Destroys a stream addressed by numeric family id and index.
    pub fn delete_stream_from_family(&mut self, family_id: i32, index: usize) -> Result<()> {
        let family = match StreamFamily::try_from(family_id) {
            Ok(family) => family,
            Err(err) => {
                warn!(family = family_id, "Unknown stream family");
                return Err(err);
            }
        };
        self.destroy_stream(StreamSlot::new(family, index))
    }

    /// Looks up the stream in `slot` without fallback.
    pub fn get(&self, slot: StreamSlot) -> Option<StreamHandle> {
        self.families[slot.family.index()]
            .get(slot.index)
            .copied()
            .flatten()
    }

    /// Resolves `slot` to its stream, or to the default stream with a warning
    /// when the slot is out of range or empty.
    pub fn stream(&self, slot: StreamSlot) -> StreamHandle {
        match self.get(slot) {
            Some(handle) => handle,
            None => {
                warn!(
                    family = %slot.family,
                    slot = slot.index,
                    "No stream in slot, using default stream"
                );
                StreamHandle::NULL
            }
        }
    }

    /// Resolves numeric ids; a negative family id selects the default stream.
    pub fn resolve(&self, family_id: i32, index: i32) -> StreamHandle {
        if family_id < 0 {
            return StreamHandle::NULL;
        }
        let family = match StreamFamily::try_from(family_id) {
            Ok(family) => family,
            Err(_) => {
                warn!(family = family_id, "Unknown stream family, using default stream");
                return StreamHandle::NULL;
            }
        };
        match usize::try_from(index) {
            Ok(index) => self.stream(StreamSlot::new(family, index)),
            Err(_) => {
                warn!(%family, slot = index, "Negative stream slot, using default stream");
                StreamHandle::NULL
            }
        }
    }

    /// Blocks until the stream in `slot` drains.
    pub fn synchronize(&self, slot: StreamSlot) -> Result<()> {
        match self.get(slot) {
            Some(handle) => check(
                self.driver.as_ref(),
                "cuStreamSynchronize",
                self.driver.stream_synchronize(handle),
            ),
            None => reject_slot(slot, "slot is empty"),
        }
    }

    /// Number of slots ever assigned in `family`, including empty ones.
    #[must_use]
    pub fn family_len(&self, family: StreamFamily) -> usize {
        self.families[family.index()].len()
    }

    /// Number of live streams across all families.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.families
            .iter()
            .map(|slots| slots.iter().filter(|s| s.is_some()).count())
            .sum()
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> StreamPoolStats {
        StreamPoolStats {
            created: self.created,
            destroyed: self.destroyed,
            reused: self.reused,
            live: self.live_streams(),
        }
    }

    /// Creates an event for cross-stream ordering.
    pub fn create_event(&self) -> Result<StreamEvent> {
        StreamEvent::new(Arc::clone(&self.driver))
    }

    /// Destroys every live stream. Slots stay assigned but empty.
    pub fn teardown(&mut self) {
        for family in StreamFamily::ALL {
            for index in 0..self.families[family.index()].len() {
                let slot = StreamSlot::new(family, index);
                if self.get(slot).is_some() {
                    // failures are logged by check; keep going
                    let _ = self.destroy_stream(slot);
                }
            }
        }
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("driver", &self.driver.name())
            .field("families", &self.families)
            .field("stats", &self.stats())
            .finish()
    }
}

fn reject_slot<T>(slot: StreamSlot, reason: &'static str) -> Result<T> {
    warn!(family = %slot.family, slot = slot.index, reason, "Invalid stream slot");
    Err(ComputeError::InvalidStreamSlot {
        family: slot.family,
        index: slot.index,
        reason,
    })
}

/// Driver event, destroyed on drop.
pub struct StreamEvent {
    driver: Arc<dyn Driver>,
    handle: EventHandle,
}

impl StreamEvent {
    /// Creates an event.
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self> {
        let handle = check(driver.as_ref(), "cuEventCreate", driver.event_create())?;
        Ok(Self { driver, handle })
    }

    /// Raw event handle.
    #[must_use]
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    /// Records the event at the current tail of `stream`.
    pub fn record(&self, stream: StreamHandle) -> Result<()> {
        check(
            self.driver.as_ref(),
            "cuEventRecord",
            self.driver.event_record(self.handle, stream),
        )
    }

    /// Makes `stream` wait until the event completes.
    pub fn wait(&self, stream: StreamHandle) -> Result<()> {
        check(
            self.driver.as_ref(),
            "cuStreamWaitEvent",
            self.driver.stream_wait_event(stream, self.handle),
        )
    }

    /// Blocks until the event completes.
    pub fn synchronize(&self) -> Result<()> {
        check(
            self.driver.as_ref(),
            "cuEventSynchronize",
            self.driver.event_synchronize(self.handle),
        )
    }
}

impl Drop for StreamEvent {
    fn drop(&mut self) {
        let _ = check(
            self.driver.as_ref(),
            "cuEventDestroy",
            self.driver.event_destroy(self.handle),
        );
    }
}

impl fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamEvent").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverStatus;
    use crate::sim::{SimCall, SimDriver};

    fn pool() -> (Arc<SimDriver>, StreamPool) {
        let driver = Arc::new(SimDriver::new());
        let pool = StreamPool::new(driver.clone());
        (driver, pool)
    }

    #[test]
    fn test_family_ids() {
        for (id, family) in StreamFamily::ALL.iter().enumerate() {
            assert_eq!(family.id(), id as i32);
            assert_eq!(StreamFamily::try_from(id as i32).unwrap(), *family);
        }
        assert!(matches!(
            StreamFamily::try_from(5),
            Err(ComputeError::UnknownStreamFamily(5))
        ));
        assert!(StreamFamily::try_from(-1).is_err());
        assert_eq!(StreamFamily::Physics.to_string(), "physics");
    }

    #[test]
    fn test_slot_reuse() {
        let (_, mut pool) = pool();
        let a = pool.create_stream(StreamFamily::Compute).unwrap();
        let b = pool.create_stream(StreamFamily::Compute).unwrap();
        let c = pool.create_stream(StreamFamily::Compute).unwrap();
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));

        pool.destroy_stream(b).unwrap();
        assert_eq!(pool.get(b), None);
        assert_eq!(pool.family_len(StreamFamily::Compute), 3);

        let reused = pool.create_stream(StreamFamily::Compute).unwrap();
        assert_eq!(reused.index, 1);
        let grown = pool.create_stream(StreamFamily::Compute).unwrap();
        assert_eq!(grown.index, 3);

        let stats = pool.stats();
        assert_eq!(stats.created, 5);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.live, 4);
    }

    #[test]
    fn test_families_are_independent() {
        let (_, mut pool) = pool();
        pool.create_stream(StreamFamily::Render).unwrap();
        let physics = pool.create_stream_in_family(3).unwrap();
        assert_eq!(physics, StreamSlot::new(StreamFamily::Physics, 0));
        assert_eq!(pool.family_len(StreamFamily::Geometry), 0);
        assert!(matches!(
            pool.create_stream_in_family(9),
            Err(ComputeError::UnknownStreamFamily(9))
        ));
    }

    #[test]
    fn test_invalid_destroy_is_ignored() {
        let (driver, mut pool) = pool();
        let slot = pool.create_stream(StreamFamily::Custom).unwrap();
        pool.destroy_stream(slot).unwrap();
        assert!(matches!(
            pool.destroy_stream(slot),
            Err(ComputeError::InvalidStreamSlot { .. })
        ));
        assert!(pool
            .destroy_stream(StreamSlot::new(StreamFamily::Custom, 7))
            .is_err());
        assert_eq!(driver.stats().streams_destroyed, 1);
    }

    #[test]
    fn test_stream_falls_back_to_default() {
        let (_, mut pool) = pool();
        let slot = pool.create_stream(StreamFamily::Compute).unwrap();
        assert!(!pool.stream(slot).is_null());
        assert!(pool
            .stream(StreamSlot::new(StreamFamily::Compute, 4))
            .is_null());
        assert!(pool.resolve(-1, 0).is_null());
        assert!(pool.resolve(11, 0).is_null());
        assert!(pool.resolve(1, -3).is_null());
        assert_eq!(pool.resolve(1, 0), pool.stream(slot));
    }

    #[test]
    fn test_create_failure_consumes_no_slot() {
        let (driver, mut pool) = pool();
        driver.fail_next(SimCall::StreamCreate, DriverStatus::OUT_OF_MEMORY);
        let err = pool.create_stream(StreamFamily::Render).unwrap_err();
        assert!(err.is_driver_error());
        assert_eq!(pool.family_len(StreamFamily::Render), 0);
        assert_eq!(
            pool.create_stream(StreamFamily::Render).unwrap().index,
            0
        );
    }

    #[test]
    fn test_teardown_destroys_live_streams() {
        let (driver, mut pool) = pool();
        for family in StreamFamily::ALL {
            pool.create_stream(family).unwrap();
        }
        assert_eq!(driver.live_streams(), 5);
        pool.teardown();
        assert_eq!(driver.live_streams(), 0);
        assert_eq!(pool.live_streams(), 0);
        pool.teardown();
        drop(pool);
        assert_eq!(driver.stats().streams_destroyed, 5);
    }

    #[test]
    fn test_event_orders_streams() {
        let (_, mut pool) = pool();
        let producer = pool.create_stream(StreamFamily::Compute).unwrap();
        let consumer = pool.create_stream(StreamFamily::Render).unwrap();
        let event = pool.create_event().unwrap();
        event.record(pool.stream(producer)).unwrap();
        event.wait(pool.stream(consumer)).unwrap();
        event.synchronize().unwrap();
        pool.synchronize(consumer).unwrap();
    }
}
