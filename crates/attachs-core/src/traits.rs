//! Core entity traits
//!
//! Shared by the attachment entity and the stores that persist it.

/// Primary key type
pub type Id = i64;

/// Trait for entities that have a primary key
pub trait Identifiable {
    fn id(&self) -> Option<Id>;
    fn is_persisted(&self) -> bool {
        self.id().is_some()
    }
    fn is_new_record(&self) -> bool {
        !self.is_persisted()
    }
}

/// Trait for lockable entities (optimistic locking)
///
/// Stores compare the version they hold against the persisted one and
/// reject the write when they differ. Versions stay non-negative: after
/// `i32::MAX` the counter restarts at 0.
pub trait Lockable {
    fn lock_version(&self) -> i32;

    fn next_lock_version(&self) -> i32 {
        if self.lock_version() == i32::MAX {
            0
        } else {
            self.lock_version() + 1
        }
    }
}
