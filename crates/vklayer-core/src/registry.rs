use dashmap::DashMap;
use tracing::trace;

use crate::error::CoreError;
use crate::handle::ObjectType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Live,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
struct ObjectRecord {
    object_type: ObjectType,
    liveness: Liveness,
}

/// Result of looking a handle up against an expected type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Never registered (garbage or null).
    InvalidHandle,
    /// Live, but registered as a different type.
    WrongType(ObjectType),
    Destroyed,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        self == Validity::Valid
    }

    /// Diagnostic text for a failed lookup, `None` when valid.
    pub fn describe(self, raw: u64, expected: ObjectType) -> Option<String> {
        let base = format!("Invalid {} Object 0x{:x}", expected.vk_name(), raw);
        match self {
            Validity::Valid => None,
            Validity::InvalidHandle => Some(base),
            Validity::WrongType(actual) => Some(format!(
                "{}: handle refers to a {} object",
                base,
                actual.vk_name()
            )),
            Validity::Destroyed => Some(format!("{}: object has been destroyed", base)),
        }
    }
}

/// Liveness and type of every handle created through the trackers.
///
/// Destroyed handles stay in the table as tombstones so that use after
/// destroy can be told apart from a handle that never existed.
pub struct ObjectRegistry {
    objects: DashMap<u64, ObjectRecord>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Record a newly created object.
    pub fn register(&self, raw: u64, object_type: ObjectType) -> Result<(), CoreError> {
        let record = ObjectRecord {
            object_type,
            liveness: Liveness::Live,
        };
        match self.objects.entry(raw) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.liveness == Liveness::Live {
                    return Err(CoreError::DuplicateHandle(raw, existing.object_type));
                }
                entry.insert(record);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
        trace!(handle = raw, object_type = %object_type, "registered");
        Ok(())
    }

    /// Mark an object destroyed. Returns what the lookup found before the
    /// change; the record is only touched when that was `Valid`.
    pub fn unregister(&self, raw: u64, object_type: ObjectType) -> Validity {
        let Some(mut record) = self.objects.get_mut(&raw) else {
            return Validity::InvalidHandle;
        };
        let validity = Self::check(&record, object_type);
        if validity.is_valid() {
            record.liveness = Liveness::Destroyed;
            trace!(handle = raw, object_type = %object_type, "unregistered");
        }
        validity
    }

    pub fn validate(&self, raw: u64, object_type: ObjectType) -> Validity {
        match self.objects.get(&raw) {
            Some(record) => Self::check(&record, object_type),
            None => Validity::InvalidHandle,
        }
    }

    fn check(record: &ObjectRecord, expected: ObjectType) -> Validity {
        match record.liveness {
            Liveness::Destroyed => Validity::Destroyed,
            Liveness::Live if record.object_type != expected => {
                Validity::WrongType(record.object_type)
            }
            Liveness::Live => Validity::Valid,
        }
    }

    /// Number of live objects of the given type.
    pub fn live_count(&self, object_type: ObjectType) -> usize {
        self.objects
            .iter()
            .filter(|r| r.object_type == object_type && r.liveness == Liveness::Live)
            .count()
    }

    /// Total number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
