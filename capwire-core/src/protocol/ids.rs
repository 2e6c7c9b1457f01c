use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Import ID: an entry in the import table.
/// Positive IDs (1, 2, 3...) are chosen by the importing side; negative IDs
/// (-1, -2, -3...) are chosen by the exporting side. ID 0 is the main
/// capability. IDs are never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub i64);

impl ImportId {
    /// The main capability on the remote side.
    pub fn main() -> Self {
        ImportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// True when this side chose the ID (positive).
    pub fn is_locally_allocated(&self) -> bool {
        self.0 > 0
    }

    /// The same table slot as the peer names it.
    pub fn as_export(&self) -> ExportId {
        ExportId(self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import#{}", self.0)
    }
}

/// Export ID: an entry in the export table.
/// Negative IDs are chosen by this (exporting) side; positive IDs arrive with
/// peer pushes. ID 0 is the main capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub i64);

impl ExportId {
    /// The main capability on this side.
    pub fn main() -> Self {
        ExportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// True when this side chose the ID (negative).
    pub fn is_locally_allocated(&self) -> bool {
        self.0 < 0
    }

    /// The same table slot as the peer names it.
    pub fn as_import(&self) -> ImportId {
        ImportId(self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export#{}", self.0)
    }
}

/// Monotonic ID allocation for one session. Three counters: positive import
/// IDs we mint for our own pushes, negative export IDs we mint when the
/// serializer announces a capability, and positive export IDs mirrored for
/// pushes the peer sends. Nothing is ever handed out twice.
#[derive(Debug)]
pub struct IdAllocator {
    next_import: AtomicI64,
    next_export: AtomicI64,
    next_inbound_push: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_import: AtomicI64::new(1),
            next_export: AtomicI64::new(-1),
            next_inbound_push: AtomicI64::new(1),
        }
    }

    /// Rebuild an allocator from snapshot watermarks (session resume).
    pub fn from_watermarks(marks: AllocatorWatermarks) -> Self {
        Self {
            next_import: AtomicI64::new(marks.next_import),
            next_export: AtomicI64::new(marks.next_export),
            next_inbound_push: AtomicI64::new(marks.next_inbound_push),
        }
    }

    /// Next positive ID for a call or push this side originates.
    pub fn allocate_import(&self) -> ImportId {
        ImportId(self.next_import.fetch_add(1, Ordering::SeqCst))
    }

    /// Next negative ID for a capability this side announces.
    pub fn allocate_export(&self) -> ExportId {
        ExportId(self.next_export.fetch_sub(1, Ordering::SeqCst))
    }

    /// Next positive export slot for a push received from the peer. Mirrors
    /// the import counter the peer advances when it sends the push.
    pub fn allocate_inbound_push(&self) -> ExportId {
        ExportId(self.next_inbound_push.fetch_add(1, Ordering::SeqCst))
    }

    pub fn watermarks(&self) -> AllocatorWatermarks {
        AllocatorWatermarks {
            next_import: self.next_import.load(Ordering::SeqCst),
            next_export: self.next_export.load(Ordering::SeqCst),
            next_inbound_push: self.next_inbound_push.load(Ordering::SeqCst),
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter positions captured for resume tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorWatermarks {
    pub next_import: i64,
    pub next_export: i64,
    pub next_inbound_push: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_ids_are_zero() {
        assert!(ImportId::main().is_main());
        assert!(ExportId::main().is_main());
        assert_eq!(ImportId::main().0, 0);
    }

    #[test]
    fn sign_discipline() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.allocate_import(), ImportId(1));
        assert_eq!(alloc.allocate_import(), ImportId(2));
        assert_eq!(alloc.allocate_export(), ExportId(-1));
        assert_eq!(alloc.allocate_export(), ExportId(-2));
        assert_eq!(alloc.allocate_inbound_push(), ExportId(1));
        assert_eq!(alloc.allocate_inbound_push(), ExportId(2));
    }

    #[test]
    fn slot_mirroring() {
        assert_eq!(ImportId(5).as_export(), ExportId(5));
        assert_eq!(ExportId(-3).as_import(), ImportId(-3));
    }

    #[test]
    fn watermarks_round_trip() {
        let alloc = IdAllocator::new();
        alloc.allocate_import();
        alloc.allocate_export();
        alloc.allocate_export();
        let marks = alloc.watermarks();
        assert_eq!(marks.next_import, 2);
        assert_eq!(marks.next_export, -3);

        let restored = IdAllocator::from_watermarks(marks);
        assert_eq!(restored.allocate_import(), ImportId(2));
        assert_eq!(restored.allocate_export(), ExportId(-3));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(format!("{}", ImportId(42)), "import#42");
        assert_eq!(format!("{}", ExportId(-17)), "export#-17");
    }
}
