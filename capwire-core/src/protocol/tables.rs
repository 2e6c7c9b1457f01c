// Session-local capability tables. One side's imports are the other side's
// exports; entries are keyed by the ID exactly as it appears on the wire.
//
// Import entries carry two counters: `refcount` is the number of live local
// handles, `introductions` is the number of times the peer has announced the
// ID since the entry was created. When the last handle goes away the session
// emits `["release", id, introductions]`, and the exporting side decrements
// its own introduction count by that amount, so a re-announcement racing a
// release can never drop the export early.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::trace;

use crate::error::RpcError;
use super::hooks::StubHook;
use super::ids::{ExportId, ImportId};
use super::value::Value;

pub(crate) type Resolution = Option<Result<Value, RpcError>>;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("unknown import ID: {0}")]
    UnknownImport(ImportId),

    #[error("unknown export ID: {0}")]
    UnknownExport(ExportId),

    #[error("duplicate import ID: {0}")]
    DuplicateImport(ImportId),

    #[error("duplicate export ID: {0}")]
    DuplicateExport(ExportId),
}

pub(crate) struct ImportEntry {
    refcount: AtomicU32,
    introductions: AtomicU32,
    resolution: watch::Sender<Resolution>,
    pull_requested: AtomicBool,
}

impl ImportEntry {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            refcount: AtomicU32::new(1),
            introductions: AtomicU32::new(1),
            resolution: tx,
            pull_requested: AtomicBool::new(false),
        }
    }
}

/// Imports: capabilities the peer hosts, keyed by wire ID.
pub(crate) struct ImportTable {
    entries: DashMap<ImportId, ImportEntry>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Install a fresh entry for an ID this side allocated by pushing a
    /// call. The push itself counts as the first introduction.
    pub fn register_push(&self, id: ImportId) -> Result<(), TableError> {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TableError::DuplicateImport(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ImportEntry::new());
                Ok(())
            }
        }
    }

    /// Record a peer announcement (`["export", id]` / `["promise", id]`).
    /// A re-announcement bumps both counters: one more introduction on the
    /// wire, one more local handle about to be handed out.
    pub fn register_announcement(&self, id: ImportId) {
        let entry = self.entries.entry(id).or_insert_with(|| {
            trace!(%id, "new import announced by peer");
            let fresh = ImportEntry::new();
            // The constructor already counted this announcement and handle.
            fresh.refcount.store(0, Ordering::SeqCst);
            fresh.introductions.store(0, Ordering::SeqCst);
            fresh
        });
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        entry.introductions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn contains(&self, id: ImportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// One more local handle (stub dup or derived path reference).
    pub fn add_ref(&self, id: ImportId) -> Result<(), TableError> {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or(TableError::UnknownImport(id))
    }

    /// Drop one local handle. When the count reaches zero the entry is
    /// removed and the accumulated introduction total is returned so the
    /// caller can emit the matching release.
    pub fn release_local(&self, id: ImportId) -> Option<u32> {
        let mut drained = None;
        let remove = {
            let entry = self.entries.get(&id)?;
            let before = entry.refcount.fetch_sub(1, Ordering::SeqCst);
            if before <= 1 {
                drained = Some(entry.introductions.load(Ordering::SeqCst));
                true
            } else {
                false
            }
        };
        if remove {
            self.entries.remove(&id);
        }
        drained
    }

    /// Complete the entry with a resolution. Returns false when the ID is
    /// unknown (already released); the caller drops the completion silently.
    pub fn resolve(&self, id: ImportId, outcome: Result<Value, RpcError>) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                let _ = entry.resolution.send(Some(outcome));
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, id: ImportId) -> Option<watch::Receiver<Resolution>> {
        self.entries.get(&id).map(|e| e.resolution.subscribe())
    }

    /// Flag that a pull has been sent for this ID. Returns true the first
    /// time so the caller emits exactly one `pull` per import.
    pub fn mark_pull_requested(&self, id: ImportId) -> bool {
        self.entries
            .get(&id)
            .map(|e| !e.pull_requested.swap(true, Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Remove an entry without reporting introductions to release: used to
    /// cancel allocations that were never put on the wire. Waiters fail
    /// with `canceled`.
    pub fn discard(&self, id: ImportId) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            let _ = entry
                .resolution
                .send(Some(Err(RpcError::canceled("batch canceled before flush"))));
        }
    }

    /// Fail every outstanding entry and clear the table (abort/shutdown).
    pub fn fail_all(&self, error: &RpcError) {
        for entry in self.entries.iter() {
            let _ = entry.resolution.send(Some(Err(error.clone())));
        }
        self.entries.clear();
    }

    pub fn snapshot(&self) -> Vec<(i64, u32, u32)> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.key().0,
                    e.refcount.load(Ordering::SeqCst),
                    e.introductions.load(Ordering::SeqCst),
                )
            })
            .collect()
    }
}

pub(crate) struct ExportEntry {
    hook: StubHook,
    identity: uuid::Uuid,
    introductions: AtomicU32,
}

/// Exports: capabilities this side hosts on behalf of the peer.
pub(crate) struct ExportTable {
    entries: DashMap<ExportId, ExportEntry>,
    by_identity: DashMap<uuid::Uuid, ExportId>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_identity: DashMap::new(),
        }
    }

    /// Install the main capability at ID 0.
    pub fn register_root(&self, hook: StubHook) -> Result<(), TableError> {
        self.insert(ExportId::main(), hook)
    }

    /// Install the result of an inbound push at the mirrored positive ID.
    pub fn register_push(&self, id: ExportId, hook: StubHook) -> Result<(), TableError> {
        self.insert(id, hook)
    }

    fn insert(&self, id: ExportId, hook: StubHook) -> Result<(), TableError> {
        let identity = hook.identity();
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TableError::DuplicateExport(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ExportEntry {
                    hook,
                    identity,
                    introductions: AtomicU32::new(1),
                });
                self.by_identity.insert(identity, id);
                Ok(())
            }
        }
    }

    /// Mint or reuse an export slot for a hook the serializer is announcing.
    /// Re-announcing the same underlying capability reuses its ID and bumps
    /// the introduction count; the caller supplies a freshly allocated
    /// negative ID for the first announcement.
    pub fn announce(
        &self,
        hook: &StubHook,
        allocate: impl FnOnce() -> ExportId,
    ) -> (ExportId, bool) {
        let identity = hook.identity();
        if let Some(existing) = self.by_identity.get(&identity) {
            let id = *existing;
            drop(existing);
            if let Some(entry) = self.entries.get(&id) {
                entry.introductions.fetch_add(1, Ordering::SeqCst);
                return (id, false);
            }
        }
        let id = allocate();
        self.entries.insert(
            id,
            ExportEntry {
                hook: hook.dup(),
                identity,
                introductions: AtomicU32::new(1),
            },
        );
        self.by_identity.insert(identity, id);
        (id, true)
    }

    /// The hook behind an export. This is an uncounted working reference;
    /// callers that keep it (rather than delegate through it) dup it.
    pub fn hook(&self, id: ExportId) -> Option<StubHook> {
        self.entries.get(&id).map(|e| e.hook.clone())
    }

    /// Apply a release from the peer. Subtracts `count` introductions and
    /// drops the entry when it reaches zero. Unknown IDs and stale releases
    /// are ignored; partial releases summing to the total are equivalent to
    /// one big one.
    pub fn release(&self, id: ExportId, count: u32) -> bool {
        let (remove, identity) = match self.entries.get(&id) {
            None => {
                trace!(%id, "release for unknown export ignored");
                return false;
            }
            Some(entry) => {
                let mut current = entry.introductions.load(Ordering::SeqCst);
                loop {
                    let next = current.saturating_sub(count);
                    match entry.introductions.compare_exchange(
                        current,
                        next,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break (next == 0, entry.identity),
                        Err(actual) => current = actual,
                    }
                }
            }
        };
        if remove {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.by_identity.remove(&identity);
                entry.hook.dispose();
            }
            true
        } else {
            false
        }
    }

    pub fn introductions(&self, id: ExportId) -> Option<u32> {
        self.entries
            .get(&id)
            .map(|e| e.introductions.load(Ordering::SeqCst))
    }

    pub fn contains(&self, id: ExportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Dispose every export (abort/shutdown).
    pub fn clear_all(&self) {
        let ids: Vec<ExportId> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.by_identity.remove(&entry.identity);
                entry.hook.dispose();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(i64, u32)> {
        self.entries
            .iter()
            .map(|e| (e.key().0, e.introductions.load(Ordering::SeqCst)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_refcount_release_reports_introductions() {
        let table = ImportTable::new();
        table.register_push(ImportId(1)).unwrap();
        table.add_ref(ImportId(1)).unwrap();

        assert_eq!(table.release_local(ImportId(1)), None);
        assert_eq!(table.release_local(ImportId(1)), Some(1));
        assert!(!table.contains(ImportId(1)));
    }

    #[test]
    fn reannouncement_accumulates_introductions() {
        let table = ImportTable::new();
        table.register_announcement(ImportId(-2));
        table.register_announcement(ImportId(-2));

        // Two handles outstanding; dropping both reports two introductions.
        assert_eq!(table.release_local(ImportId(-2)), None);
        assert_eq!(table.release_local(ImportId(-2)), Some(2));
    }

    #[test]
    fn resolve_unknown_import_is_dropped() {
        let table = ImportTable::new();
        assert!(!table.resolve(ImportId(9), Ok(Value::Null)));
    }

    #[test]
    fn pull_is_marked_once() {
        let table = ImportTable::new();
        table.register_push(ImportId(1)).unwrap();
        assert!(table.mark_pull_requested(ImportId(1)));
        assert!(!table.mark_pull_requested(ImportId(1)));
    }

    #[test]
    fn export_release_requires_full_total() {
        let table = ExportTable::new();
        let hook = StubHook::error(RpcError::internal("placeholder"));
        table.register_push(ExportId(1), hook).unwrap();

        // A second announcement of the same entry.
        if let Some(entry) = table.entries.get(&ExportId(1)) {
            entry.introductions.fetch_add(1, Ordering::SeqCst);
        }

        assert!(!table.release(ExportId(1), 1));
        assert!(table.contains(ExportId(1)));
        assert!(table.release(ExportId(1), 1));
        assert!(!table.contains(ExportId(1)));
    }

    #[test]
    fn announce_reuses_identity() {
        let table = ExportTable::new();
        let hook = StubHook::error(RpcError::internal("same cap"));
        let mut next = -1;
        let mut alloc = || {
            let id = ExportId(next);
            next -= 1;
            id
        };

        let (first, minted) = table.announce(&hook, &mut alloc);
        assert!(minted);
        let (second, minted_again) = table.announce(&hook, &mut alloc);
        assert!(!minted_again);
        assert_eq!(first, second);
        assert_eq!(table.introductions(first), Some(2));
    }
}
