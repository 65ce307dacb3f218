// SPDX-License-Identifier: MIT OR Apache-2.0

//! The object manager: handles, typed arenas, the association graph, and the generic
//! allocate/associate/disassociate/deallocate protocol every HAL object follows.
//!
//! Objects form a hierarchy (pDevice → vDevice → Session → everything else) and, independently, an
//! undirected association graph. Associating two objects records the link and then calls the
//! associator of each object, lowest [`ObjectKind`] first, so that both sides always see the same
//! ordering. Disassociation runs the other way round.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::fmt::{self, Debug};

use log::{trace, warn};

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

/// Object kinds, in association order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    PDevice,
    VDevice,
    Session,
    SoftwareInjector,
    Buffer,
    Filter,
    Signal,
    Index,
    Slot,
    DataEntry,
    Container,
}

/// Opaque reference to a HAL object.
///
/// A handle stays unique for the lifetime of the object manager: once the object is deallocated,
/// the generation of its arena entry moves on and the handle is rejected with
/// [`Error::InvalidHandle`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pdevice: u8,
    kind: ObjectKind,
    index: u16,
    generation: u32,
}

impl Handle {
    pub(crate) fn new(pdevice: u8, kind: ObjectKind, index: u16, generation: u32) -> Handle {
        Handle {
            pdevice,
            kind,
            index,
            generation,
        }
    }

    /// Index of the pDevice this object lives on.
    pub fn pdevice_index(&self) -> u8 {
        self.pdevice
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Index of the object within the arena of its kind. For vDevices this is also the index of
    /// the firmware `vDeviceInfo` entry.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Checks that the handle refers to an object of the given kind.
    pub fn expect_kind(&self, kind: ObjectKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}#{}.{}@{}",
            self.kind, self.pdevice, self.index, self.generation
        )
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Debug)]
struct ArenaEntry<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked storage for the objects of one kind on one pDevice.
#[derive(Debug)]
pub struct Arena<T> {
    pdevice: u8,
    kind: ObjectKind,
    limit: usize,
    entries: Vec<ArenaEntry<T>>,
}

impl<T> Arena<T> {
    pub fn new(pdevice: u8, kind: ObjectKind, limit: usize) -> Arena<T> {
        Arena {
            pdevice,
            kind,
            limit: limit.min(usize::from(u16::MAX)),
            entries: Vec::new(),
        }
    }

    /// Stores `value` at the lowest free index.
    pub fn insert(&mut self, value: T) -> Result<Handle> {
        let index = match self.entries.iter().position(|e| e.value.is_none()) {
            Some(index) => index,
            None if self.entries.len() < self.limit => {
                self.entries.push(ArenaEntry {
                    generation: 0,
                    value: None,
                });
                self.entries.len() - 1
            }
            None => return Err(Error::NoFreeHandles),
        };

        let entry = &mut self.entries[index];
        entry.generation = entry.generation.wrapping_add(1);
        entry.value = Some(value);

        Ok(Handle::new(
            self.pdevice,
            self.kind,
            index as u16,
            entry.generation,
        ))
    }

    fn entry(&self, handle: Handle) -> Option<&ArenaEntry<T>> {
        if handle.pdevice != self.pdevice || handle.kind != self.kind {
            return None;
        }
        self.entries
            .get(usize::from(handle.index))
            .filter(|e| e.generation == handle.generation)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entry(handle).map_or(false, |e| e.value.is_some())
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.entry(handle)
            .and_then(|e| e.value.as_ref())
            .ok_or(Error::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        if handle.pdevice != self.pdevice || handle.kind != self.kind {
            return Err(Error::InvalidHandle);
        }
        self.entries
            .get_mut(usize::from(handle.index))
            .filter(|e| e.generation == handle.generation)
            .and_then(|e| e.value.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        self.get(handle)?;
        self.entries[usize::from(handle.index)]
            .value
            .take()
            .ok_or(Error::InvalidHandle)
    }

    /// Handles of every live object, in index order.
    pub fn handles(&self) -> Vec<Handle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.value.is_some())
            .map(|(i, e)| Handle::new(self.pdevice, self.kind, i as u16, e.generation))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(move |(i, e)| {
            e.value
                .as_ref()
                .map(|v| (Handle::new(self.pdevice, self.kind, i as u16, e.generation), v))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A fixed-capacity table mapping firmware indexes (slot, DMA, indexer, ...) to handles. New
/// entries always take the lowest free index.
#[derive(Clone, Debug)]
pub struct IndexList {
    items: Vec<Option<Handle>>,
}

impl IndexList {
    pub fn new(capacity: usize) -> IndexList {
        IndexList {
            items: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `handle` at the lowest free index, returning the index.
    pub fn add(&mut self, handle: Handle) -> Result<usize> {
        let index = self
            .items
            .iter()
            .position(|i| i.is_none())
            .ok_or(Error::NoMemory)?;
        self.items[index] = Some(handle);
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(item) = self.items.get_mut(index) {
            *item = None;
        }
    }

    /// Puts `handle` at an index that is already in use, keeping the index.
    pub fn replace(&mut self, index: usize, handle: Handle) {
        if let Some(item @ Some(_)) = self.items.get_mut(index) {
            *item = Some(handle);
        }
    }

    /// Returns the handle at `index`, or `None` for free or out-of-range indexes.
    pub fn get(&self, index: usize) -> Option<Handle> {
        self.items.get(index).copied().flatten()
    }

    /// Changes the capacity. Entries beyond a reduced capacity are dropped.
    pub fn resize(&mut self, capacity: usize) {
        self.items.resize(capacity, None);
    }

    pub fn find(&self, handle: Handle) -> Option<usize> {
        self.items.iter().position(|&i| i == Some(handle))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Handle)> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.map(|h| (i, h)))
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Parent/child relationships and the association graph.
#[derive(Debug, Default)]
pub struct Links {
    associations: HashMap<Handle, Vec<Handle>>,
    parents: HashMap<Handle, Handle>,
    children: HashMap<Handle, Vec<Handle>>,
}

impl Links {
    pub fn add_child(&mut self, parent: Handle, child: Handle) {
        self.parents.insert(child, parent);
        self.children.entry(parent).or_default().push(child);
    }

    pub fn parent(&self, child: Handle) -> Option<Handle> {
        self.parents.get(&child).copied()
    }

    pub fn children(&self, parent: Handle) -> Vec<Handle> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    /// Walks up the hierarchy until an object of the given kind is found.
    pub fn ancestor(&self, handle: Handle, kind: ObjectKind) -> Option<Handle> {
        let mut current = handle;
        while current.kind() != kind {
            current = self.parent(current)?;
        }
        Some(current)
    }

    pub fn is_associated(&self, a: Handle, b: Handle) -> bool {
        self.associations
            .get(&a)
            .map_or(false, |list| list.contains(&b))
    }

    /// Associated objects, in the order they were associated.
    pub fn associated(&self, handle: Handle) -> Vec<Handle> {
        self.associations.get(&handle).cloned().unwrap_or_default()
    }

    pub fn associated_of_kind(&self, handle: Handle, kind: ObjectKind) -> Vec<Handle> {
        self.associations.get(&handle).map_or_else(Vec::new, |list| {
            list.iter().copied().filter(|h| h.kind() == kind).collect()
        })
    }

    pub fn count_associated(&self, handle: Handle, kind: ObjectKind) -> usize {
        self.associations
            .get(&handle)
            .map_or(0, |list| list.iter().filter(|h| h.kind() == kind).count())
    }

    fn link(&mut self, a: Handle, b: Handle) {
        self.associations.entry(a).or_default().push(b);
        self.associations.entry(b).or_default().push(a);
    }

    fn unlink(&mut self, a: Handle, b: Handle) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(list) = self.associations.get_mut(&from) {
                list.retain(|&h| h != to);
                if list.is_empty() {
                    self.associations.remove(&from);
                }
            }
        }
    }

    /// Drops every trace of an object that has been deallocated.
    pub(crate) fn forget(&mut self, handle: Handle) {
        if let Some(parent) = self.parents.remove(&handle) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&h| h != handle);
            }
        }
        self.children.remove(&handle);
        for other in self.associated(handle) {
            self.unlink(handle, other);
        }
        self.associations.remove(&handle);
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The per-kind behaviour the generic protocol calls into.
pub trait ObjectCallbacks {
    fn links(&self) -> &Links;

    fn links_mut(&mut self) -> &mut Links;

    /// Checks that the handle is live.
    fn check_handle(&self, handle: Handle) -> Result<()>;

    /// Called with the link to `other` already recorded.
    fn associator(&mut self, handle: Handle, other: Handle) -> Result<()>;

    fn disassociator(&mut self, handle: Handle, other: Handle) -> Result<()>;

    /// Releases the object's resources and removes it from its arena.
    fn deallocator(&mut self, handle: Handle) -> Result<()>;
}

/// Associates two objects.
pub fn associate<C: ObjectCallbacks + ?Sized>(c: &mut C, a: Handle, b: Handle) -> Result<()> {
    c.check_handle(a)?;
    c.check_handle(b)?;
    if a == b || a.pdevice_index() != b.pdevice_index() {
        return Err(Error::BadParameter);
    }

    let (first, second) = if a.kind() <= b.kind() { (a, b) } else { (b, a) };

    if c.links().is_associated(first, second) || c.links().is_associated(second, first) {
        trace!("Objects already associated [{:?} {:?}]", first, second);
        return Err(Error::ObjectAlreadyAssociated);
    }

    c.links_mut().link(first, second);

    let result = c.associator(first, second).and_then(|()| {
        c.associator(second, first).map_err(|e| {
            // Undo the first half, keeping the original error.
            let _ = c.disassociator(first, second);
            e
        })
    });

    if result.is_err() {
        c.links_mut().unlink(first, second);
    }
    result
}

/// Disassociates two objects, or `a` from everything when `b` is `None`.
pub fn disassociate<C: ObjectCallbacks + ?Sized>(
    c: &mut C,
    a: Handle,
    b: Option<Handle>,
) -> Result<()> {
    c.check_handle(a)?;

    let b = match b {
        Some(b) => b,
        None => {
            for other in c.links().associated(a) {
                disassociate(c, a, Some(other))?;
            }
            return Ok(());
        }
    };

    c.check_handle(b)?;
    let (first, second) = if a.kind() >= b.kind() { (a, b) } else { (b, a) };

    if !c.links().is_associated(first, second) || !c.links().is_associated(second, first) {
        trace!("Objects not associated [{:?} {:?}]", first, second);
        return Err(Error::ObjectsNotAssociated);
    }

    c.disassociator(first, second)?;
    if let Err(e) = c.disassociator(second, first) {
        // Half disassociated: put the first half back so both sides agree.
        c.associator(first, second)?;
        return Err(e);
    }

    c.links_mut().unlink(first, second);
    Ok(())
}

/// Deallocates an object. Without `force` the object must have no associations and no children.
pub fn deallocate<C: ObjectCallbacks + ?Sized>(c: &mut C, handle: Handle, force: bool) -> Result<()> {
    c.check_handle(handle)?;

    if force {
        if let Err(e) = disassociate(c, handle, None) {
            warn!("Ignoring {} while disassociating {:?} for deallocation", e, handle);
        }
    } else if !c.links().associated(handle).is_empty() {
        return Err(Error::DeviceBusy);
    }

    let children = c.links().children(handle);
    if !children.is_empty() && !force {
        return Err(Error::DeviceBusy);
    }

    let mut children_ok = true;
    for child in children {
        if let Err(e) = deallocate(c, child, force) {
            warn!("Failed to deallocate child {:?}: {}", child, e);
            children_ok = false;
        }
    }
    if !children_ok {
        return Err(Error::DeviceBusy);
    }

    c.deallocator(handle)?;
    c.links_mut().forget(handle);
    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Recorder {
        links: Links,
        live: HashSet<Handle>,
        calls: Vec<String>,
        fail_associator_for: Option<ObjectKind>,
        fail_disassociator_for: Option<ObjectKind>,
    }

    impl Recorder {
        fn alloc(&mut self, parent: Option<Handle>, kind: ObjectKind, index: u16) -> Handle {
            let h = Handle::new(0, kind, index, 1);
            self.live.insert(h);
            if let Some(parent) = parent {
                self.links.add_child(parent, h);
            }
            h
        }
    }

    impl ObjectCallbacks for Recorder {
        fn links(&self) -> &Links {
            &self.links
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }

        fn check_handle(&self, handle: Handle) -> Result<()> {
            if self.live.contains(&handle) {
                Ok(())
            } else {
                Err(Error::InvalidHandle)
            }
        }

        fn associator(&mut self, handle: Handle, other: Handle) -> Result<()> {
            self.calls.push(format!("assoc {:?}->{:?}", handle.kind(), other.kind()));
            if self.fail_associator_for == Some(handle.kind()) {
                return Err(Error::InvalidSlotType);
            }
            Ok(())
        }

        fn disassociator(&mut self, handle: Handle, other: Handle) -> Result<()> {
            self.calls.push(format!("disassoc {:?}->{:?}", handle.kind(), other.kind()));
            if self.fail_disassociator_for == Some(handle.kind()) {
                return Err(Error::BadParameter);
            }
            Ok(())
        }

        fn deallocator(&mut self, handle: Handle) -> Result<()> {
            self.calls.push(format!("dealloc {:?}", handle.kind()));
            self.live.remove(&handle);
            Ok(())
        }
    }

    #[test]
    fn test_arena_generations() {
        let mut arena: Arena<&str> = Arena::new(0, ObjectKind::Slot, 2);
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert!(matches!(arena.insert("c"), Err(Error::NoFreeHandles)));

        arena.remove(a).unwrap();
        assert!(matches!(arena.get(a), Err(Error::InvalidHandle)));

        let c = arena.insert("c").unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(*arena.get(c).unwrap(), "c");
        assert_eq!(arena.handles(), vec![c, b]);

        let foreign = Handle::new(1, ObjectKind::Slot, b.index(), b.generation());
        assert!(arena.get(foreign).is_err());
    }

    #[test]
    fn test_index_list_lowest_free() {
        let mut list = IndexList::new(3);
        let h = |i| Handle::new(0, ObjectKind::Buffer, i, 1);
        assert_eq!(list.add(h(0)).unwrap(), 0);
        assert_eq!(list.add(h(1)).unwrap(), 1);
        list.remove(0);
        assert_eq!(list.add(h(2)).unwrap(), 0);
        assert_eq!(list.find(h(1)), Some(1));
        assert_eq!(list.get(7), None);
        list.add(h(3)).unwrap();
        assert!(matches!(list.add(h(4)), Err(Error::NoMemory)));
    }

    #[test]
    fn test_associate_orders_by_kind() {
        let mut r = Recorder::default();
        let slot = r.alloc(None, ObjectKind::Slot, 0);
        let buffer = r.alloc(None, ObjectKind::Buffer, 0);

        associate(&mut r, slot, buffer).unwrap();
        assert_eq!(r.calls, vec!["assoc Buffer->Slot", "assoc Slot->Buffer"]);
        assert!(matches!(
            associate(&mut r, buffer, slot),
            Err(Error::ObjectAlreadyAssociated)
        ));

        r.calls.clear();
        disassociate(&mut r, buffer, Some(slot)).unwrap();
        assert_eq!(r.calls, vec!["disassoc Slot->Buffer", "disassoc Buffer->Slot"]);
        assert!(matches!(
            disassociate(&mut r, buffer, Some(slot)),
            Err(Error::ObjectsNotAssociated)
        ));
    }

    #[test]
    fn test_failed_second_associator_rolls_back() {
        let mut r = Recorder {
            fail_associator_for: Some(ObjectKind::Slot),
            ..Recorder::default()
        };
        let slot = r.alloc(None, ObjectKind::Slot, 0);
        let filter = r.alloc(None, ObjectKind::Filter, 0);

        assert!(matches!(associate(&mut r, slot, filter), Err(Error::InvalidSlotType)));
        assert_eq!(
            r.calls,
            vec!["assoc Filter->Slot", "assoc Slot->Filter", "disassoc Filter->Slot"]
        );
        assert!(!r.links.is_associated(slot, filter));
    }

    #[test]
    fn test_failed_second_disassociator_reassociates() {
        let mut r = Recorder::default();
        let slot = r.alloc(None, ObjectKind::Slot, 0);
        let filter = r.alloc(None, ObjectKind::Filter, 0);
        associate(&mut r, slot, filter).unwrap();

        r.fail_disassociator_for = Some(ObjectKind::Filter);
        r.calls.clear();
        assert!(disassociate(&mut r, filter, Some(slot)).is_err());
        assert_eq!(
            r.calls,
            vec!["disassoc Slot->Filter", "disassoc Filter->Slot", "assoc Slot->Filter"]
        );
        assert!(r.links.is_associated(slot, filter));
    }

    #[test]
    fn test_deallocate_busy_and_forced() {
        let mut r = Recorder::default();
        let vdevice = r.alloc(None, ObjectKind::VDevice, 0);
        let session = r.alloc(Some(vdevice), ObjectKind::Session, 0);
        let slot = r.alloc(Some(session), ObjectKind::Slot, 0);
        let buffer = r.alloc(Some(session), ObjectKind::Buffer, 0);
        associate(&mut r, slot, buffer).unwrap();

        assert!(matches!(deallocate(&mut r, slot, false), Err(Error::DeviceBusy)));
        assert!(matches!(deallocate(&mut r, session, false), Err(Error::DeviceBusy)));

        deallocate(&mut r, vdevice, true).unwrap();
        assert!(r.live.is_empty());
        assert!(r.links.children(vdevice).is_empty());
        assert!(!r.links.is_associated(slot, buffer));
        assert_eq!(r.calls.last().map(String::as_str), Some("dealloc VDevice"));
    }

    #[test]
    fn test_ancestor_lookup() {
        let mut r = Recorder::default();
        let vdevice = r.alloc(None, ObjectKind::VDevice, 3);
        let session = r.alloc(Some(vdevice), ObjectKind::Session, 0);
        let slot = r.alloc(Some(session), ObjectKind::Slot, 0);

        assert_eq!(r.links.ancestor(slot, ObjectKind::VDevice), Some(vdevice));
        assert_eq!(r.links.ancestor(slot, ObjectKind::Slot), Some(slot));
        assert_eq!(r.links.ancestor(vdevice, ObjectKind::Session), None);
    }
}

/* ---------------------------------------------------------------------------------------------- */
