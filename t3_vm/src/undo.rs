//! Undo journal.
//!
//! A fixed-size circular array of slots. Each savepoint starts with a link
//! slot chaining it to the previous and next savepoints, followed by the
//! change records made while it was current. When the array fills, the
//! oldest savepoint is discarded to make room; when only the current
//! savepoint is left, it is dropped and the caller is told no undo was
//! kept. Running out of room never raises an error.

use std::any::Any;
use std::fmt;
use std::mem;

use crate::value::{ObjId, PropId, Value};

/// Savepoint ids wrap after this value.
pub const SAVEPT_MAX: u8 = 255;

/// What part of the owning object a record restores.
pub enum UndoKey {
    Prop(PropId),
    Int(u32),
    /// Object-specific payload, owned by the record and dropped with it.
    Ptr(Box<dyn Any>),
}

impl fmt::Debug for UndoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoKey::Prop(p) => f.debug_tuple("Prop").field(p).finish(),
            UndoKey::Int(n) => f.debug_tuple("Int").field(n).finish(),
            UndoKey::Ptr(_) => f.write_str("Ptr(..)"),
        }
    }
}

/// "Object `obj` held `old_val` in the slot named by `key`."
#[derive(Debug)]
pub struct UndoRecord {
    /// Invalid once the owner has been collected; such records are skipped.
    pub obj: ObjId,
    pub key: UndoKey,
    pub old_val: Value,
}

impl UndoRecord {
    pub fn ptr_payload<T: 'static>(&self) -> Option<&T> {
        match &self.key {
            UndoKey::Ptr(p) => p.downcast_ref(),
            _ => None,
        }
    }

    pub fn ptr_payload_mut<T: 'static>(&mut self) -> Option<&mut T> {
        match &mut self.key {
            UndoKey::Ptr(p) => p.downcast_mut(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Free,
    Link {
        prev_first: Option<usize>,
        next_first: Option<usize>,
    },
    Record(UndoRecord),
}

/// The object-side half of undo: whatever owns the objects named by
/// records.
pub trait UndoTarget {
    /// A savepoint was created or undone.
    fn notify_new_savept(&mut self);
    /// Restore the state captured in `rec`.
    fn apply_undo(&mut self, rec: &mut UndoRecord);
    /// Mark the values `rec` keeps strongly alive.
    fn mark_undo_ref(&mut self, rec: &UndoRecord);
    /// Neutralise any weakly held value in `rec` that is about to be
    /// collected.
    fn remove_stale_undo_weak_ref(&mut self, rec: &mut UndoRecord);
    fn is_obj_deletable(&self, obj: ObjId) -> bool;
}

#[derive(Debug)]
pub struct UndoJournal {
    slots: Vec<Slot>,
    max_savepts: u32,
    cur_savept: u8,
    savept_cnt: u32,
    /// Link slot of the current savepoint.
    cur_first: Option<usize>,
    /// Link slot of the oldest retained savepoint.
    oldest_first: Option<usize>,
    next_free: usize,
}

impl UndoJournal {
    /// `record_cnt` is clamped to at least two slots: a link and a record.
    pub fn new(record_cnt: usize, max_savepts: u32) -> Self {
        let mut slots = Vec::with_capacity(record_cnt.max(2));
        slots.resize_with(record_cnt.max(2), Slot::default);
        Self {
            slots,
            max_savepts: max_savepts.max(1),
            cur_savept: 0,
            savept_cnt: 0,
            cur_first: None,
            oldest_first: None,
            next_free: 0,
        }
    }

    pub fn cur_savept(&self) -> u8 {
        self.cur_savept
    }

    pub fn savept_count(&self) -> u32 {
        self.savept_cnt
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of change records currently held.
    pub fn record_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Record(_)))
            .count()
    }

    fn inc(&self, idx: usize) -> usize {
        if idx + 1 == self.slots.len() {
            0
        } else {
            idx + 1
        }
    }

    fn dec(&self, idx: usize) -> usize {
        if idx == 0 {
            self.slots.len() - 1
        } else {
            idx - 1
        }
    }

    fn link_next(&self, idx: usize) -> Option<usize> {
        match self.slots[idx] {
            Slot::Link { next_first, .. } => next_first,
            _ => None,
        }
    }

    fn link_prev(&self, idx: usize) -> Option<usize> {
        match self.slots[idx] {
            Slot::Link { prev_first, .. } => prev_first,
            _ => None,
        }
    }

    fn set_link_next(&mut self, idx: usize, next: Option<usize>) {
        if let Slot::Link { next_first, .. } = &mut self.slots[idx] {
            *next_first = next;
        }
    }

    fn set_link_prev(&mut self, idx: usize, prev: Option<usize>) {
        if let Slot::Link { prev_first, .. } = &mut self.slots[idx] {
            *prev_first = prev;
        }
    }

    /// Claim the next free slot, evicting old savepoints if the array is
    /// full. Returns `None` if the current savepoint had to be dropped to
    /// make room.
    fn alloc_slot(&mut self) -> Option<usize> {
        loop {
            if self.savept_cnt == 0 || Some(self.next_free) != self.oldest_first {
                let idx = self.next_free;
                self.next_free = self.inc(idx);
                return Some(idx);
            }

            if self.savept_cnt > 1 {
                self.drop_oldest_savept();
            } else {
                log::warn!("undo journal full, dropping the current savepoint");
                self.drop_oldest_savept();
                return None;
            }
        }
    }

    fn drop_oldest_savept(&mut self) {
        if self.savept_cnt == 0 {
            return;
        }
        self.savept_cnt -= 1;

        if let Some(oldest) = self.oldest_first {
            let stop = self.link_next(oldest);
            self.slots[oldest] = Slot::Free;
            let mut idx = self.inc(oldest);
            while Some(idx) != stop && idx != self.next_free {
                self.slots[idx] = Slot::Free;
                idx = self.inc(idx);
            }

            self.oldest_first = stop;
            if let Some(first) = stop {
                self.set_link_prev(first, None);
            }
        }

        if self.oldest_first.is_none() {
            self.cur_first = None;
        }
    }

    /// Start a new savepoint. Changes recorded from now on are undone
    /// together by the next [`UndoJournal::undo_to_savept`].
    pub fn create_savept<T: UndoTarget + ?Sized>(&mut self, target: &mut T) {
        let Some(idx) = self.alloc_slot() else {
            return;
        };

        if let Some(cur) = self.cur_first {
            self.set_link_next(cur, Some(idx));
        }
        self.slots[idx] = Slot::Link {
            prev_first: self.cur_first,
            next_first: None,
        };
        self.cur_first = Some(idx);
        if self.oldest_first.is_none() {
            self.oldest_first = Some(idx);
        }

        self.cur_savept = if self.cur_savept == SAVEPT_MAX {
            0
        } else {
            self.cur_savept + 1
        };

        if self.savept_cnt == self.max_savepts {
            self.drop_oldest_savept();
        }
        self.savept_cnt += 1;

        target.notify_new_savept();
    }

    fn add_record(&mut self, obj: ObjId, key: UndoKey, old_val: Value) -> bool {
        if self.savept_cnt == 0 {
            return false;
        }
        match self.alloc_slot() {
            Some(idx) => {
                self.slots[idx] = Slot::Record(UndoRecord { obj, key, old_val });
                true
            }
            None => false,
        }
    }

    pub fn add_new_record_prop_key(&mut self, obj: ObjId, prop: PropId, old_val: Value) -> bool {
        self.add_record(obj, UndoKey::Prop(prop), old_val)
    }

    pub fn add_new_record_int_key(&mut self, obj: ObjId, key: u32, old_val: Value) -> bool {
        self.add_record(obj, UndoKey::Int(key), old_val)
    }

    /// Record with an object-specific payload. When `false` is returned the
    /// payload has already been dropped.
    pub fn add_new_record_ptr_key(
        &mut self,
        obj: ObjId,
        payload: Box<dyn Any>,
        old_val: Value,
    ) -> bool {
        self.add_record(obj, UndoKey::Ptr(payload), old_val)
    }

    /// Undo every change recorded since the current savepoint was created,
    /// newest first, then make the previous savepoint current.
    pub fn undo_to_savept<T: UndoTarget + ?Sized>(&mut self, target: &mut T) {
        if self.savept_cnt == 0 {
            return;
        }
        let Some(first) = self.cur_first else {
            return;
        };

        let mut applied = 0usize;
        let mut idx = self.next_free;
        loop {
            idx = self.dec(idx);
            if idx == first {
                break;
            }
            if let Slot::Record(mut rec) = mem::take(&mut self.slots[idx]) {
                if rec.obj.is_valid() {
                    target.apply_undo(&mut rec);
                    applied += 1;
                }
            }
        }

        self.cur_first = self.link_prev(first);
        match self.cur_first {
            Some(prev) => self.set_link_next(prev, None),
            None => self.oldest_first = None,
        }
        self.slots[first] = Slot::Free;
        self.savept_cnt -= 1;
        self.cur_savept = if self.cur_savept == 0 {
            SAVEPT_MAX
        } else {
            self.cur_savept - 1
        };
        self.next_free = first;
        log::debug!("undo applied {applied} records, {} savepoints left", self.savept_cnt);

        target.notify_new_savept();
    }

    /// Forget all undo history without applying any of it.
    pub fn drop_undo(&mut self) {
        while self.savept_cnt != 0 {
            self.drop_oldest_savept();
        }
        for slot in &mut self.slots {
            *slot = Slot::Free;
        }
        self.cur_savept = 0;
        self.cur_first = None;
        self.oldest_first = None;
        self.next_free = 0;
    }

    /// Indices of every live slot from the oldest savepoint to the newest.
    fn live_range(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let Some(start) = self.oldest_first else {
            return out;
        };
        // A full ring has next_free == oldest_first; walk it once.
        let mut idx = start;
        loop {
            out.push(idx);
            idx = self.inc(idx);
            if idx == self.next_free {
                break;
            }
        }
        out
    }

    /// Mark the values that live records keep reachable.
    pub fn gc_mark_refs<T: UndoTarget + ?Sized>(&self, target: &mut T) {
        for idx in self.live_range() {
            if let Slot::Record(rec) = &self.slots[idx] {
                if rec.obj.is_valid() {
                    target.mark_undo_ref(rec);
                }
            }
        }
    }

    /// Drop references to objects that are about to be collected. Records
    /// owned by a doomed object are disabled outright; the others get a
    /// chance to neutralise weakly held values.
    pub fn gc_remove_stale_weak_refs<T: UndoTarget + ?Sized>(&mut self, target: &mut T) {
        for idx in self.live_range() {
            if let Slot::Record(rec) = &mut self.slots[idx] {
                if !rec.obj.is_valid() {
                    continue;
                }
                if target.is_obj_deletable(rec.obj) {
                    rec.obj = ObjId::INVALID;
                } else {
                    target.remove_stale_undo_weak_ref(rec);
                }
            }
        }
    }
}

/// Journal handle bound to one object for the duration of a mutation.
///
/// Objects created since the last savepoint are not tracked: undoing past
/// their creation leaves them unreachable, so their changes are not worth
/// recording.
pub struct UndoRecorder<'a> {
    journal: &'a mut UndoJournal,
    owner: ObjId,
    tracked: bool,
}

impl<'a> UndoRecorder<'a> {
    pub fn new(journal: &'a mut UndoJournal, owner: ObjId, tracked: bool) -> Self {
        Self {
            journal,
            owner,
            tracked,
        }
    }

    pub fn add_int_key(&mut self, key: u32, old_val: Value) -> bool {
        self.tracked && self.journal.add_new_record_int_key(self.owner, key, old_val)
    }

    pub fn add_ptr_key(&mut self, payload: Box<dyn Any>, old_val: Value) -> bool {
        self.tracked && self.journal.add_new_record_ptr_key(self.owner, payload, old_val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Integer-keyed cells standing in for object state.
    #[derive(Default)]
    struct Cells {
        vals: HashMap<(ObjId, u32), Value>,
        notified: usize,
        doomed: HashSet<ObjId>,
        marked: Vec<Value>,
    }

    impl Cells {
        fn set(&mut self, undo: &mut UndoJournal, obj: ObjId, key: u32, val: Value) {
            let old = self.get(obj, key);
            undo.add_new_record_int_key(obj, key, old);
            self.vals.insert((obj, key), val);
        }

        fn get(&self, obj: ObjId, key: u32) -> Value {
            self.vals.get(&(obj, key)).copied().unwrap_or(Value::Nil)
        }
    }

    impl UndoTarget for Cells {
        fn notify_new_savept(&mut self) {
            self.notified += 1;
        }

        fn apply_undo(&mut self, rec: &mut UndoRecord) {
            if let UndoKey::Int(key) = rec.key {
                self.vals.insert((rec.obj, key), rec.old_val);
            }
        }

        fn mark_undo_ref(&mut self, rec: &UndoRecord) {
            self.marked.push(rec.old_val);
        }

        fn remove_stale_undo_weak_ref(&mut self, rec: &mut UndoRecord) {
            if let Value::Obj(id) = rec.old_val {
                if self.doomed.contains(&id) {
                    rec.old_val = Value::Nil;
                }
            }
        }

        fn is_obj_deletable(&self, obj: ObjId) -> bool {
            self.doomed.contains(&obj)
        }
    }

    const A: ObjId = ObjId(1);

    #[test]
    fn records_need_a_savepoint() {
        let mut undo = UndoJournal::new(16, 4);
        assert!(!undo.add_new_record_int_key(A, 0, Value::Nil));
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        assert!(undo.add_new_record_int_key(A, 0, Value::Nil));
        assert_eq!(undo.record_count(), 1);
        assert_eq!(cells.notified, 1);
    }

    #[test]
    fn undo_applies_newest_first_and_only_once() {
        let mut undo = UndoJournal::new(32, 8);
        let mut cells = Cells::default();
        cells.vals.insert((A, 0), Value::Int(1));

        undo.create_savept(&mut cells);
        cells.set(&mut undo, A, 0, Value::Int(2));
        undo.create_savept(&mut cells);
        cells.set(&mut undo, A, 0, Value::Int(3));
        cells.set(&mut undo, A, 0, Value::Int(4));

        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(2));
        assert_eq!(undo.savept_count(), 1);

        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(1));
        assert_eq!(undo.savept_count(), 0);

        // Nothing left; a further undo is a no-op.
        cells.vals.insert((A, 0), Value::Int(9));
        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(9));
    }

    #[test]
    fn savepoint_ceiling_evicts_oldest() {
        let mut undo = UndoJournal::new(64, 2);
        let mut cells = Cells::default();
        for n in 0..3 {
            undo.create_savept(&mut cells);
            cells.set(&mut undo, A, 0, Value::Int(n));
        }
        assert_eq!(undo.savept_count(), 2);
        assert_eq!(undo.record_count(), 2);

        undo.undo_to_savept(&mut cells);
        undo.undo_to_savept(&mut cells);
        // The first change was evicted, so the value set by it stays.
        assert_eq!(cells.get(A, 0), Value::Int(0));
    }

    #[test]
    fn full_array_evicts_oldest_savepoint() {
        let mut undo = UndoJournal::new(6, 8);
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        cells.set(&mut undo, A, 0, Value::Int(1));
        cells.set(&mut undo, A, 1, Value::Int(1));
        undo.create_savept(&mut cells);
        cells.set(&mut undo, A, 2, Value::Int(1));
        cells.set(&mut undo, A, 3, Value::Int(1));
        // Array of six is now full; this evicts the first savepoint.
        assert!(undo.add_new_record_int_key(A, 4, Value::Nil));
        assert_eq!(undo.savept_count(), 1);
    }

    #[test]
    fn full_array_with_one_savepoint_keeps_no_undo() {
        let mut undo = UndoJournal::new(3, 8);
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        assert!(undo.add_new_record_int_key(A, 0, Value::Nil));
        assert!(undo.add_new_record_int_key(A, 1, Value::Nil));
        assert!(!undo.add_new_record_int_key(A, 2, Value::Nil));
        assert_eq!(undo.savept_count(), 0);
        assert!(!undo.add_new_record_int_key(A, 3, Value::Nil));
    }

    #[test]
    fn ring_wraps_across_many_savepoints() {
        let mut undo = UndoJournal::new(8, 3);
        let mut cells = Cells::default();
        for n in 0..50 {
            undo.create_savept(&mut cells);
            cells.set(&mut undo, A, 0, Value::Int(n));
        }
        assert_eq!(undo.savept_count(), 3);
        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(48));
        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(47));
    }

    #[test]
    fn ptr_payload_is_dropped_when_not_kept() {
        use std::rc::Rc;

        let marker = Rc::new(());
        let mut undo = UndoJournal::new(4, 2);
        assert!(!undo.add_new_record_ptr_key(A, Box::new(marker.clone()), Value::Nil));
        assert_eq!(Rc::strong_count(&marker), 1);

        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        assert!(undo.add_new_record_ptr_key(A, Box::new(marker.clone()), Value::Nil));
        assert_eq!(Rc::strong_count(&marker), 2);
        undo.drop_undo();
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn drop_undo_discards_without_applying() {
        let mut undo = UndoJournal::new(16, 4);
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        cells.set(&mut undo, A, 0, Value::Int(5));
        undo.drop_undo();
        assert_eq!(undo.savept_count(), 0);
        assert_eq!(undo.cur_savept(), 0);
        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Int(5));
    }

    #[test]
    fn gc_hooks_skip_links_and_disable_doomed_owners() {
        let b = ObjId(2);
        let doomed_val = ObjId(40);
        let mut undo = UndoJournal::new(16, 4);
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        undo.add_new_record_int_key(A, 0, Value::Obj(doomed_val));
        undo.create_savept(&mut cells);
        undo.add_new_record_int_key(b, 0, Value::Int(7));

        undo.gc_mark_refs(&mut cells);
        assert_eq!(cells.marked, vec![Value::Obj(doomed_val), Value::Int(7)]);

        cells.doomed.insert(b);
        cells.doomed.insert(doomed_val);
        undo.gc_remove_stale_weak_refs(&mut cells);

        cells.vals.insert((b, 0), Value::Int(99));
        cells.vals.insert((A, 0), Value::Int(99));
        undo.undo_to_savept(&mut cells);
        // b's record was disabled.
        assert_eq!(cells.get(b, 0), Value::Int(99));
        undo.undo_to_savept(&mut cells);
        // A's record survived with its weak value cleared.
        assert_eq!(cells.get(A, 0), Value::Nil);
    }

    #[test]
    fn gc_hooks_visit_every_record_of_a_full_ring() {
        let doomed_val = ObjId(40);
        let mut undo = UndoJournal::new(4, 4);
        let mut cells = Cells::default();
        undo.create_savept(&mut cells);
        undo.add_new_record_int_key(A, 0, Value::Obj(doomed_val));
        undo.add_new_record_int_key(A, 1, Value::Int(1));
        undo.add_new_record_int_key(A, 2, Value::Int(2));
        assert_eq!(undo.record_count(), 3);

        undo.gc_mark_refs(&mut cells);
        assert_eq!(
            cells.marked,
            vec![Value::Obj(doomed_val), Value::Int(1), Value::Int(2)]
        );

        cells.doomed.insert(doomed_val);
        undo.gc_remove_stale_weak_refs(&mut cells);
        cells.vals.insert((A, 0), Value::Int(99));
        undo.undo_to_savept(&mut cells);
        assert_eq!(cells.get(A, 0), Value::Nil);
        assert_eq!(cells.get(A, 2), Value::Int(2));
    }
}
