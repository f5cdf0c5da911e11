//! LookupTable and WeakRefLookupTable: chained hash maps from value to
//! value.
//!
//! Entries live in a slot array. Vacant slots have an empty key and are
//! threaded onto a free list; occupied slots are chained from a fixed array
//! of bucket heads. Every traversal visits slots in physical order, so
//! `for_each`, `keys_to_list` and iterators all agree on "storage order".

use t3_format::{DataStream, Result, VmError};

use crate::fixup::ObjFixup;
use crate::undo::{UndoRecord, UndoRecorder};
use crate::value::{ObjId, Value, ValueContext};

/// Largest bucket or slot count the persistent layout can describe.
pub const MAX_TABLE_SIZE: usize = 0xffff;

/// Slots added by each growth step, at minimum.
const GROW_MIN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndoAction {
    /// Neutralised by the garbage collector.
    Null,
    /// The key was inserted; undo deletes it.
    Add,
    /// The key was deleted; undo re-inserts it with the old value.
    Del,
    /// The value was replaced; undo restores the old value.
    Mod,
}

/// Payload of a lookup table undo record.
#[derive(Debug)]
struct LookupUndo {
    action: UndoAction,
    key: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: Value,
    val: Value,
    next: Option<usize>,
}

impl Entry {
    fn vacant(next: Option<usize>) -> Self {
        Self {
            key: Value::Empty,
            val: Value::Empty,
            next,
        }
    }
}

/// Bucket heads, slots and the free list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LookupExt {
    buckets: Vec<Option<usize>>,
    entries: Vec<Entry>,
    first_free: Option<usize>,
}

impl LookupExt {
    fn new(bucket_cnt: usize, value_cnt: usize) -> Self {
        let entries = (0..value_cnt)
            .map(|i| Entry::vacant((i + 1 < value_cnt).then_some(i + 1)))
            .collect();
        Self {
            buckets: vec![None; bucket_cnt],
            entries,
            first_free: (value_cnt > 0).then_some(0),
        }
    }

    /// Copy of this extension with room for more slots. Existing slots
    /// keep their indices; the new ones go onto the free list ahead of
    /// whatever was free before.
    fn expanded(&self) -> Option<Self> {
        let old_cnt = self.entries.len();
        let new_cnt = (old_cnt + old_cnt / 2)
            .max(old_cnt + GROW_MIN)
            .min(MAX_TABLE_SIZE);
        if new_cnt <= old_cnt {
            return None;
        }

        let mut entries = Vec::with_capacity(new_cnt);
        entries.extend_from_slice(&self.entries);
        for i in old_cnt..new_cnt {
            let next = if i + 1 < new_cnt { Some(i + 1) } else { self.first_free };
            entries.push(Entry::vacant(next));
        }
        Some(Self {
            buckets: self.buckets.clone(),
            entries,
            first_free: Some(old_cnt),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTable {
    ext: LookupExt,
    weak: bool,
    /// Set when restored keys were renumbered, so bucket chains must be
    /// rebuilt once every object is back.
    needs_rehash: bool,
}

impl LookupTable {
    /// Both counts must be positive and fit the persistent layout.
    pub fn new(bucket_cnt: usize, capacity: usize, weak: bool) -> Result<Self> {
        if bucket_cnt == 0
            || capacity == 0
            || bucket_cnt > MAX_TABLE_SIZE
            || capacity > MAX_TABLE_SIZE
        {
            return Err(VmError::BadValBif);
        }
        Ok(Self {
            ext: LookupExt::new(bucket_cnt, capacity),
            weak,
            needs_rehash: false,
        })
    }

    /// Construct from VM constructor arguments: none for the defaults, or
    /// a bucket count and an initial capacity.
    pub fn from_args(args: &[Value], defaults: (usize, usize), weak: bool) -> Result<Self> {
        let (bucket_cnt, capacity) = match args {
            [] => defaults,
            [buckets, capacity] => (positive_arg(buckets)?, positive_arg(capacity)?),
            _ => return Err(VmError::WrongNumArgs),
        };
        Self::new(bucket_cnt, capacity, weak)
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn count_buckets(&self) -> usize {
        self.ext.buckets.len()
    }

    /// Number of slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.ext.entries.len()
    }

    pub fn count_entries(&self) -> usize {
        self.occupied().count()
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, &Entry)> + '_ {
        self.ext
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.key.is_empty())
    }

    fn bucket_of<C: ValueContext + ?Sized>(&self, key: &Value, cx: &C) -> usize {
        cx.hash_value(key) as usize % self.ext.buckets.len()
    }

    /// Slot holding `key`, if any.
    fn find_entry<C: ValueContext + ?Sized>(&self, key: &Value, cx: &C) -> Option<usize> {
        let mut cur = self.ext.buckets[self.bucket_of(key, cx)];
        while let Some(idx) = cur {
            let entry = &self.ext.entries[idx];
            if cx.values_equal(&entry.key, key) {
                return Some(idx);
            }
            cur = entry.next;
        }
        None
    }

    /// Insert without checking for an existing entry. Grows the slot array
    /// first if nothing is free.
    pub fn add_entry<C: ValueContext + ?Sized>(
        &mut self,
        key: Value,
        val: Value,
        cx: &C,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(VmError::BadValBif);
        }
        if self.ext.first_free.is_none() {
            let grown = self.ext.expanded().ok_or(VmError::OutOfRange)?;
            log::trace!(
                "lookup table grown from {} to {} slots",
                self.ext.entries.len(),
                grown.entries.len()
            );
            self.ext = grown;
        }
        let Some(idx) = self.ext.first_free else {
            return Err(VmError::OutOfRange);
        };

        let bucket = self.bucket_of(&key, cx);
        let entry = &mut self.ext.entries[idx];
        self.ext.first_free = entry.next;
        *entry = Entry {
            key,
            val,
            next: self.ext.buckets[bucket],
        };
        self.ext.buckets[bucket] = Some(idx);
        Ok(())
    }

    fn unlink_entry<C: ValueContext + ?Sized>(&mut self, idx: usize, cx: &C) {
        let bucket = self.bucket_of(&self.ext.entries[idx].key, cx);
        let next = self.ext.entries[idx].next;

        if self.ext.buckets[bucket] == Some(idx) {
            self.ext.buckets[bucket] = next;
        } else {
            let mut cur = self.ext.buckets[bucket];
            while let Some(prev) = cur {
                if self.ext.entries[prev].next == Some(idx) {
                    self.ext.entries[prev].next = next;
                    break;
                }
                cur = self.ext.entries[prev].next;
            }
        }

        self.ext.entries[idx] = Entry::vacant(self.ext.first_free);
        self.ext.first_free = Some(idx);
    }

    /// Remove `key` if present, without undo.
    pub fn del_entry<C: ValueContext + ?Sized>(&mut self, key: &Value, cx: &C) -> bool {
        match self.find_entry(key, cx) {
            Some(idx) => {
                self.unlink_entry(idx, cx);
                true
            }
            None => false,
        }
    }

    /// Replace the value for `key` if present, without undo.
    pub fn mod_entry<C: ValueContext + ?Sized>(&mut self, key: &Value, val: Value, cx: &C) -> bool {
        match self.find_entry(key, cx) {
            Some(idx) => {
                self.ext.entries[idx].val = val;
                true
            }
            None => false,
        }
    }

    pub fn key_present<C: ValueContext + ?Sized>(&self, key: &Value, cx: &C) -> bool {
        self.find_entry(key, cx).is_some()
    }

    /// Value for `key`, or nil when absent.
    pub fn index_val<C: ValueContext + ?Sized>(&self, key: &Value, cx: &C) -> Value {
        self.find_entry(key, cx)
            .map_or(Value::Nil, |idx| self.ext.entries[idx].val)
    }

    fn record_undo(undo: &mut UndoRecorder<'_>, action: UndoAction, key: Value, old: Value) {
        undo.add_ptr_key(Box::new(LookupUndo { action, key }), old);
    }

    /// Insert or update, recording undo for the change.
    pub fn set_index_val<C: ValueContext + ?Sized>(
        &mut self,
        key: Value,
        val: Value,
        cx: &C,
        undo: &mut UndoRecorder<'_>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(VmError::BadValBif);
        }
        match self.find_entry(&key, cx) {
            Some(idx) => {
                let old = self.ext.entries[idx].val;
                Self::record_undo(undo, UndoAction::Mod, key, old);
                self.ext.entries[idx].val = val;
                Ok(())
            }
            None => {
                self.add_entry(key, val, cx)?;
                Self::record_undo(undo, UndoAction::Add, key, Value::Nil);
                Ok(())
            }
        }
    }

    /// Delete `key`, recording undo. Returns the removed value, or nil.
    pub fn remove_entry<C: ValueContext + ?Sized>(
        &mut self,
        key: &Value,
        cx: &C,
        undo: &mut UndoRecorder<'_>,
    ) -> Value {
        match self.find_entry(key, cx) {
            Some(idx) => {
                let entry = self.ext.entries[idx];
                Self::record_undo(undo, UndoAction::Del, entry.key, entry.val);
                self.unlink_entry(idx, cx);
                entry.val
            }
            None => Value::Nil,
        }
    }

    /// Visit every value in storage order.
    pub fn for_each(&self, mut f: impl FnMut(&Value)) {
        for (_, e) in self.occupied() {
            f(&e.val);
        }
    }

    /// Visit every key/value pair in storage order.
    pub fn for_each_assoc(&self, mut f: impl FnMut(&Value, &Value)) {
        for (_, e) in self.occupied() {
            f(&e.key, &e.val);
        }
    }

    /// Replace every value with `f(value)`, in storage order, recording
    /// undo for each replacement.
    pub fn apply_all(&mut self, undo: &mut UndoRecorder<'_>, mut f: impl FnMut(&Value) -> Value) {
        for idx in 0..self.ext.entries.len() {
            let entry = self.ext.entries[idx];
            if entry.key.is_empty() {
                continue;
            }
            let new_val = f(&entry.val);
            Self::record_undo(undo, UndoAction::Mod, entry.key, entry.val);
            self.ext.entries[idx].val = new_val;
        }
    }

    pub fn keys_to_list(&self) -> Vec<Value> {
        self.occupied().map(|(_, e)| e.key).collect()
    }

    pub fn vals_to_list(&self) -> Vec<Value> {
        self.occupied().map(|(_, e)| e.val).collect()
    }

    /// First occupied slot at or after the 1-based index `idx`, as a
    /// 1-based index; 0 when there is none.
    pub fn find_first_valid_entry(&self, idx: usize) -> usize {
        let start = idx.max(1);
        (start..=self.ext.entries.len())
            .find(|&i| !self.ext.entries[i - 1].key.is_empty())
            .unwrap_or(0)
    }

    /// Key and value at the 1-based index `idx`, if that slot is occupied.
    pub fn entry_at(&self, idx: usize) -> Option<(Value, Value)> {
        if idx == 0 {
            return None;
        }
        self.ext
            .entries
            .get(idx - 1)
            .filter(|e| !e.key.is_empty())
            .map(|e| (e.key, e.val))
    }

    /// Independent plain table with identical slots, chains and free list.
    pub fn create_copy(&self) -> LookupTable {
        LookupTable {
            ext: self.ext.clone(),
            weak: false,
            needs_rehash: false,
        }
    }

    /// Objects this table keeps alive. Weak tables hold their values
    /// weakly.
    pub fn mark_refs(&self, out: &mut Vec<ObjId>) {
        for (_, e) in self.occupied() {
            out.extend(e.key.as_obj());
            if !self.weak {
                out.extend(e.val.as_obj());
            }
        }
    }

    /// Drop every entry whose value is about to be collected.
    pub fn remove_stale_weak_refs<C: ValueContext + ?Sized>(&mut self, cx: &C) -> usize {
        if !self.weak {
            return 0;
        }
        let stale: Vec<usize> = self
            .occupied()
            .filter(|(_, e)| cx.is_value_deletable(&e.val))
            .map(|(idx, _)| idx)
            .collect();
        for &idx in &stale {
            self.unlink_entry(idx, cx);
        }
        stale.len()
    }

    pub fn apply_undo<C: ValueContext + ?Sized>(&mut self, rec: &mut UndoRecord, cx: &C) {
        let Some(payload) = rec.ptr_payload::<LookupUndo>() else {
            return;
        };
        let key = payload.key;
        match payload.action {
            UndoAction::Null => {}
            UndoAction::Add => {
                self.del_entry(&key, cx);
            }
            UndoAction::Del => {
                if let Err(err) = self.add_entry(key, rec.old_val, cx) {
                    log::warn!("could not re-insert entry while undoing: {err}");
                }
            }
            UndoAction::Mod => {
                self.mod_entry(&key, rec.old_val, cx);
            }
        }
    }

    pub fn mark_undo_ref(&self, rec: &UndoRecord, out: &mut Vec<ObjId>) {
        let Some(payload) = rec.ptr_payload::<LookupUndo>() else {
            return;
        };
        out.extend(payload.key.as_obj());
        if !self.weak {
            out.extend(rec.old_val.as_obj());
        }
    }

    /// Turn a record whose old value is about to be collected into a
    /// no-op.
    pub fn remove_stale_undo_weak_ref<C: ValueContext + ?Sized>(
        &self,
        rec: &mut UndoRecord,
        cx: &C,
    ) {
        if !self.weak || !cx.is_value_deletable(&rec.old_val) {
            return;
        }
        rec.old_val = Value::Nil;
        if let Some(payload) = rec.ptr_payload_mut::<LookupUndo>() {
            payload.key = Value::Nil;
            payload.action = UndoAction::Null;
        }
    }

    pub fn save_to_file<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        fp.write_uint2(self.ext.buckets.len() as u16)?;
        fp.write_uint2(self.ext.entries.len() as u16)?;
        fp.write_uint2(to_file_index(self.ext.first_free))?;
        for &head in &self.ext.buckets {
            fp.write_uint2(to_file_index(head))?;
        }
        for entry in &self.ext.entries {
            entry.key.write_to(fp)?;
            entry.val.write_to(fp)?;
            fp.write_uint2(to_file_index(entry.next))?;
        }
        Ok(())
    }

    /// Inverse of [`LookupTable::save_to_file`]. With `fixup`, every key
    /// and value is translated; a translated key means bucket chains must
    /// be rebuilt by [`LookupTable::rehash_if_needed`].
    pub fn load<S: DataStream + ?Sized>(
        fp: &mut S,
        weak: bool,
        fixup: Option<&ObjFixup>,
    ) -> Result<Self> {
        let bucket_cnt = usize::from(fp.read_uint2()?);
        let value_cnt = usize::from(fp.read_uint2()?);
        if bucket_cnt == 0 || value_cnt == 0 {
            return Err(VmError::BadSavedState);
        }
        let first_free = from_file_index(fp.read_uint2()?, value_cnt)?;

        let mut buckets = Vec::with_capacity(bucket_cnt);
        for _ in 0..bucket_cnt {
            buckets.push(from_file_index(fp.read_uint2()?, value_cnt)?);
        }

        let mut needs_rehash = false;
        let mut entries = Vec::with_capacity(value_cnt);
        for _ in 0..value_cnt {
            let mut key = Value::read_from(fp)?;
            let mut val = Value::read_from(fp)?;
            let next = from_file_index(fp.read_uint2()?, value_cnt)?;
            if let Some(fixup) = fixup {
                let fixed = fixup.fix_value(key);
                needs_rehash |= fixed != key;
                if fixed.is_nil() && !key.is_nil() {
                    // The key object was not saved; the slot is vacated
                    // when the chains are rebuilt.
                    key = Value::Empty;
                    val = Value::Empty;
                } else {
                    key = fixed;
                    val = fixup.fix_value(val);
                }
            }
            entries.push(Entry { key, val, next });
        }

        Ok(Self {
            ext: LookupExt {
                buckets,
                entries,
                first_free,
            },
            weak,
            needs_rehash,
        })
    }

    /// Rebuild bucket chains and the free list after keys were renumbered.
    /// Slot positions, and so storage order, do not change.
    pub fn rehash_if_needed<C: ValueContext + ?Sized>(&mut self, cx: &C) {
        if !self.needs_rehash {
            return;
        }
        self.needs_rehash = false;

        for head in &mut self.ext.buckets {
            *head = None;
        }
        let mut free = None;
        for idx in (0..self.ext.entries.len()).rev() {
            let key = self.ext.entries[idx].key;
            if key.is_empty() {
                self.ext.entries[idx] = Entry::vacant(free);
                free = Some(idx);
                continue;
            }
            let bucket = self.bucket_of(&key, cx);
            self.ext.entries[idx].next = self.ext.buckets[bucket];
            self.ext.buckets[bucket] = Some(idx);
        }
        self.ext.first_free = free;
    }
}

fn positive_arg(val: &Value) -> Result<usize> {
    match val.as_int() {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(VmError::BadValBif),
    }
}

fn to_file_index(idx: Option<usize>) -> u16 {
    idx.map_or(0, |i| (i + 1) as u16)
}

fn from_file_index(raw: u16, value_cnt: usize) -> Result<Option<usize>> {
    match usize::from(raw) {
        0 => Ok(None),
        n if n <= value_cnt => Ok(Some(n - 1)),
        _ => Err(VmError::BadSavedState),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::{UndoJournal, UndoKey, UndoTarget};
    use crate::value::ScalarContext;
    use std::io::Cursor;

    const OWNER: ObjId = ObjId(1);

    fn int(n: i32) -> Value {
        Value::Int(n)
    }

    fn table(buckets: usize, capacity: usize) -> LookupTable {
        LookupTable::new(buckets, capacity, false).unwrap()
    }

    /// Undo target holding a single table under `OWNER`.
    struct Host {
        table: LookupTable,
        cx: ScalarContext,
    }

    impl UndoTarget for Host {
        fn notify_new_savept(&mut self) {}

        fn apply_undo(&mut self, rec: &mut UndoRecord) {
            self.table.apply_undo(rec, &self.cx);
        }

        fn mark_undo_ref(&mut self, _rec: &UndoRecord) {}

        fn remove_stale_undo_weak_ref(&mut self, rec: &mut UndoRecord) {
            self.table.remove_stale_undo_weak_ref(rec, &self.cx);
        }

        fn is_obj_deletable(&self, _obj: ObjId) -> bool {
            false
        }
    }

    #[test]
    fn constructor_validates_arguments() {
        assert!(matches!(
            LookupTable::new(0, 4, false),
            Err(VmError::BadValBif)
        ));
        assert!(matches!(
            LookupTable::new(4, 0, false),
            Err(VmError::BadValBif)
        ));
        let defaults = (32, 64);
        let t = LookupTable::from_args(&[], defaults, false).unwrap();
        assert_eq!((t.count_buckets(), t.capacity()), (32, 64));
        let t = LookupTable::from_args(&[int(4), int(2)], defaults, true).unwrap();
        assert_eq!((t.count_buckets(), t.capacity()), (4, 2));
        assert!(t.is_weak());
        assert!(matches!(
            LookupTable::from_args(&[int(4)], defaults, false),
            Err(VmError::WrongNumArgs)
        ));
        assert!(matches!(
            LookupTable::from_args(&[int(4), int(-1)], defaults, false),
            Err(VmError::BadValBif)
        ));
        assert!(matches!(
            LookupTable::from_args(&[int(4), Value::Nil], defaults, false),
            Err(VmError::BadValBif)
        ));
    }

    #[test]
    fn forced_growth_keeps_every_key() {
        let cx = ScalarContext::default();
        let mut t = table(4, 2);
        for n in 0..20 {
            t.add_entry(int(n), int(n * 10), &cx).unwrap();
        }
        // 2 -> 18 -> 34
        assert_eq!(t.capacity(), 34);
        assert_eq!(t.count_entries(), 20);
        for n in 0..20 {
            assert_eq!(t.index_val(&int(n), &cx), int(n * 10));
        }
        let mut keys = t.keys_to_list();
        keys.sort_by_key(|k| k.as_int());
        assert_eq!(keys, (0..20).map(int).collect::<Vec<_>>());
    }

    #[test]
    fn growth_sizes_are_half_again_or_sixteen() {
        let cx = ScalarContext::default();
        let mut t = table(8, 40);
        for n in 0..41 {
            t.add_entry(int(n), Value::True, &cx).unwrap();
        }
        assert_eq!(t.capacity(), 60);
    }

    #[test]
    fn storage_order_follows_free_list() {
        let cx = ScalarContext::default();
        let mut t = table(4, 8);
        for n in [5, 6, 7] {
            t.add_entry(int(n), int(n), &cx).unwrap();
        }
        assert_eq!(t.keys_to_list(), vec![int(5), int(6), int(7)]);

        // The vacated slot goes to the head of the free list and is reused
        // first, so the new key appears where 6 was.
        assert!(t.del_entry(&int(6), &cx));
        t.add_entry(int(9), int(9), &cx).unwrap();
        assert_eq!(t.keys_to_list(), vec![int(5), int(9), int(7)]);
        assert_eq!(t.vals_to_list(), vec![int(5), int(9), int(7)]);
    }

    #[test]
    fn chains_survive_deleting_from_middle() {
        let cx = ScalarContext::default();
        // One bucket puts every key on the same chain.
        let mut t = table(1, 4);
        for n in 1..=4 {
            t.add_entry(int(n), int(n), &cx).unwrap();
        }
        assert!(t.del_entry(&int(2), &cx));
        assert!(t.del_entry(&int(4), &cx));
        assert!(!t.del_entry(&int(4), &cx));
        assert_eq!(t.index_val(&int(1), &cx), int(1));
        assert_eq!(t.index_val(&int(3), &cx), int(3));
        assert_eq!(t.index_val(&int(2), &cx), Value::Nil);
        assert_eq!(t.count_entries(), 2);
    }

    #[test]
    fn empty_key_is_rejected() {
        let cx = ScalarContext::default();
        let mut t = table(2, 2);
        assert!(matches!(
            t.add_entry(Value::Empty, int(1), &cx),
            Err(VmError::BadValBif)
        ));
    }

    #[test]
    fn iteration_helpers_use_one_based_slots() {
        let cx = ScalarContext::default();
        let mut t = table(4, 4);
        t.add_entry(int(10), int(1), &cx).unwrap();
        t.add_entry(int(20), int(2), &cx).unwrap();
        t.add_entry(int(30), int(3), &cx).unwrap();
        t.del_entry(&int(20), &cx);

        assert_eq!(t.find_first_valid_entry(1), 1);
        assert_eq!(t.find_first_valid_entry(2), 3);
        assert_eq!(t.find_first_valid_entry(4), 0);
        assert_eq!(t.entry_at(1), Some((int(10), int(1))));
        assert_eq!(t.entry_at(2), None);
        assert_eq!(t.entry_at(0), None);
        assert_eq!(t.entry_at(9), None);
    }

    #[test]
    fn set_index_val_undo_round_trip() {
        let mut journal = UndoJournal::new(64, 4);
        let mut host = Host {
            table: table(4, 4),
            cx: ScalarContext::default(),
        };
        host.table.add_entry(int(1), int(100), &host.cx).unwrap();
        host.table.add_entry(int(2), int(200), &host.cx).unwrap();
        journal.create_savept(&mut host);

        {
            let mut rec = UndoRecorder::new(&mut journal, OWNER, true);
            host.table
                .set_index_val(int(5), int(500), &host.cx, &mut rec)
                .unwrap();
            host.table
                .set_index_val(int(1), int(111), &host.cx, &mut rec)
                .unwrap();
            assert_eq!(host.table.remove_entry(&int(2), &host.cx, &mut rec), int(200));
            host.table.apply_all(&mut rec, |v| match *v {
                Value::Int(n) => Value::Int(n + 1),
                other => other,
            });
        }
        assert_eq!(host.table.index_val(&int(1), &host.cx), int(112));
        assert_eq!(host.table.index_val(&int(5), &host.cx), int(501));

        journal.undo_to_savept(&mut host);
        assert_eq!(host.table.index_val(&int(5), &host.cx), Value::Nil);
        assert_eq!(host.table.index_val(&int(1), &host.cx), int(100));
        assert_eq!(host.table.index_val(&int(2), &host.cx), int(200));
        assert_eq!(host.table.count_entries(), 2);
    }

    #[test]
    fn untracked_owner_keeps_no_undo() {
        let mut journal = UndoJournal::new(64, 4);
        let mut host = Host {
            table: table(4, 4),
            cx: ScalarContext::default(),
        };
        journal.create_savept(&mut host);
        let mut rec = UndoRecorder::new(&mut journal, OWNER, false);
        host.table
            .set_index_val(int(5), int(500), &host.cx, &mut rec)
            .unwrap();
        assert_eq!(journal.record_count(), 0);
    }

    #[test]
    fn weak_table_marks_keys_only_and_sweeps_values() {
        let dead = ObjId(40);
        let live = ObjId(41);
        let key_obj = ObjId(42);
        let mut cx = ScalarContext::default();
        let mut t = LookupTable::new(4, 4, true).unwrap();
        t.add_entry(int(1), Value::Obj(dead), &cx).unwrap();
        t.add_entry(Value::Obj(key_obj), Value::Obj(live), &cx).unwrap();
        t.add_entry(int(3), Value::Obj(dead), &cx).unwrap();

        let mut refs = Vec::new();
        t.mark_refs(&mut refs);
        assert_eq!(refs, vec![key_obj]);

        cx.doomed.push(dead);
        assert_eq!(t.remove_stale_weak_refs(&cx), 2);
        assert_eq!(t.keys_to_list(), vec![Value::Obj(key_obj)]);
        assert_eq!(t.index_val(&Value::Obj(key_obj), &cx), Value::Obj(live));

        let mut strong = table(4, 4);
        strong.add_entry(int(1), Value::Obj(dead), &cx).unwrap();
        assert_eq!(strong.remove_stale_weak_refs(&cx), 0);
        let mut refs = Vec::new();
        strong.mark_refs(&mut refs);
        assert_eq!(refs, vec![dead]);
    }

    #[test]
    fn neutralised_weak_undo_never_reinstates_dead_value() {
        let dead = ObjId(40);
        let mut journal = UndoJournal::new(64, 4);
        let mut host = Host {
            table: LookupTable::new(4, 4, true).unwrap(),
            cx: ScalarContext::default(),
        };
        host.table.add_entry(int(1), Value::Obj(dead), &host.cx).unwrap();
        journal.create_savept(&mut host);
        {
            let mut rec = UndoRecorder::new(&mut journal, OWNER, true);
            host.table.remove_entry(&int(1), &host.cx, &mut rec);
        }

        host.cx.doomed.push(dead);
        journal.gc_remove_stale_weak_refs(&mut host);
        journal.undo_to_savept(&mut host);
        assert_eq!(host.table.count_entries(), 0);
    }

    #[test]
    fn undo_marking_respects_weakness() {
        let record = UndoRecord {
            obj: OWNER,
            key: UndoKey::Ptr(Box::new(LookupUndo {
                action: UndoAction::Mod,
                key: Value::Obj(ObjId(5)),
            })),
            old_val: Value::Obj(ObjId(6)),
        };

        let mut refs = Vec::new();
        table(2, 2).mark_undo_ref(&record, &mut refs);
        assert_eq!(refs, vec![ObjId(5), ObjId(6)]);

        let mut refs = Vec::new();
        LookupTable::new(2, 2, true)
            .unwrap()
            .mark_undo_ref(&record, &mut refs);
        assert_eq!(refs, vec![ObjId(5)]);
    }

    #[test]
    fn persistent_layout() {
        let cx = ScalarContext::default();
        let mut t = table(2, 2);
        t.add_entry(int(1), int(7), &cx).unwrap();
        let mut cur = Cursor::new(Vec::new());
        t.save_to_file(&mut cur).unwrap();
        let bytes = cur.into_inner();

        // bucket_cnt, value_cnt, first_free (slot 2)
        assert_eq!(&bytes[..6], &[2, 0, 2, 0, 2, 0]);
        // Int(1) hashes to bucket 1, which points at slot 1.
        assert_eq!(&bytes[6..10], &[0, 0, 1, 0]);
        // slot 1: key, value, next = end of chain
        assert_eq!(&bytes[10..15], &Value::Int(1).to_bytes());
        assert_eq!(&bytes[15..20], &Value::Int(7).to_bytes());
        assert_eq!(&bytes[20..22], &[0, 0]);
        // slot 2: vacant, end of free list
        assert_eq!(&bytes[22..27], &Value::Empty.to_bytes());
        assert_eq!(bytes.len(), 6 + 4 + 2 * 12);
    }

    #[test]
    fn save_then_load_restores_identical_table() {
        let cx = ScalarContext::default();
        let mut t = table(4, 2);
        for n in 0..9 {
            t.add_entry(int(n), int(-n), &cx).unwrap();
        }
        t.del_entry(&int(3), &cx);

        let mut cur = Cursor::new(Vec::new());
        t.save_to_file(&mut cur).unwrap();
        cur.set_position(0);
        let loaded = LookupTable::load(&mut cur, false, None).unwrap();
        assert_eq!(loaded, t);
        assert_eq!(loaded.keys_to_list(), t.keys_to_list());
    }

    #[test]
    fn fixed_up_keys_are_rehashed() {
        let cx = ScalarContext::default();
        let mut t = table(8, 4);
        t.add_entry(Value::Obj(ObjId(100)), int(1), &cx).unwrap();
        t.add_entry(Value::Obj(ObjId(101)), int(2), &cx).unwrap();
        t.add_entry(Value::Obj(ObjId(102)), int(3), &cx).unwrap();
        let mut cur = Cursor::new(Vec::new());
        t.save_to_file(&mut cur).unwrap();

        let mut fixup = ObjFixup::new();
        fixup.add(ObjId(100), ObjId(7));
        fixup.add(ObjId(101), ObjId(13));
        fixup.add(ObjId(102), ObjId::INVALID);
        cur.set_position(0);
        let mut loaded = LookupTable::load(&mut cur, false, Some(&fixup)).unwrap();
        loaded.rehash_if_needed(&cx);

        assert_eq!(loaded.index_val(&Value::Obj(ObjId(7)), &cx), int(1));
        assert_eq!(loaded.index_val(&Value::Obj(ObjId(13)), &cx), int(2));
        assert_eq!(loaded.count_entries(), 2);
        assert_eq!(
            loaded.keys_to_list(),
            vec![Value::Obj(ObjId(7)), Value::Obj(ObjId(13))]
        );
    }

    #[test]
    fn corrupt_index_is_rejected() {
        let mut cur = Cursor::new(vec![1, 0, 1, 0, 5, 0]);
        assert!(matches!(
            LookupTable::load(&mut cur, false, None),
            Err(VmError::BadSavedState)
        ));
    }

    #[test]
    fn copy_is_plain_and_independent() {
        let cx = ScalarContext::default();
        let mut t = LookupTable::new(4, 4, true).unwrap();
        t.add_entry(int(1), int(1), &cx).unwrap();
        let copy = t.create_copy();
        t.add_entry(int(2), int(2), &cx).unwrap();
        assert!(!copy.is_weak());
        assert_eq!(copy.count_entries(), 1);
        assert_eq!(copy.keys_to_list(), vec![int(1)]);
    }
}
