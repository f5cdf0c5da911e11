//! Lookup table and iterator operations on a [`Vm`].
//!
//! Tables are addressed by object id. Mutations go through the undo
//! journal so they can be rolled back to the last savepoint.

use t3_format::{Result, VmError};

use crate::object::{LookupIter, LookupTable, VmObject};
use crate::undo::UndoRecorder;
use crate::value::{ObjId, Value};
use crate::vm::Vm;

impl Vm {
    fn add_table(&mut self, table: LookupTable) -> ObjId {
        self.maybe_gc();
        self.objects.create(VmObject::LookupTable(table))
    }

    pub fn new_lookup_table(&mut self, bucket_cnt: usize, capacity: usize) -> Result<ObjId> {
        let table = LookupTable::new(bucket_cnt, capacity, false)?;
        Ok(self.add_table(table))
    }

    pub fn new_weak_lookup_table(&mut self, bucket_cnt: usize, capacity: usize) -> Result<ObjId> {
        let table = LookupTable::new(bucket_cnt, capacity, true)?;
        Ok(self.add_table(table))
    }

    /// Construct from VM arguments: none, or `(bucket_count, capacity)`.
    pub fn new_lookup_table_from_args(&mut self, args: &[Value]) -> Result<ObjId> {
        let table = LookupTable::from_args(args, self.table_defaults(), false)?;
        Ok(self.add_table(table))
    }

    pub fn new_weak_lookup_table_from_args(&mut self, args: &[Value]) -> Result<ObjId> {
        let table = LookupTable::from_args(args, self.table_defaults(), true)?;
        Ok(self.add_table(table))
    }

    fn table_defaults(&self) -> (usize, usize) {
        (
            self.config().default_bucket_count,
            self.config().default_capacity,
        )
    }

    pub fn lookup_table(&self, table: ObjId) -> Result<&LookupTable> {
        self.objects.lookup_table(table)
    }

    pub fn index_val(&self, table: ObjId, key: &Value) -> Result<Value> {
        Ok(self.objects.lookup_table(table)?.index_val(key, &self.objects))
    }

    pub fn key_present(&self, table: ObjId, key: &Value) -> Result<bool> {
        Ok(self.objects.lookup_table(table)?.key_present(key, &self.objects))
    }

    pub fn count_entries(&self, table: ObjId) -> Result<usize> {
        Ok(self.objects.lookup_table(table)?.count_entries())
    }

    pub fn count_buckets(&self, table: ObjId) -> Result<usize> {
        Ok(self.objects.lookup_table(table)?.count_buckets())
    }

    pub fn set_index_val(&mut self, table: ObjId, key: Value, val: Value) -> Result<()> {
        let tracked = self.objects.is_obj_in_undo(table);
        let undo = &mut self.undo;
        self.objects.with_table_mut(table, |t, objs| {
            let mut rec = UndoRecorder::new(undo, table, tracked);
            t.set_index_val(key, val, objs, &mut rec)
        })
    }

    /// Remove `key`, returning its value, or nil when it was absent.
    pub fn remove_entry(&mut self, table: ObjId, key: &Value) -> Result<Value> {
        let tracked = self.objects.is_obj_in_undo(table);
        let undo = &mut self.undo;
        self.objects.with_table_mut(table, |t, objs| {
            let mut rec = UndoRecorder::new(undo, table, tracked);
            Ok(t.remove_entry(key, objs, &mut rec))
        })
    }

    pub fn for_each(&self, table: ObjId, f: impl FnMut(&Value)) -> Result<()> {
        self.objects.lookup_table(table)?.for_each(f);
        Ok(())
    }

    pub fn for_each_assoc(&self, table: ObjId, f: impl FnMut(&Value, &Value)) -> Result<()> {
        self.objects.lookup_table(table)?.for_each_assoc(f);
        Ok(())
    }

    /// Replace every value with `f(value)`.
    pub fn apply_all(&mut self, table: ObjId, f: impl FnMut(&Value) -> Value) -> Result<()> {
        let tracked = self.objects.is_obj_in_undo(table);
        let undo = &mut self.undo;
        self.objects.with_table_mut(table, |t, _| {
            let mut rec = UndoRecorder::new(undo, table, tracked);
            t.apply_all(&mut rec, f);
            Ok(())
        })
    }

    pub fn keys_to_list(&self, table: ObjId) -> Result<Vec<Value>> {
        Ok(self.objects.lookup_table(table)?.keys_to_list())
    }

    pub fn vals_to_list(&self, table: ObjId) -> Result<Vec<Value>> {
        Ok(self.objects.lookup_table(table)?.vals_to_list())
    }

    /// Iterator over a snapshot of `table`. Later changes to the table are
    /// not seen.
    pub fn new_iterator(&mut self, table: ObjId) -> Result<ObjId> {
        let copy = self.objects.lookup_table(table)?.create_copy();
        self.maybe_gc();
        let copy = self.objects.create(VmObject::LookupTable(copy));
        Ok(self.objects.create(VmObject::Iterator(LookupIter::new(copy))))
    }

    /// Iterator over `table` itself.
    pub fn new_live_iterator(&mut self, table: ObjId) -> Result<ObjId> {
        self.objects.lookup_table(table)?;
        self.maybe_gc();
        Ok(self.objects.create(VmObject::Iterator(LookupIter::new(table))))
    }

    fn iter_and_table(&self, iter: ObjId) -> Result<(&LookupIter, &LookupTable)> {
        let it = self.objects.iterator(iter)?;
        let coll = it.collection().ok_or(VmError::OutOfRange)?;
        Ok((it, self.objects.lookup_table(coll)?))
    }

    fn set_iter_index(&mut self, iter: ObjId, idx: usize) -> Result<()> {
        let tracked = self.objects.is_obj_in_undo(iter);
        let undo = &mut self.undo;
        self.objects.with_iter_mut(iter, |it| {
            let mut rec = UndoRecorder::new(undo, iter, tracked);
            it.set_index(idx, &mut rec);
        })
    }

    /// Advance to the next entry and return its value.
    pub fn iter_get_next(&mut self, iter: ObjId) -> Result<Value> {
        let (it, table) = self.iter_and_table(iter)?;
        let idx = it.next_index(table).ok_or(VmError::OutOfRange)?;
        let (_, val) = table.entry_at(idx).ok_or(VmError::OutOfRange)?;
        self.set_iter_index(iter, idx)?;
        Ok(val)
    }

    pub fn iter_is_next_avail(&self, iter: ObjId) -> Result<bool> {
        let (it, table) = self.iter_and_table(iter)?;
        Ok(it.is_next_avail(table))
    }

    /// Rewind to before the first entry.
    pub fn iter_reset(&mut self, iter: ObjId) -> Result<()> {
        self.objects.iterator(iter)?;
        self.set_iter_index(iter, 0)
    }

    pub fn iter_cur_key(&self, iter: ObjId) -> Result<Value> {
        let (it, table) = self.iter_and_table(iter)?;
        Ok(it.current(table)?.0)
    }

    pub fn iter_cur_val(&self, iter: ObjId) -> Result<Value> {
        let (it, table) = self.iter_and_table(iter)?;
        Ok(it.current(table)?.1)
    }
}
