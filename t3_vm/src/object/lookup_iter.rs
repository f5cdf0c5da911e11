//! Iterator over a lookup table.
//!
//! The cursor is a 1-based slot index into the table, 0 meaning "before the
//! first entry". Ordinary iterators run over a private copy of the table;
//! live iterators run over the table itself and see later changes.

use t3_format::{DataStream, Result, VmError};

use crate::fixup::ObjFixup;
use crate::object::lookup::LookupTable;
use crate::undo::{UndoRecord, UndoKey, UndoRecorder};
use crate::value::{ObjId, Value};

/// Undo for the cursor has been saved since the last savepoint.
const FLAG_UNDO: u16 = 0x0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupIter {
    coll: Value,
    index: u16,
    flags: u16,
}

impl LookupIter {
    pub fn new(coll: ObjId) -> Self {
        Self {
            coll: Value::Obj(coll),
            index: 0,
            flags: 0,
        }
    }

    /// The table being iterated, if it is still an object reference.
    pub fn collection(&self) -> Option<ObjId> {
        self.coll.as_obj()
    }

    pub fn index(&self) -> usize {
        usize::from(self.index)
    }

    /// Index of the next entry after the cursor, or `None` at the end.
    pub fn next_index(&self, table: &LookupTable) -> Option<usize> {
        match table.find_first_valid_entry(self.index() + 1) {
            0 => None,
            idx => Some(idx),
        }
    }

    pub fn is_next_avail(&self, table: &LookupTable) -> bool {
        self.next_index(table).is_some()
    }

    /// Key and value under the cursor. Fails when the cursor is before the
    /// first entry, past the end, or on a slot emptied since it got there.
    pub fn current(&self, table: &LookupTable) -> Result<(Value, Value)> {
        if self.index == 0 || self.index() > table.capacity() {
            return Err(VmError::OutOfRange);
        }
        table.entry_at(self.index()).ok_or(VmError::OutOfRange)
    }

    /// Move the cursor, saving the old position for undo once per
    /// savepoint.
    pub fn set_index(&mut self, idx: usize, undo: &mut UndoRecorder<'_>) {
        if self.flags & FLAG_UNDO == 0 && undo.add_int_key(u32::from(self.index), Value::Nil) {
            self.flags |= FLAG_UNDO;
        }
        self.index = idx as u16;
    }

    pub fn notify_new_savept(&mut self) {
        self.flags &= !FLAG_UNDO;
    }

    pub fn apply_undo(&mut self, rec: &UndoRecord) {
        if let UndoKey::Int(old) = rec.key {
            self.index = old as u16;
        }
    }

    pub fn mark_refs(&self, out: &mut Vec<ObjId>) {
        out.extend(self.coll.as_obj());
    }

    pub fn save_to_file<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        self.coll.write_to(fp)?;
        fp.write_uint2(self.index)?;
        fp.write_uint2(self.flags)
    }

    pub fn load<S: DataStream + ?Sized>(fp: &mut S, fixup: Option<&ObjFixup>) -> Result<Self> {
        let mut coll = Value::read_from(fp)?;
        if let Some(fixup) = fixup {
            coll = fixup.fix_value(coll);
        }
        let index = fp.read_uint2()?;
        let flags = fp.read_uint2()?;
        Ok(Self { coll, index, flags })
    }
}
