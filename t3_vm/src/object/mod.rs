//! Object kinds the persistence layer knows how to save, restore and
//! reset.

pub mod intrinsic;
pub mod lookup;
pub mod lookup_iter;
pub mod string;

use std::io::Cursor;

use t3_format::{DataStream, Result, VmError};

use crate::fixup::ObjFixup;
use crate::undo::UndoRecord;
use crate::value::{ObjId, ValueContext};

pub use intrinsic::IntrinsicClass;
pub use lookup::LookupTable;
pub use lookup_iter::LookupIter;
pub use string::StringObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaclassId {
    String,
    LookupTable,
    WeakRefLookupTable,
    LookupTableIterator,
    IntrinsicClass,
}

impl MetaclassId {
    pub const ALL: [MetaclassId; 5] = [
        MetaclassId::String,
        MetaclassId::LookupTable,
        MetaclassId::WeakRefLookupTable,
        MetaclassId::LookupTableIterator,
        MetaclassId::IntrinsicClass,
    ];

    /// Versioned external name, as written in dependency tables.
    pub fn name(self) -> &'static str {
        match self {
            MetaclassId::String => "string/030008",
            MetaclassId::LookupTable => "lookuptable/030003",
            MetaclassId::WeakRefLookupTable => "weakreflookuptable/030000",
            MetaclassId::LookupTableIterator => "lookuptable-iterator/030000",
            MetaclassId::IntrinsicClass => "intrinsic-class/030001",
        }
    }

    /// Resolve an external name. The version suffix is ignored.
    pub fn from_name(name: &str) -> Option<MetaclassId> {
        let base = name.split('/').next().unwrap_or(name);
        Self::ALL
            .into_iter()
            .find(|m| m.name().split('/').next() == Some(base))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmObject {
    String(StringObject),
    LookupTable(LookupTable),
    Iterator(LookupIter),
    IntrinsicClass(IntrinsicClass),
}

impl VmObject {
    pub fn metaclass(&self) -> MetaclassId {
        match self {
            VmObject::String(_) => MetaclassId::String,
            VmObject::LookupTable(t) if t.is_weak() => MetaclassId::WeakRefLookupTable,
            VmObject::LookupTable(_) => MetaclassId::LookupTable,
            VmObject::Iterator(_) => MetaclassId::LookupTableIterator,
            VmObject::IntrinsicClass(_) => MetaclassId::IntrinsicClass,
        }
    }

    /// Objects this one keeps reachable.
    pub fn mark_refs(&self, out: &mut Vec<ObjId>) {
        match self {
            VmObject::LookupTable(t) => t.mark_refs(out),
            VmObject::Iterator(it) => it.mark_refs(out),
            VmObject::String(_) | VmObject::IntrinsicClass(_) => {}
        }
    }

    pub fn remove_stale_weak_refs<C: ValueContext + ?Sized>(&mut self, cx: &C) {
        if let VmObject::LookupTable(t) = self {
            let removed = t.remove_stale_weak_refs(cx);
            if removed > 0 {
                log::trace!("weak table dropped {removed} stale entries");
            }
        }
    }

    pub fn notify_new_savept(&mut self) {
        if let VmObject::Iterator(it) = self {
            it.notify_new_savept();
        }
    }

    pub fn apply_undo<C: ValueContext + ?Sized>(&mut self, rec: &mut UndoRecord, cx: &C) {
        match self {
            VmObject::LookupTable(t) => t.apply_undo(rec, cx),
            VmObject::Iterator(it) => it.apply_undo(rec),
            VmObject::String(_) | VmObject::IntrinsicClass(_) => {}
        }
    }

    pub fn mark_undo_ref(&self, rec: &UndoRecord, out: &mut Vec<ObjId>) {
        if let VmObject::LookupTable(t) = self {
            t.mark_undo_ref(rec, out);
        }
    }

    pub fn remove_stale_undo_weak_ref<C: ValueContext + ?Sized>(
        &self,
        rec: &mut UndoRecord,
        cx: &C,
    ) {
        if let VmObject::LookupTable(t) = self {
            t.remove_stale_undo_weak_ref(rec, cx);
        }
    }

    /// Work that must wait until every object has been loaded.
    pub fn post_load_init<C: ValueContext + ?Sized>(&mut self, cx: &C) {
        if let VmObject::LookupTable(t) = self {
            t.rehash_if_needed(cx);
        }
    }

    /// None of the built-in kinds expose settable properties.
    pub fn set_prop(&mut self) -> Result<()> {
        Err(VmError::InvalidSetProp)
    }

    pub fn save_to_file<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        match self {
            VmObject::String(s) => s.save_to_file(fp),
            VmObject::LookupTable(t) => t.save_to_file(fp),
            VmObject::Iterator(it) => it.save_to_file(fp),
            VmObject::IntrinsicClass(c) => c.save_to_file(fp),
        }
    }

    /// Read an object of kind `meta` written by [`VmObject::save_to_file`].
    pub fn restore_from_file<S: DataStream + ?Sized>(
        meta: MetaclassId,
        fp: &mut S,
        fixup: Option<&ObjFixup>,
    ) -> Result<VmObject> {
        Ok(match meta {
            MetaclassId::String => VmObject::String(StringObject::load(fp)?),
            MetaclassId::LookupTable => VmObject::LookupTable(LookupTable::load(fp, false, fixup)?),
            MetaclassId::WeakRefLookupTable => {
                VmObject::LookupTable(LookupTable::load(fp, true, fixup)?)
            }
            MetaclassId::LookupTableIterator => VmObject::Iterator(LookupIter::load(fp, fixup)?),
            MetaclassId::IntrinsicClass => VmObject::IntrinsicClass(IntrinsicClass::load(fp)?),
        })
    }

    /// Build an object from its image data, which uses the same layout as
    /// a saved state but needs no id translation.
    pub fn load_from_image(meta: MetaclassId, data: &[u8]) -> Result<VmObject> {
        let mut cur = Cursor::new(data.to_vec());
        Self::restore_from_file(meta, &mut cur, None)
    }

    /// Encode as image data.
    pub fn image_data(&self) -> Result<Vec<u8>> {
        let mut cur = Cursor::new(Vec::new());
        self.save_to_file(&mut cur)?;
        Ok(cur.into_inner())
    }
}
