//! Object table: id allocation, garbage collection and the object section
//! of a saved state.
//!
//! Saved layout:
//!
//! ```text
//! metaclass dependency table
//! u32 toc count, then per object { u32 id, u32 flags }
//! u32 object count, then per object { u32 id, u8 root, u8 dep index, data }
//! ```
//!
//! The table of contents lists every non-root object reachable from the
//! root set, including transient ones, so references to them can be
//! translated on restore. Only non-transient objects carry data.

use t3_format::{DataStream, Result, VmError};

use crate::fixup::ObjFixup;
use crate::image::ImageObject;
use crate::metatab::MetaTable;
use crate::object::{LookupIter, LookupTable, VmObject};
use crate::undo::{UndoJournal, UndoRecord, UndoTarget};
use crate::value::{ObjId, Value, ValueContext};

const TOC_FLAG_TRANSIENT: u32 = 0x0001;

#[derive(Debug)]
struct ObjEntry {
    /// `None` while the object is lent out by `with_object_mut`, or while
    /// its id is reserved during a restore.
    obj: Option<VmObject>,
    in_root_set: bool,
    transient: bool,
    /// A savepoint has been created since the object was.
    in_undo: bool,
    marked: bool,
}

impl ObjEntry {
    fn new(obj: Option<VmObject>, in_root_set: bool, transient: bool) -> Self {
        Self {
            obj,
            in_root_set,
            transient,
            in_undo: false,
            marked: false,
        }
    }
}

#[derive(Debug)]
pub struct ObjectTable {
    entries: Vec<Option<ObjEntry>>,
    free_ids: Vec<u32>,
    image_objects: Vec<ImageObject>,
    gc_enabled: bool,
    gc_threshold: usize,
    allocs_since_gc: usize,
    gc_work: Vec<ObjId>,
    /// Marks are meaningful only while a collection is running.
    collecting: bool,
}

impl ObjectTable {
    /// `gc_threshold` allocations between automatic collections; 0 turns
    /// automatic collection off.
    pub fn new(gc_threshold: usize) -> Self {
        Self {
            entries: vec![None],
            free_ids: Vec::new(),
            image_objects: Vec::new(),
            gc_enabled: true,
            gc_threshold,
            allocs_since_gc: 0,
            gc_work: Vec::new(),
            collecting: false,
        }
    }

    fn entry(&self, id: ObjId) -> Option<&ObjEntry> {
        self.entries.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, id: ObjId) -> Option<&mut ObjEntry> {
        self.entries.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    fn live_ids(&self) -> Vec<ObjId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| ObjId(i as u32))
            .collect()
    }

    pub fn object(&self, id: ObjId) -> Option<&VmObject> {
        self.entry(id).and_then(|e| e.obj.as_ref())
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.object(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_root(&self, id: ObjId) -> bool {
        self.entry(id).is_some_and(|e| e.in_root_set)
    }

    pub fn is_obj_in_undo(&self, id: ObjId) -> bool {
        self.entry(id).is_some_and(|e| e.in_undo)
    }

    pub fn string_text(&self, id: ObjId) -> Option<&str> {
        match self.object(id)? {
            VmObject::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn lookup_table(&self, id: ObjId) -> Result<&LookupTable> {
        match self.object(id) {
            Some(VmObject::LookupTable(t)) => Ok(t),
            _ => Err(VmError::WrongObjectType {
                id: id.0,
                expected: "lookup table",
            }),
        }
    }

    pub fn iterator(&self, id: ObjId) -> Result<&LookupIter> {
        match self.object(id) {
            Some(VmObject::Iterator(it)) => Ok(it),
            _ => Err(VmError::WrongObjectType {
                id: id.0,
                expected: "lookup table iterator",
            }),
        }
    }

    /// Reserve a fresh id with no object behind it yet.
    pub(crate) fn alloc_id(&mut self) -> ObjId {
        let id = match self.free_ids.pop() {
            Some(id) => id as usize,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.entries[id] = Some(ObjEntry::new(None, false, false));
        self.allocs_since_gc += 1;
        ObjId(id as u32)
    }

    /// Add a dynamic object.
    pub(crate) fn create(&mut self, obj: VmObject) -> ObjId {
        let id = self.alloc_id();
        if let Some(entry) = self.entry_mut(id) {
            entry.obj = Some(obj);
        }
        id
    }

    /// Add an object at a fixed id, as when loading an image.
    pub(crate) fn insert_at(
        &mut self,
        id: ObjId,
        obj: VmObject,
        in_root_set: bool,
        transient: bool,
    ) {
        let idx = id.0 as usize;
        if idx >= self.entries.len() {
            let old_len = self.entries.len();
            self.entries.resize_with(idx + 1, || None);
            self.free_ids.extend((old_len..idx).map(|i| i as u32).rev());
        }
        self.free_ids.retain(|&free| free as usize != idx);
        self.entries[idx] = Some(ObjEntry::new(Some(obj), in_root_set, transient));
    }

    pub(crate) fn set_transient(&mut self, id: ObjId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.transient = true;
        }
    }

    fn delete(&mut self, id: ObjId) {
        if let Some(slot) = self.entries.get_mut(id.0 as usize) {
            if slot.take().is_some() {
                self.free_ids.push(id.0);
            }
        }
    }

    /// Run `f` on object `id` with shared access to the rest of the table.
    /// While `f` runs, `id` itself reads as absent.
    pub(crate) fn with_object_mut<R>(
        &mut self,
        id: ObjId,
        f: impl FnOnce(&mut VmObject, &ObjectTable) -> R,
    ) -> Option<R> {
        let mut obj = self.entry_mut(id)?.obj.take()?;
        let result = f(&mut obj, self);
        if let Some(entry) = self.entry_mut(id) {
            entry.obj = Some(obj);
        }
        Some(result)
    }

    pub(crate) fn with_table_mut<R>(
        &mut self,
        id: ObjId,
        f: impl FnOnce(&mut LookupTable, &ObjectTable) -> Result<R>,
    ) -> Result<R> {
        let wrong_type = VmError::WrongObjectType {
            id: id.0,
            expected: "lookup table",
        };
        self.with_object_mut(id, |obj, objs| match obj {
            VmObject::LookupTable(t) => f(t, objs),
            _ => Err(wrong_type),
        })
        .unwrap_or_else(|| {
            Err(VmError::WrongObjectType {
                id: id.0,
                expected: "lookup table",
            })
        })
    }

    pub(crate) fn with_iter_mut<R>(
        &mut self,
        id: ObjId,
        f: impl FnOnce(&mut LookupIter) -> R,
    ) -> Result<R> {
        match self.entry_mut(id).and_then(|e| e.obj.as_mut()) {
            Some(VmObject::Iterator(it)) => Ok(f(it)),
            _ => Err(VmError::WrongObjectType {
                id: id.0,
                expected: "lookup table iterator",
            }),
        }
    }

    /// Turn automatic collection on or off, returning the previous setting.
    pub fn enable_gc(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.gc_enabled, enabled)
    }

    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    /// Enough allocations have happened that an automatic collection is
    /// due.
    pub(crate) fn gc_due(&self) -> bool {
        self.gc_enabled && self.gc_threshold > 0 && self.allocs_since_gc >= self.gc_threshold
    }

    fn clear_marks(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.marked = false;
        }
    }

    fn mark(&mut self, id: ObjId) {
        if let Some(entry) = self.entry_mut(id) {
            if !entry.marked {
                entry.marked = true;
                self.gc_work.push(id);
            }
        }
    }

    fn mark_root_set(&mut self) {
        for id in self.live_ids() {
            if self.is_root(id) {
                self.mark(id);
            }
        }
    }

    fn trace(&mut self) {
        let mut refs = Vec::new();
        while let Some(id) = self.gc_work.pop() {
            refs.clear();
            if let Some(obj) = self.object(id) {
                obj.mark_refs(&mut refs);
            }
            for &r in &refs {
                self.mark(r);
            }
        }
    }

    /// Collect every dynamic object not reachable from the root set,
    /// `roots`, or the undo journal. Weakly held references to collected
    /// objects are cleared first.
    pub(crate) fn gc_full(&mut self, roots: &[ObjId], undo: &mut UndoJournal) {
        self.collecting = true;
        self.clear_marks();
        self.mark_root_set();
        for &id in roots {
            self.mark(id);
        }
        undo.gc_mark_refs(self);
        self.trace();

        let ids = self.live_ids();
        for &id in &ids {
            if self.entry(id).is_some_and(|e| e.marked) {
                self.with_object_mut(id, |obj, objs| obj.remove_stale_weak_refs(objs));
            }
        }
        undo.gc_remove_stale_weak_refs(self);

        let mut deleted = 0usize;
        for id in ids {
            if self.is_obj_deletable(id) {
                self.delete(id);
                deleted += 1;
            }
        }

        self.collecting = false;
        self.allocs_since_gc = 0;
        log::debug!("gc: deleted {deleted} objects, {} remain", self.len());
    }

    /// Write the object section. Only objects reachable from the root set
    /// or `roots` are written.
    pub(crate) fn save<S: DataStream + ?Sized>(
        &mut self,
        fp: &mut S,
        roots: &[ObjId],
    ) -> Result<()> {
        self.clear_marks();
        self.mark_root_set();
        for &id in roots {
            self.mark(id);
        }
        self.trace();

        let reachable: Vec<ObjId> = self
            .live_ids()
            .into_iter()
            .filter(|&id| self.entry(id).is_some_and(|e| e.marked))
            .collect();

        MetaTable::write_dep_table(fp)?;

        let toc: Vec<(ObjId, bool)> = reachable
            .iter()
            .filter_map(|&id| {
                let e = self.entry(id)?;
                (!e.in_root_set).then_some((id, e.transient))
            })
            .collect();
        fp.write_uint4(toc.len() as u32)?;
        for &(id, transient) in &toc {
            fp.write_uint4(id.0)?;
            fp.write_uint4(if transient { TOC_FLAG_TRANSIENT } else { 0 })?;
        }

        let saveable: Vec<(ObjId, bool, &VmObject)> = reachable
            .iter()
            .filter_map(|&id| {
                let e = self.entry(id)?;
                if e.transient {
                    return None;
                }
                Some((id, e.in_root_set, e.obj.as_ref()?))
            })
            .collect();
        fp.write_uint4(saveable.len() as u32)?;
        for &(id, root, obj) in &saveable {
            fp.write_uint4(id.0)?;
            fp.write_uint1(u8::from(root))?;
            fp.write_uint1(MetaTable::dep_index(obj.metaclass()))?;
            obj.save_to_file(fp)?;
            log::trace!("saved object {id} ({})", obj.metaclass().name());
        }
        log::debug!(
            "object table saved: {} objects, {} in table of contents",
            saveable.len(),
            toc.len()
        );

        self.clear_marks();
        Ok(())
    }

    /// Read the object section written by [`ObjectTable::save`] on top of
    /// a fresh image state. Returns the id translations applied.
    pub(crate) fn restore<S: DataStream + ?Sized>(
        &mut self,
        fp: &mut S,
        undo: &mut UndoJournal,
        meta: &mut MetaTable,
    ) -> Result<ObjFixup> {
        let deps = MetaTable::read_dep_table(fp)?;
        self.reset_to_image(undo, meta)?;

        let toc_cnt = fp.read_uint4()?;
        let mut fixup = ObjFixup::new();
        for _ in 0..toc_cnt {
            let old = ObjId(fp.read_uint4()?);
            let flags = fp.read_uint4()?;
            let new = if flags & TOC_FLAG_TRANSIENT != 0 {
                ObjId::INVALID
            } else {
                self.alloc_id()
            };
            fixup.add(old, new);
        }

        let obj_cnt = fp.read_uint4()?;
        for _ in 0..obj_cnt {
            let saved = ObjId(fp.read_uint4()?);
            let root = fp.read_uint1()? != 0;
            let dep = fp.read_uint1()?;
            let metaclass = *deps
                .get(usize::from(dep))
                .ok_or_else(|| VmError::UnknownMetaclass(format!("dependency #{dep}")))?;

            let id = if root {
                if !self.is_root(saved) {
                    return Err(VmError::SavedObjIdInvalid(saved.0));
                }
                saved
            } else {
                let id = fixup.get_new_id(saved);
                if !fixup.contains(saved) || !id.is_valid() {
                    return Err(VmError::SavedObjIdInvalid(saved.0));
                }
                id
            };

            let obj = VmObject::restore_from_file(metaclass, fp, Some(&fixup))?;
            if let VmObject::IntrinsicClass(class) = &obj {
                meta.register(class.metaclass(), id);
            }
            let entry = self
                .entry_mut(id)
                .ok_or(VmError::SavedObjIdInvalid(saved.0))?;
            entry.obj = Some(obj);
            entry.in_undo = false;
            log::trace!("restored object {saved} as {id} ({})", metaclass.name());
        }

        log::debug!("object table restored: {obj_cnt} objects, {} fixups", fixup.len());
        Ok(fixup)
    }

    /// Load the image's objects into the root set.
    pub(crate) fn load_image(
        &mut self,
        objects: Vec<ImageObject>,
        meta: &mut MetaTable,
    ) -> Result<()> {
        for img in &objects {
            let obj = VmObject::load_from_image(img.metaclass, &img.data)?;
            if let VmObject::IntrinsicClass(class) = &obj {
                meta.register(class.metaclass(), img.id);
            }
            self.insert_at(img.id, obj, true, img.transient);
        }
        log::debug!("loaded {} image objects", objects.len());
        self.image_objects = objects;
        Ok(())
    }

    /// Put every non-transient image object back to its load-time state.
    /// Dynamic objects are left for the next collection.
    pub(crate) fn reset_to_image(
        &mut self,
        undo: &mut UndoJournal,
        meta: &mut MetaTable,
    ) -> Result<()> {
        undo.drop_undo();
        for idx in 0..self.image_objects.len() {
            let img = &self.image_objects[idx];
            if img.transient {
                continue;
            }
            let id = img.id;
            let obj = VmObject::load_from_image(img.metaclass, &img.data)?;
            if let VmObject::IntrinsicClass(class) = &obj {
                meta.register(class.metaclass(), id);
            }
            if let Some(entry) = self.entry_mut(id) {
                entry.obj = Some(obj);
                entry.in_undo = false;
            }
        }
        Ok(())
    }

    pub(crate) fn do_all_post_load_init(&mut self) {
        for id in self.live_ids() {
            self.with_object_mut(id, |obj, objs| obj.post_load_init(objs));
        }
    }
}

impl ValueContext for ObjectTable {
    fn hash_value(&self, val: &Value) -> u32 {
        if let Value::Obj(id) = val {
            if let Some(VmObject::String(s)) = self.object(*id) {
                return s.calc_hash();
            }
        }
        val.scalar_hash()
    }

    fn values_equal(&self, a: &Value, b: &Value) -> bool {
        if a == b {
            return true;
        }
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => match (self.string_text(*x), self.string_text(*y)) {
                (Some(s), Some(t)) => s == t,
                _ => false,
            },
            _ => false,
        }
    }

    fn is_value_deletable(&self, val: &Value) -> bool {
        val.as_obj().is_some_and(|id| self.is_obj_deletable(id))
    }
}

impl UndoTarget for ObjectTable {
    fn notify_new_savept(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.in_undo = true;
            if let Some(obj) = entry.obj.as_mut() {
                obj.notify_new_savept();
            }
        }
    }

    fn apply_undo(&mut self, rec: &mut UndoRecord) {
        self.with_object_mut(rec.obj, |obj, objs| obj.apply_undo(rec, objs));
    }

    fn mark_undo_ref(&mut self, rec: &UndoRecord) {
        let mut refs = Vec::new();
        if let Some(obj) = self.object(rec.obj) {
            obj.mark_undo_ref(rec, &mut refs);
        }
        for id in refs {
            self.mark(id);
        }
    }

    fn remove_stale_undo_weak_ref(&mut self, rec: &mut UndoRecord) {
        if let Some(obj) = self.object(rec.obj) {
            obj.remove_stale_undo_weak_ref(rec, &*self);
        }
    }

    fn is_obj_deletable(&self, obj: ObjId) -> bool {
        self.collecting && self.entry(obj).is_some_and(|e| !e.marked && !e.in_root_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::StringObject;
    use crate::undo::UndoRecorder;

    fn string(objs: &mut ObjectTable, text: &str) -> ObjId {
        objs.create(VmObject::String(StringObject::new(text)))
    }

    fn root_table(objs: &mut ObjectTable, id: u32, weak: bool) -> ObjId {
        let id = ObjId(id);
        let table = LookupTable::new(8, 8, weak).unwrap();
        objs.insert_at(id, VmObject::LookupTable(table), true, false);
        id
    }

    fn put(objs: &mut ObjectTable, table: ObjId, key: Value, val: Value) {
        objs.with_table_mut(table, |t, cx| t.add_entry(key, val, cx))
            .unwrap();
    }

    #[test]
    fn ids_are_reused_after_collection() {
        let mut objs = ObjectTable::new(0);
        let mut undo = UndoJournal::new(16, 4);
        let a = string(&mut objs, "a");
        let b = string(&mut objs, "b");
        assert_eq!((a, b), (ObjId(1), ObjId(2)));
        objs.gc_full(&[b], &mut undo);
        assert!(!objs.contains(a));
        assert!(objs.contains(b));
        assert_eq!(string(&mut objs, "c"), a);
    }

    #[test]
    fn insert_at_leaves_gaps_allocatable() {
        let mut objs = ObjectTable::new(0);
        root_table(&mut objs, 3, false);
        let ids: Vec<ObjId> = (0..3).map(|_| objs.alloc_id()).collect();
        assert_eq!(ids, vec![ObjId(1), ObjId(2), ObjId(4)]);
    }

    #[test]
    fn strings_compare_by_text() {
        let mut objs = ObjectTable::new(0);
        let a = Value::Obj(string(&mut objs, "key"));
        let b = Value::Obj(string(&mut objs, "key"));
        let c = Value::Obj(string(&mut objs, "other"));
        assert!(objs.values_equal(&a, &b));
        assert!(!objs.values_equal(&a, &c));
        assert_eq!(objs.hash_value(&a), objs.hash_value(&b));

        let t = root_table(&mut objs, 10, false);
        put(&mut objs, t, a, Value::Int(1));
        assert_eq!(
            objs.lookup_table(t).unwrap().index_val(&b, &objs),
            Value::Int(1)
        );
    }

    #[test]
    fn gc_traces_tables_and_respects_weakness() {
        let mut objs = ObjectTable::new(0);
        let mut undo = UndoJournal::new(16, 4);
        let strong = root_table(&mut objs, 1, false);
        let weak = root_table(&mut objs, 2, true);
        let held = string(&mut objs, "held");
        let weak_only = string(&mut objs, "weak only");
        let weak_key = string(&mut objs, "weak key");

        put(&mut objs, strong, Value::Int(1), Value::Obj(held));
        put(&mut objs, weak, Value::Int(1), Value::Obj(held));
        put(&mut objs, weak, Value::Int(2), Value::Obj(weak_only));
        put(&mut objs, weak, Value::Obj(weak_key), Value::Int(3));

        objs.gc_full(&[], &mut undo);
        assert!(objs.contains(held));
        assert!(objs.contains(weak_key));
        assert!(!objs.contains(weak_only));

        let table = objs.lookup_table(weak).unwrap();
        assert_eq!(table.count_entries(), 2);
        assert_eq!(table.index_val(&Value::Int(1), &objs), Value::Obj(held));
        assert_eq!(table.index_val(&Value::Int(2), &objs), Value::Nil);
    }

    #[test]
    fn undo_records_keep_strong_values_alive() {
        let mut objs = ObjectTable::new(0);
        let mut undo = UndoJournal::new(16, 4);
        let t = root_table(&mut objs, 1, false);
        let s = string(&mut objs, "old");
        put(&mut objs, t, Value::Int(1), Value::Obj(s));
        undo.create_savept(&mut objs);

        let mut rec = UndoRecorder::new(&mut undo, t, objs.is_obj_in_undo(t));
        objs.with_table_mut(t, |tab, cx| tab.set_index_val(Value::Int(1), Value::Nil, cx, &mut rec))
            .unwrap();

        objs.gc_full(&[], &mut undo);
        assert!(objs.contains(s));
        undo.undo_to_savept(&mut objs);
        assert_eq!(
            objs.lookup_table(t).unwrap().index_val(&Value::Int(1), &objs),
            Value::Obj(s)
        );
    }

    #[test]
    fn deletable_only_during_collection() {
        let mut objs = ObjectTable::new(0);
        let s = string(&mut objs, "x");
        assert!(!objs.is_obj_deletable(s));
        assert!(!objs.is_value_deletable(&Value::Obj(s)));
    }

    #[test]
    fn wrong_object_kind_is_reported() {
        let mut objs = ObjectTable::new(0);
        let s = string(&mut objs, "x");
        assert!(matches!(
            objs.lookup_table(s),
            Err(VmError::WrongObjectType { .. })
        ));
        assert!(matches!(
            objs.with_table_mut(ObjId(99), |_, _| Ok(())),
            Err(VmError::WrongObjectType { id: 99, .. })
        ));
    }

    #[test]
    fn automatic_gc_threshold() {
        let mut objs = ObjectTable::new(2);
        string(&mut objs, "a");
        assert!(!objs.gc_due());
        string(&mut objs, "b");
        assert!(objs.gc_due());
        assert!(objs.enable_gc(false));
        assert!(!objs.gc_due());
        assert!(!objs.enable_gc(true));
    }
}
