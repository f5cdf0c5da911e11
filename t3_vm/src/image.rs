//! Program images: the resident data a VM is loaded from and reset to,
//! plus the dynamic link step that resolves the symbols the VM needs.

use std::collections::BTreeMap;

use t3_format::{DataStream, Result, Timestamp, VmError};

use crate::fixup::ObjFixup;
use crate::object::{IntrinsicClass, LookupIter, LookupTable, MetaclassId, StringObject, VmObject};
use crate::objtable::ObjectTable;
use crate::value::{ObjId, PropId, Value};
use crate::vm::Vm;

/// Image-defined startup code, run after load and after every reset.
pub type StaticInit = fn(&mut Vm) -> Result<()>;

/// One root object as stored in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageObject {
    pub id: ObjId,
    pub metaclass: MetaclassId,
    pub data: Vec<u8>,
    /// Transient objects are never written to a saved state.
    pub transient: bool,
}

#[derive(Debug, Clone)]
pub struct ImageFile {
    pub timestamp: Timestamp,
    pub filename: String,
    pub objects: Vec<ImageObject>,
    pub exports: BTreeMap<String, Value>,
    /// Symbols the VM looks up after every load, restore and reset.
    pub required_symbols: Vec<String>,
    /// Highest property id the image uses.
    pub max_prop: PropId,
    pub static_inits: Vec<StaticInit>,
}

/// Builds an [`ImageFile`] object by object.
#[derive(Debug)]
pub struct ImageBuilder {
    timestamp: Timestamp,
    filename: String,
    objects: Vec<ImageObject>,
    scratch: ObjectTable,
    exports: BTreeMap<String, Value>,
    required_symbols: Vec<String>,
    max_prop: PropId,
    static_inits: Vec<StaticInit>,
}

impl ImageBuilder {
    pub fn new(filename: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            filename: filename.into(),
            objects: Vec::new(),
            scratch: ObjectTable::new(0),
            exports: BTreeMap::new(),
            required_symbols: Vec::new(),
            max_prop: PropId(0),
            static_inits: Vec::new(),
        }
    }

    fn push(&mut self, obj: VmObject) -> Result<ObjId> {
        let id = ObjId(self.objects.len() as u32 + 1);
        self.objects.push(ImageObject {
            id,
            metaclass: obj.metaclass(),
            data: obj.image_data()?,
            transient: false,
        });
        self.scratch.insert_at(id, obj, true, false);
        Ok(id)
    }

    pub fn string(&mut self, text: &str) -> Result<ObjId> {
        self.push(VmObject::String(StringObject::new(text)))
    }

    fn table(
        &mut self,
        bucket_cnt: usize,
        capacity: usize,
        entries: &[(Value, Value)],
        weak: bool,
    ) -> Result<ObjId> {
        let mut table = LookupTable::new(bucket_cnt, capacity, weak)?;
        for &(key, val) in entries {
            if !table.mod_entry(&key, val, &self.scratch) {
                table.add_entry(key, val, &self.scratch)?;
            }
        }
        self.push(VmObject::LookupTable(table))
    }

    /// A lookup table holding `entries`. String keys must already have
    /// been added to this builder.
    pub fn lookup_table(
        &mut self,
        bucket_cnt: usize,
        capacity: usize,
        entries: &[(Value, Value)],
    ) -> Result<ObjId> {
        self.table(bucket_cnt, capacity, entries, false)
    }

    pub fn weak_lookup_table(
        &mut self,
        bucket_cnt: usize,
        capacity: usize,
        entries: &[(Value, Value)],
    ) -> Result<ObjId> {
        self.table(bucket_cnt, capacity, entries, true)
    }

    /// A live iterator over `table`.
    pub fn iterator(&mut self, table: ObjId) -> Result<ObjId> {
        self.push(VmObject::Iterator(LookupIter::new(table)))
    }

    pub fn intrinsic_class(&mut self, meta: MetaclassId) -> Result<ObjId> {
        self.push(VmObject::IntrinsicClass(IntrinsicClass::new(meta)))
    }

    /// Keep `id` out of saved states.
    pub fn transient(&mut self, id: ObjId) -> &mut Self {
        if let Some(obj) = self.objects.iter_mut().find(|o| o.id == id) {
            obj.transient = true;
        }
        self
    }

    pub fn export(&mut self, name: &str, val: impl Into<Value>) -> &mut Self {
        self.exports.insert(name.to_string(), val.into());
        self
    }

    pub fn require(&mut self, name: &str) -> &mut Self {
        self.required_symbols.push(name.to_string());
        self
    }

    pub fn max_prop(&mut self, prop: PropId) -> &mut Self {
        self.max_prop = prop;
        self
    }

    pub fn static_init(&mut self, init: StaticInit) -> &mut Self {
        self.static_inits.push(init);
        self
    }

    pub fn build(self) -> ImageFile {
        ImageFile {
            timestamp: self.timestamp,
            filename: self.filename,
            objects: self.objects,
            exports: self.exports,
            required_symbols: self.required_symbols,
            max_prop: self.max_prop,
            static_inits: self.static_inits,
        }
    }
}

/// The image-side state a running VM keeps: identity, exports and the
/// symbols synthesized because the image did not define them.
#[derive(Debug)]
pub struct ImageLoader {
    timestamp: Timestamp,
    filename: String,
    exports: BTreeMap<String, Value>,
    required_symbols: Vec<String>,
    max_prop: PropId,
    static_inits: Vec<StaticInit>,
    synth_exports: Vec<(String, Value)>,
    linked: BTreeMap<String, Value>,
}

impl ImageLoader {
    /// Split an image into the loader state and the objects for the
    /// object table.
    pub fn new(image: ImageFile) -> (Self, Vec<ImageObject>) {
        let loader = Self {
            timestamp: image.timestamp,
            filename: image.filename,
            exports: image.exports,
            required_symbols: image.required_symbols,
            max_prop: image.max_prop,
            static_inits: image.static_inits,
            synth_exports: Vec::new(),
            linked: BTreeMap::new(),
        };
        (loader, image.objects)
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn static_inits(&self) -> Vec<StaticInit> {
        self.static_inits.clone()
    }

    /// Value bound to `name` by the last dynamic link, or an export.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.linked
            .get(name)
            .or_else(|| self.exports.get(name))
            .copied()
            .or_else(|| self.synth_export(name))
    }

    pub fn synth_export(&self, name: &str) -> Option<Value> {
        self.synth_exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn synth_exports(&self) -> &[(String, Value)] {
        &self.synth_exports
    }

    /// Add or replace a synthesized export.
    pub fn set_synth_export(&mut self, name: &str, val: Value) {
        match self.synth_exports.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = val,
            None => self.synth_exports.push((name.to_string(), val)),
        }
    }

    /// Objects referenced by synthesized exports. They stay alive as long
    /// as the export does.
    pub fn synth_export_objects(&self) -> Vec<ObjId> {
        self.synth_exports
            .iter()
            .filter_map(|(_, v)| v.as_obj())
            .collect()
    }

    pub fn discard_synth_exports(&mut self) {
        self.synth_exports.clear();
        self.linked.clear();
    }

    fn next_synth_prop(&self) -> Result<PropId> {
        let highest = self
            .synth_exports
            .iter()
            .filter_map(|(_, v)| match v {
                Value::Prop(p) => Some(p.0),
                _ => None,
            })
            .chain(std::iter::once(self.max_prop.0))
            .max()
            .unwrap_or(self.max_prop.0);
        highest.checked_add(1).map(PropId).ok_or(VmError::OutOfRange)
    }

    /// Bind every required symbol: to the image export of that name,
    /// else to an existing synthesized export, else to a freshly
    /// synthesized property id.
    pub fn do_dynamic_link(&mut self) -> Result<()> {
        self.linked.clear();
        for idx in 0..self.required_symbols.len() {
            let name = self.required_symbols[idx].clone();
            let val = match self.exports.get(&name) {
                Some(val) => *val,
                None => match self.synth_export(&name) {
                    Some(val) => val,
                    None => {
                        let prop = Value::Prop(self.next_synth_prop()?);
                        log::debug!("synthesized export {name} as {prop:?}");
                        self.synth_exports.push((name.clone(), prop));
                        prop
                    }
                },
            };
            self.linked.insert(name, val);
        }
        Ok(())
    }

    pub fn save_synth_exports<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        fp.write_uint4(self.synth_exports.len() as u32)?;
        for (name, val) in &self.synth_exports {
            let len = u16::try_from(name.len()).map_err(|_| VmError::OutOfRange)?;
            fp.write_uint2(len)?;
            fp.write_bytes(name.as_bytes())?;
            val.write_to(fp)?;
        }
        Ok(())
    }

    /// Replace the synthesized exports with those saved in `fp`.
    pub fn restore_synth_exports<S: DataStream + ?Sized>(
        &mut self,
        fp: &mut S,
        fixup: &ObjFixup,
    ) -> Result<()> {
        self.discard_synth_exports();
        let count = fp.read_uint4()?;
        for _ in 0..count {
            let len = usize::from(fp.read_uint2()?);
            let mut buf = vec![0u8; len];
            fp.read_bytes(&mut buf)?;
            let name = String::from_utf8_lossy(&buf).into_owned();
            let val = fixup.fix_value(Value::read_from(fp)?);
            self.synth_exports.push((name, val));
        }
        Ok(())
    }
}
