//! Metaclass dependency table and the intrinsic class object registered
//! for each metaclass.

use std::collections::BTreeMap;

use t3_format::{DataStream, Result, VmError};

use crate::object::MetaclassId;
use crate::value::ObjId;

#[derive(Debug, Default)]
pub struct MetaTable {
    class_objs: BTreeMap<MetaclassId, ObjId>,
}

impl MetaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `meta` in the dependency table written by
    /// [`MetaTable::write_dep_table`].
    pub fn dep_index(meta: MetaclassId) -> u8 {
        MetaclassId::ALL
            .iter()
            .position(|&m| m == meta)
            .unwrap_or_default() as u8
    }

    pub fn write_dep_table<S: DataStream + ?Sized>(fp: &mut S) -> Result<()> {
        fp.write_uint2(MetaclassId::ALL.len() as u16)?;
        for meta in MetaclassId::ALL {
            let name = meta.name();
            fp.write_uint2(name.len() as u16)?;
            fp.write_bytes(name.as_bytes())?;
        }
        Ok(())
    }

    /// Read a dependency table, resolving each entry to a known metaclass.
    pub fn read_dep_table<S: DataStream + ?Sized>(fp: &mut S) -> Result<Vec<MetaclassId>> {
        let count = fp.read_uint2()?;
        let mut out = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let len = usize::from(fp.read_uint2()?);
            let mut buf = vec![0u8; len];
            fp.read_bytes(&mut buf)?;
            let name = String::from_utf8_lossy(&buf);
            let meta = MetaclassId::from_name(&name)
                .ok_or_else(|| VmError::UnknownMetaclass(name.into_owned()))?;
            out.push(meta);
        }
        Ok(out)
    }

    /// Record the class object for `meta`. The first registration wins.
    pub fn register(&mut self, meta: MetaclassId, obj: ObjId) {
        self.class_objs.entry(meta).or_insert(obj);
    }

    pub fn class_obj(&self, meta: MetaclassId) -> Option<ObjId> {
        self.class_objs.get(&meta).copied()
    }

    pub fn class_objects(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.class_objs.values().copied()
    }

    /// Metaclasses with no class object registered.
    pub fn missing(&self) -> Vec<MetaclassId> {
        MetaclassId::ALL
            .into_iter()
            .filter(|m| !self.class_objs.contains_key(m))
            .collect()
    }

    pub fn forget_intrinsic_class_instances(&mut self) {
        self.class_objs.clear();
    }
}
