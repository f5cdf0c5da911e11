//! Object id translation applied while restoring a saved state.

use std::collections::BTreeMap;

use crate::value::{ObjId, Value};

/// Maps ids written in a saved state to the ids the restored objects were
/// given. Ids with no entry are image objects, which keep their ids.
#[derive(Debug, Default)]
pub struct ObjFixup {
    map: BTreeMap<ObjId, ObjId>,
}

impl ObjFixup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a translation. `new` is [`ObjId::INVALID`] for objects that
    /// were not saved, such as transient objects.
    pub fn add(&mut self, old: ObjId, new: ObjId) {
        self.map.insert(old, new);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, old: ObjId) -> bool {
        self.map.contains_key(&old)
    }

    pub fn get_new_id(&self, old: ObjId) -> ObjId {
        self.map.get(&old).copied().unwrap_or(old)
    }

    /// Translate an object reference. References to objects that were not
    /// saved become nil.
    pub fn fix_value(&self, val: Value) -> Value {
        match val {
            Value::Obj(old) => {
                let new = self.get_new_id(old);
                if new.is_valid() {
                    Value::Obj(new)
                } else {
                    Value::Nil
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_are_static() {
        let mut fixup = ObjFixup::new();
        fixup.add(ObjId(100), ObjId(7));
        assert_eq!(fixup.get_new_id(ObjId(100)), ObjId(7));
        assert_eq!(fixup.get_new_id(ObjId(3)), ObjId(3));
        assert_eq!(fixup.fix_value(Value::Int(100)), Value::Int(100));
    }

    #[test]
    fn unsaved_objects_become_nil() {
        let mut fixup = ObjFixup::new();
        fixup.add(ObjId(50), ObjId::INVALID);
        assert_eq!(fixup.fix_value(Value::Obj(ObjId(50))), Value::Nil);
        assert!(fixup.contains(ObjId(50)));
    }
}
