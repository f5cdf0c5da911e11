//! The VM handle: every piece of state the persistence operations touch,
//! passed explicitly instead of living in globals.

use t3_format::{Result, VmError};

use crate::config::VmConfig;
use crate::image::{ImageFile, ImageLoader};
use crate::metatab::MetaTable;
use crate::object::{IntrinsicClass, StringObject, VmObject};
use crate::objtable::ObjectTable;
use crate::undo::UndoJournal;
use crate::value::{ObjId, Value};

#[derive(Debug)]
pub struct Vm {
    config: VmConfig,
    pub(crate) objects: ObjectTable,
    pub(crate) undo: UndoJournal,
    pub(crate) meta: MetaTable,
    pub(crate) image: ImageLoader,
    /// Host value stack. Everything on it is a collection root.
    stack: Vec<Value>,
}

impl Vm {
    /// Load `image` and run its static initializers.
    pub fn load(image: ImageFile, config: VmConfig) -> Result<Vm> {
        config.validate()?;
        let (image, objects) = ImageLoader::new(image);
        let mut vm = Vm {
            objects: ObjectTable::new(config.gc_alloc_threshold),
            undo: UndoJournal::new(config.undo_records, config.max_savepoints),
            meta: MetaTable::new(),
            image,
            stack: Vec::new(),
            config,
        };

        vm.objects.load_image(objects, &mut vm.meta)?;
        vm.image.do_dynamic_link()?;
        vm.create_intrinsic_class_instances();
        vm.objects.do_all_post_load_init();
        vm.run_static_init()?;
        log::info!(
            "loaded image {} ({} objects)",
            vm.image.filename(),
            vm.objects.len()
        );
        Ok(vm)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn undo(&self) -> &UndoJournal {
        &self.undo
    }

    pub fn image(&self) -> &ImageLoader {
        &self.image
    }

    pub fn meta(&self) -> &MetaTable {
        &self.meta
    }

    pub fn push(&mut self, val: impl Into<Value>) {
        self.stack.push(val.into());
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Objects that survive a save even when the image does not reach
    /// them.
    pub(crate) fn save_roots(&self) -> Vec<ObjId> {
        self.meta
            .class_objects()
            .chain(self.image.synth_export_objects())
            .collect()
    }

    fn gc_roots(&self) -> Vec<ObjId> {
        let mut roots = self.save_roots();
        roots.extend(self.stack.iter().filter_map(Value::as_obj));
        roots
    }

    /// Run a full collection now, whether or not automatic collection is
    /// enabled.
    pub fn gc_full(&mut self) {
        let roots = self.gc_roots();
        self.objects.gc_full(&roots, &mut self.undo);
    }

    /// Collect if enough allocations have happened since the last pass.
    pub(crate) fn maybe_gc(&mut self) {
        if self.objects.gc_due() {
            self.gc_full();
        }
    }

    /// Turn automatic collection on or off, returning the previous setting.
    pub fn enable_gc(&mut self, enabled: bool) -> bool {
        self.objects.enable_gc(enabled)
    }

    pub fn create_savept(&mut self) {
        self.undo.create_savept(&mut self.objects);
    }

    pub fn undo_to_savept(&mut self) {
        self.undo.undo_to_savept(&mut self.objects);
    }

    pub fn drop_undo(&mut self) {
        self.undo.drop_undo();
    }

    pub fn new_string(&mut self, text: &str) -> ObjId {
        self.maybe_gc();
        self.objects.create(VmObject::String(StringObject::new(text)))
    }

    pub fn string_text(&self, id: ObjId) -> Option<&str> {
        self.objects.string_text(id)
    }

    /// Text of a value that refers to a string object.
    pub fn value_text(&self, val: &Value) -> Option<&str> {
        val.as_obj().and_then(|id| self.string_text(id))
    }

    pub fn set_prop(&mut self, id: ObjId) -> Result<()> {
        self.objects
            .with_object_mut(id, |obj, _| obj.set_prop())
            .unwrap_or(Err(VmError::InvalidSetProp))
    }

    /// Keep a dynamic object out of saved states.
    pub fn set_transient(&mut self, id: ObjId) {
        self.objects.set_transient(id);
    }

    /// Value bound to an exported or dynamically linked symbol.
    pub fn export(&self, name: &str) -> Option<Value> {
        self.image.resolve(name)
    }

    /// Publish `val` under `name` in the synthesized export namespace.
    pub fn set_synth_export(&mut self, name: &str, val: impl Into<Value>) {
        self.image.set_synth_export(name, val.into());
    }

    /// Create a class object for every metaclass that lacks one.
    pub(crate) fn create_intrinsic_class_instances(&mut self) {
        for meta in self.meta.missing() {
            let id = self
                .objects
                .create(VmObject::IntrinsicClass(IntrinsicClass::new(meta)));
            self.meta.register(meta, id);
            log::trace!("created intrinsic class {} as {id}", meta.name());
        }
    }

    pub fn run_static_init(&mut self) -> Result<()> {
        for init in self.image.static_inits() {
            init(self)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;
    use crate::object::MetaclassId;

    fn empty_vm() -> Vm {
        let image = ImageBuilder::new("empty.t3", [0; 24]).build();
        Vm::load(image, VmConfig::default()).unwrap()
    }

    #[test]
    fn load_creates_missing_class_objects() {
        let mut builder = ImageBuilder::new("game.t3", [0; 24]);
        let string_class = builder.intrinsic_class(MetaclassId::String).unwrap();
        let vm = Vm::load(builder.build(), VmConfig::default()).unwrap();

        assert_eq!(vm.meta().class_obj(MetaclassId::String), Some(string_class));
        assert!(vm.meta().missing().is_empty());
        let lookup_class = vm.meta().class_obj(MetaclassId::LookupTable).unwrap();
        assert!(!vm.objects().is_root(lookup_class));
    }

    #[test]
    fn stack_values_survive_collection() {
        let mut vm = empty_vm();
        let kept = vm.new_string("kept");
        let lost = vm.new_string("lost");
        vm.push(kept);
        vm.gc_full();
        assert_eq!(vm.string_text(kept), Some("kept"));
        assert_eq!(vm.string_text(lost), None);
        assert_eq!(vm.pop(), Some(Value::Obj(kept)));
    }

    #[test]
    fn static_init_runs_on_load() {
        fn init(vm: &mut Vm) -> Result<()> {
            let s = vm.new_string("from init");
            vm.set_synth_export("greeting", s);
            Ok(())
        }
        let mut builder = ImageBuilder::new("game.t3", [0; 24]);
        builder.static_init(init);
        let vm = Vm::load(builder.build(), VmConfig::default()).unwrap();
        let greeting = vm.export("greeting").unwrap();
        assert_eq!(vm.value_text(&greeting), Some("from init"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let image = ImageBuilder::new("game.t3", [0; 24]).build();
        let config = VmConfig {
            undo_records: 0,
            ..VmConfig::default()
        };
        assert!(matches!(
            Vm::load(image, config),
            Err(VmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn set_prop_is_rejected() {
        let mut vm = empty_vm();
        let s = vm.new_string("x");
        assert!(matches!(vm.set_prop(s), Err(VmError::InvalidSetProp)));
    }
}
