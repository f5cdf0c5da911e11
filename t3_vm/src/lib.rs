//! Persistence core of a T3 virtual machine: the undo journal, lookup
//! tables and their iterators, the object table with its collector, and
//! the save, restore and reset operations over all of it.

pub mod config;
pub mod fixup;
pub mod image;
pub mod metatab;
pub mod object;
pub mod objtable;
pub mod state;
mod tables;
pub mod undo;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use image::{ImageBuilder, ImageFile, ImageLoader, ImageObject, StaticInit};
pub use object::{LookupIter, LookupTable, MetaclassId, VmObject};
pub use objtable::ObjectTable;
pub use state::{restore_get_image, restore_get_image_bounded};
pub use t3_format::{Result, VmError};
pub use undo::{UndoJournal, UndoKey, UndoRecord, UndoRecorder, UndoTarget};
pub use value::{ObjId, PropId, Value, ValueContext};
pub use vm::Vm;
