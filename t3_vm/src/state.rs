//! Saving, restoring and resetting the whole VM.
//!
//! A saved state is the file prefix written by [`t3_format::savefile`],
//! followed by the object table and the synthesized exports. Restore
//! checks the signature, the checksum and the image timestamp before it
//! touches any live object.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use t3_format::savefile;
use t3_format::{DataStream, Result, VmError};

use crate::value::ObjId;
use crate::vm::Vm;

pub use t3_format::{restore_get_image, restore_get_image_bounded};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

impl Vm {
    /// String pairs of a metadata table. Entries whose key or value is
    /// not a string are skipped.
    fn metadata_pairs(&self, table: ObjId) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        let mut skipped = 0usize;
        self.objects.lookup_table(table)?.for_each_assoc(|key, val| {
            match (self.value_text(key), self.value_text(val)) {
                (Some(k), Some(v)) => pairs.push((k.to_string(), v.to_string())),
                _ => skipped += 1,
            }
        });
        if skipped > 0 {
            log::debug!("metadata table: skipped {skipped} non-string entries");
        }
        Ok(pairs)
    }

    /// Write the VM state to `fp`. `metadata` optionally names a lookup
    /// table of descriptive string pairs stored in the header.
    pub fn save<S: DataStream + ?Sized>(
        &mut self,
        fp: &mut S,
        metadata: Option<ObjId>,
    ) -> Result<()> {
        let pairs = metadata.map(|t| self.metadata_pairs(t)).transpose()?;
        self.gc_full();

        let placeholder =
            savefile::write_prefix(fp, self.image.timestamp(), self.image.filename())?;
        savefile::write_metadata(fp, pairs.as_deref())?;
        let roots = self.save_roots();
        self.objects.save(fp, &roots)?;
        self.image.save_synth_exports(fp)?;
        let crc = savefile::finish(fp, placeholder)?;

        log::info!("saved state for {} (crc {crc:#010x})", self.image.filename());
        Ok(())
    }

    /// Save to `path` through a temporary file in the same directory, so
    /// an interrupted save never replaces an existing file.
    pub fn save_to_path(&mut self, path: impl AsRef<Path>, metadata: Option<ObjId>) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(VmError::WriteFile)?;

        let result = self
            .save(&mut file, metadata)
            .and_then(|()| file.sync_all().map_err(VmError::WriteFile));
        drop(file);
        if let Err(err) = result {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                log::warn!("could not remove {}: {cleanup}", tmp.display());
            }
            return Err(err);
        }
        fs::rename(&tmp, path).map_err(VmError::WriteFile)
    }

    /// Replace the live state with the one saved in `fp`. Undo history is
    /// discarded.
    pub fn restore<S: DataStream + ?Sized>(&mut self, fp: &mut S) -> Result<()> {
        savefile::check_signature(fp)?;
        savefile::verify_checksum(fp)?;
        let timestamp = savefile::read_timestamp(fp)?;
        if &timestamp != self.image.timestamp() {
            return Err(VmError::WrongSavedState);
        }
        savefile::skip_section(fp)?;
        savefile::skip_section(fp)?;

        self.undo.drop_undo();
        let gc_was_enabled = self.objects.enable_gc(false);
        let result = self.restore_objects(fp);
        self.objects.enable_gc(gc_was_enabled);
        result?;

        self.gc_full();
        log::info!("restored state for {}", self.image.filename());
        Ok(())
    }

    fn restore_objects<S: DataStream + ?Sized>(&mut self, fp: &mut S) -> Result<()> {
        self.meta.forget_intrinsic_class_instances();
        let fixup = self.objects.restore(fp, &mut self.undo, &mut self.meta)?;
        self.image.restore_synth_exports(fp, &fixup)?;
        self.image.do_dynamic_link()?;
        self.create_intrinsic_class_instances();
        self.objects.do_all_post_load_init();
        Ok(())
    }

    pub fn restore_from_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::open(path.as_ref()).map_err(VmError::ReadFile)?;
        self.restore(&mut file)
    }

    /// Return to the state right after the image was loaded, then run the
    /// static initializers again.
    pub fn reset(&mut self) -> Result<()> {
        self.undo.drop_undo();
        self.image.discard_synth_exports();
        self.meta.forget_intrinsic_class_instances();
        self.objects.reset_to_image(&mut self.undo, &mut self.meta)?;
        self.image.do_dynamic_link()?;
        self.create_intrinsic_class_instances();
        self.objects.do_all_post_load_init();
        self.gc_full();
        log::info!("reset to image {}", self.image.filename());
        self.run_static_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::config::VmConfig;
    use crate::image::ImageBuilder;
    use crate::value::Value;

    fn vm() -> (Vm, ObjId) {
        let mut builder = ImageBuilder::new("game.t3", [7; 24]);
        let table = builder.lookup_table(4, 4, &[]).unwrap();
        let vm = Vm::load(builder.build(), VmConfig::default()).unwrap();
        (vm, table)
    }

    #[test]
    fn restore_brings_back_saved_entries() {
        let (mut vm, table) = vm();
        vm.set_index_val(table, Value::Int(1), Value::Int(10)).unwrap();
        let mut cur = Cursor::new(Vec::new());
        vm.save(&mut cur, None).unwrap();

        vm.set_index_val(table, Value::Int(1), Value::Int(99)).unwrap();
        vm.set_index_val(table, Value::Int(2), Value::Int(20)).unwrap();
        cur.set_position(0);
        vm.restore(&mut cur).unwrap();

        assert_eq!(vm.index_val(table, &Value::Int(1)).unwrap(), Value::Int(10));
        assert!(!vm.key_present(table, &Value::Int(2)).unwrap());
    }

    #[test]
    fn restore_drops_undo() {
        let (mut vm, table) = vm();
        let mut cur = Cursor::new(Vec::new());
        vm.save(&mut cur, None).unwrap();
        vm.create_savept();
        vm.set_index_val(table, Value::Int(1), Value::Int(1)).unwrap();
        cur.set_position(0);
        vm.restore(&mut cur).unwrap();
        assert_eq!(vm.undo().savept_count(), 0);
        assert!(vm.objects().gc_enabled());
    }

    #[test]
    fn metadata_skips_non_strings() {
        let (mut vm, table) = vm();
        let k = vm.new_string("title");
        let v = vm.new_string("Cloak");
        vm.set_index_val(table, k.into(), v.into()).unwrap();
        vm.set_index_val(table, Value::Int(1), v.into()).unwrap();
        assert_eq!(
            vm.metadata_pairs(table).unwrap(),
            vec![("title".to_string(), "Cloak".to_string())]
        );
    }

    #[test]
    fn temp_path_is_a_sibling() {
        assert_eq!(
            temp_path(Path::new("/saves/game.t3v")),
            PathBuf::from("/saves/game.t3v.tmp")
        );
    }
}
