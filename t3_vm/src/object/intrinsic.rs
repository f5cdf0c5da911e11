use t3_format::{DataStream, Result, VmError};

use crate::object::MetaclassId;

/// Class object standing for one built-in metaclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrinsicClass {
    meta: MetaclassId,
}

impl IntrinsicClass {
    pub fn new(meta: MetaclassId) -> Self {
        Self { meta }
    }

    pub fn metaclass(&self) -> MetaclassId {
        self.meta
    }

    pub fn save_to_file<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        let name = self.meta.name();
        fp.write_uint2(name.len() as u16)?;
        fp.write_bytes(name.as_bytes())
    }

    pub fn load<S: DataStream + ?Sized>(fp: &mut S) -> Result<Self> {
        let len = usize::from(fp.read_uint2()?);
        let mut buf = vec![0u8; len];
        fp.read_bytes(&mut buf)?;
        let name = String::from_utf8_lossy(&buf);
        let meta = MetaclassId::from_name(&name)
            .ok_or_else(|| VmError::UnknownMetaclass(name.into_owned()))?;
        Ok(Self { meta })
    }
}
