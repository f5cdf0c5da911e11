use std::io;

use t3_format::{DataStream, Result, VmError};

/// Immutable string object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringObject {
    text: String,
}

impl StringObject {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Sum of the characters' code points.
    pub fn calc_hash(&self) -> u32 {
        self.text
            .chars()
            .fold(0u32, |hash, ch| hash.wrapping_add(u32::from(ch)))
    }

    pub fn save_to_file<S: DataStream + ?Sized>(&self, fp: &mut S) -> Result<()> {
        let len = u16::try_from(self.text.len()).map_err(|_| {
            VmError::WriteFile(io::Error::new(
                io::ErrorKind::InvalidInput,
                "string longer than 65535 bytes",
            ))
        })?;
        fp.write_uint2(len)?;
        fp.write_bytes(self.text.as_bytes())
    }

    pub fn load<S: DataStream + ?Sized>(fp: &mut S) -> Result<Self> {
        let len = usize::from(fp.read_uint2()?);
        let mut buf = vec![0u8; len];
        fp.read_bytes(&mut buf)?;
        Ok(Self::new(String::from_utf8_lossy(&buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_byte_encoding() {
        assert_eq!(StringObject::new("ab").calc_hash(), 97 + 98);
        assert_eq!(StringObject::new("é").calc_hash(), 0xe9);
        assert_eq!(StringObject::new("").calc_hash(), 0);
    }
}
