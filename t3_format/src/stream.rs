//! Sequential binary stream used by the save/restore code.
//!
//! Integers are stored little-endian. Read failures surface as
//! [`VmError::ReadFile`] and write failures as [`VmError::WriteFile`].

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::crc::Crc32;
use crate::error::{Result, VmError};

/// Chunk size used when re-reading a stream to compute its checksum.
const CRC_CHUNK: usize = 256;

pub trait DataStream {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Read up to `buf.len()` bytes, stopping early only at end of stream.
    fn read_bytes_upto(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    fn read_uint1(&mut self) -> Result<u8>;
    fn read_uint2(&mut self) -> Result<u16>;
    fn read_int2(&mut self) -> Result<i16>;
    fn read_uint4(&mut self) -> Result<u32>;
    fn read_int4(&mut self) -> Result<i32>;

    fn write_uint1(&mut self, val: u8) -> Result<()>;
    fn write_uint2(&mut self, val: u16) -> Result<()>;
    fn write_int2(&mut self, val: i16) -> Result<()>;
    fn write_uint4(&mut self, val: u32) -> Result<()>;
    fn write_int4(&mut self, val: i32) -> Result<()>;

    fn get_pos(&mut self) -> Result<u64>;
    fn set_pos(&mut self, pos: u64) -> Result<()>;
    /// Seek relative to the current position.
    fn set_pos_from_cur(&mut self, delta: i64) -> Result<()>;
}

impl<T: Read + Write + Seek> DataStream for T {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(VmError::ReadFile)
    }

    fn read_bytes_upto(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_upto(self, buf)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf).map_err(VmError::WriteFile)
    }

    fn read_uint1(&mut self) -> Result<u8> {
        self.read_u8().map_err(VmError::ReadFile)
    }

    fn read_uint2(&mut self) -> Result<u16> {
        self.read_u16::<LittleEndian>().map_err(VmError::ReadFile)
    }

    fn read_int2(&mut self) -> Result<i16> {
        self.read_i16::<LittleEndian>().map_err(VmError::ReadFile)
    }

    fn read_uint4(&mut self) -> Result<u32> {
        self.read_u32::<LittleEndian>().map_err(VmError::ReadFile)
    }

    fn read_int4(&mut self) -> Result<i32> {
        self.read_i32::<LittleEndian>().map_err(VmError::ReadFile)
    }

    fn write_uint1(&mut self, val: u8) -> Result<()> {
        self.write_u8(val).map_err(VmError::WriteFile)
    }

    fn write_uint2(&mut self, val: u16) -> Result<()> {
        self.write_u16::<LittleEndian>(val).map_err(VmError::WriteFile)
    }

    fn write_int2(&mut self, val: i16) -> Result<()> {
        self.write_i16::<LittleEndian>(val).map_err(VmError::WriteFile)
    }

    fn write_uint4(&mut self, val: u32) -> Result<()> {
        self.write_u32::<LittleEndian>(val).map_err(VmError::WriteFile)
    }

    fn write_int4(&mut self, val: i32) -> Result<()> {
        self.write_i32::<LittleEndian>(val).map_err(VmError::WriteFile)
    }

    fn get_pos(&mut self) -> Result<u64> {
        self.stream_position().map_err(VmError::ReadFile)
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        self.seek(SeekFrom::Start(pos))
            .map(|_| ())
            .map_err(VmError::ReadFile)
    }

    fn set_pos_from_cur(&mut self, delta: i64) -> Result<()> {
        self.seek(SeekFrom::Current(delta))
            .map(|_| ())
            .map_err(VmError::ReadFile)
    }
}

/// Read up to `buf.len()` bytes from a plain reader, stopping early only at
/// end of stream. Returns the number of bytes read.
pub fn read_upto<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(VmError::ReadFile(err)),
        }
    }
    Ok(filled)
}

/// Compute the CRC of the next `len` bytes of `stream`, reading forward
/// from the current position. Running out of data before `len` bytes is
/// reported as [`VmError::BadSavedState`] since the length came from the
/// file itself.
pub fn checksum_region<S: DataStream + ?Sized>(stream: &mut S, len: u64) -> Result<u32> {
    let mut crc = Crc32::new();
    let mut buf = [0u8; CRC_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let cur = remaining.min(CRC_CHUNK as u64) as usize;
        let got = stream.read_bytes_upto(&mut buf[..cur])?;
        if got < cur {
            return Err(VmError::BadSavedState);
        }
        crc.scan_bytes(&buf[..cur]);
        remaining -= cur as u64;
    }
    Ok(crc.crc_val())
}
