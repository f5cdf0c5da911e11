//! Framing of a saved VM state file.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! signature            17 bytes
//! data_size            u32, bytes following the checksum field
//! crc                  u32, CRC-32 of those data_size bytes
//! timestamp            24 bytes copied from the image
//! image name           u16 length + bytes
//! metadata             u16 byte length (0 = none), u16 pair count,
//!                      pairs of { u16 name len, u16 value len, name, value }
//! object table         owned by the object table
//! synthesized exports  owned by the image loader
//! ```

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Result, VmError};
use crate::stream::{DataStream, checksum_region, read_upto};

/// Signature identifying the current saved state format. Any incompatible
/// change to the layout must change this string.
pub const SAVE_SIGNATURE: &[u8; 17] = b"T3-state-v000A\r\n\x1a";

/// Length of the opaque image timestamp.
pub const TIMESTAMP_LEN: usize = 24;

/// Smallest `data_size` a complete file can declare: the timestamp plus the
/// image-name and metadata length fields. Headers left behind by an
/// interrupted save carry zero here and are rejected.
pub const MIN_DATA_SIZE: u32 = (TIMESTAMP_LEN + 2 + 2) as u32;

/// Opaque 24-byte image timestamp.
pub type Timestamp = [u8; TIMESTAMP_LEN];

/// Everything in a saved state file ahead of the object data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub data_size: u32,
    pub crc: u32,
    pub timestamp: Timestamp,
    pub image_name: String,
    pub metadata: Vec<(String, String)>,
}

/// Position of the size/CRC placeholders, returned by [`write_prefix`] and
/// consumed by [`finish`].
#[derive(Debug, Clone, Copy)]
pub struct Placeholder {
    pos: u64,
}

fn too_long(what: &str) -> VmError {
    VmError::WriteFile(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} does not fit a 16-bit length"),
    ))
}

/// Write the signature, the size/CRC placeholders, the timestamp and the
/// image name.
pub fn write_prefix<S: DataStream + ?Sized>(
    fp: &mut S,
    timestamp: &Timestamp,
    image_name: &str,
) -> Result<Placeholder> {
    fp.write_bytes(SAVE_SIGNATURE)?;
    let pos = fp.get_pos()?;
    fp.write_uint4(0)?;
    fp.write_uint4(0)?;
    fp.write_bytes(timestamp)?;

    let name = image_name.as_bytes();
    let len = u16::try_from(name.len()).map_err(|_| too_long("image name"))?;
    fp.write_uint2(len)?;
    fp.write_bytes(name)?;
    Ok(Placeholder { pos })
}

/// Write the metadata section. `None` writes an empty section.
pub fn write_metadata<S: DataStream + ?Sized>(
    fp: &mut S,
    pairs: Option<&[(String, String)]>,
) -> Result<()> {
    let Some(pairs) = pairs else {
        return fp.write_uint2(0);
    };

    let len_pos = fp.get_pos()?;
    fp.write_uint2(0)?;
    let count = u16::try_from(pairs.len()).map_err(|_| VmError::DescTabOverflow)?;
    fp.write_uint2(count)?;
    for (name, value) in pairs {
        let name_len = u16::try_from(name.len()).map_err(|_| VmError::DescTabOverflow)?;
        let value_len = u16::try_from(value.len()).map_err(|_| VmError::DescTabOverflow)?;
        fp.write_uint2(name_len)?;
        fp.write_uint2(value_len)?;
        fp.write_bytes(name.as_bytes())?;
        fp.write_bytes(value.as_bytes())?;
    }

    let end_pos = fp.get_pos()?;
    if end_pos - len_pos > 0xffff {
        return Err(VmError::DescTabOverflow);
    }
    fp.set_pos(len_pos)?;
    fp.write_uint2((end_pos - len_pos - 2) as u16)?;
    fp.set_pos(end_pos)?;
    Ok(())
}

/// Patch the size and CRC placeholders now that everything has been
/// written. The stream is left positioned at its end.
pub fn finish<S: DataStream + ?Sized>(fp: &mut S, placeholder: Placeholder) -> Result<u32> {
    let end_pos = fp.get_pos()?;
    let data_start = placeholder.pos + 8;
    let data_size = u32::try_from(end_pos - data_start).map_err(|_| too_long_file())?;

    fp.set_pos(data_start)?;
    let crc = checksum_region(fp, u64::from(data_size))?;

    fp.set_pos(placeholder.pos)?;
    fp.write_uint4(data_size)?;
    fp.write_uint4(crc)?;
    fp.set_pos(end_pos)?;
    log::debug!("saved state framed: {data_size} bytes, crc {crc:#010x}");
    Ok(crc)
}

fn too_long_file() -> VmError {
    VmError::WriteFile(io::Error::new(
        io::ErrorKind::InvalidInput,
        "saved state exceeds 4 GiB",
    ))
}

/// Check the leading signature. A missing or altered signature, including
/// a file too short to hold one, is [`VmError::NotSavedState`].
pub fn check_signature<S: DataStream + ?Sized>(fp: &mut S) -> Result<()> {
    let mut buf = [0u8; SAVE_SIGNATURE.len()];
    let got = fp.read_bytes_upto(&mut buf)?;
    if got != buf.len() || &buf != SAVE_SIGNATURE {
        return Err(VmError::NotSavedState);
    }
    Ok(())
}

/// Read the size and CRC fields, recompute the checksum over the window
/// they describe and rewind to the start of that window.
pub fn verify_checksum<S: DataStream + ?Sized>(fp: &mut S) -> Result<(u32, u32)> {
    let mut fields = [0u8; 8];
    if fp.read_bytes_upto(&mut fields)? != fields.len() {
        return Err(VmError::BadSavedState);
    }
    let mut cur = &fields[..];
    let data_size = cur.read_u32::<LittleEndian>().map_err(VmError::ReadFile)?;
    let crc = cur.read_u32::<LittleEndian>().map_err(VmError::ReadFile)?;
    if data_size < MIN_DATA_SIZE {
        return Err(VmError::BadSavedState);
    }

    let start = fp.get_pos()?;
    let actual = checksum_region(fp, u64::from(data_size))?;
    if actual != crc {
        log::debug!("checksum mismatch: stored {crc:#010x}, computed {actual:#010x}");
        return Err(VmError::BadSavedState);
    }
    fp.set_pos(start)?;
    Ok((data_size, crc))
}

pub fn read_timestamp<S: DataStream + ?Sized>(fp: &mut S) -> Result<Timestamp> {
    let mut ts = [0u8; TIMESTAMP_LEN];
    fp.read_bytes(&mut ts)?;
    Ok(ts)
}

/// Skip a section introduced by a u16 byte length.
pub fn skip_section<S: DataStream + ?Sized>(fp: &mut S) -> Result<()> {
    let len = fp.read_uint2()?;
    fp.set_pos_from_cur(i64::from(len))
}

fn read_string<S: DataStream + ?Sized>(fp: &mut S, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    fp.read_bytes(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn read_image_name<S: DataStream + ?Sized>(fp: &mut S) -> Result<String> {
    let len = fp.read_uint2()?;
    read_string(fp, usize::from(len))
}

pub fn read_metadata<S: DataStream + ?Sized>(fp: &mut S) -> Result<Vec<(String, String)>> {
    let len = fp.read_uint2()?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let count = fp.read_uint2()?;
    let mut pairs = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name_len = fp.read_uint2()?;
        let value_len = fp.read_uint2()?;
        let name = read_string(fp, usize::from(name_len))?;
        let value = read_string(fp, usize::from(value_len))?;
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Read the whole header without verifying the checksum. The stream is
/// left at the start of the object data.
pub fn read_header<S: DataStream + ?Sized>(fp: &mut S) -> Result<SaveHeader> {
    check_signature(fp)?;
    let data_size = fp.read_uint4()?;
    let crc = fp.read_uint4()?;
    let timestamp = read_timestamp(fp)?;
    let image_name = read_image_name(fp)?;
    let metadata = read_metadata(fp)?;
    Ok(SaveHeader {
        data_size,
        crc,
        timestamp,
        image_name,
        metadata,
    })
}

/// Read the name of the image a saved state belongs to. Only the leading
/// fields are read, so this works on any reader with no VM state at all.
pub fn restore_get_image<R: Read + ?Sized>(fp: &mut R) -> Result<String> {
    restore_get_image_bounded(fp, usize::MAX)
}

/// As [`restore_get_image`], failing with [`VmError::ReadFile`] when the
/// stored name is longer than `capacity` bytes.
pub fn restore_get_image_bounded<R: Read + ?Sized>(fp: &mut R, capacity: usize) -> Result<String> {
    let mut buf = [0u8; SAVE_SIGNATURE.len() + 8 + TIMESTAMP_LEN];
    if read_upto(fp, &mut buf)? != buf.len() {
        return Err(VmError::ReadFile(io::ErrorKind::UnexpectedEof.into()));
    }
    if &buf[..SAVE_SIGNATURE.len()] != SAVE_SIGNATURE {
        return Err(VmError::NotSavedState);
    }

    let len = usize::from(fp.read_u16::<LittleEndian>().map_err(VmError::ReadFile)?);
    if len > capacity {
        return Err(VmError::ReadFile(io::Error::new(
            io::ErrorKind::InvalidData,
            "image name exceeds buffer",
        )));
    }
    let mut name = vec![0u8; len];
    fp.read_exact(&mut name).map_err(VmError::ReadFile)?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}
