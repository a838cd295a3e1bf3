//! Reader and writer for NumPy `.npy` arrays of little-endian f32 in C order.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

#[derive(Error, Debug)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Memory mapping error: {0}")]
    MemoryMapping(String),
    #[error("Missing NPY magic")]
    InvalidMagic,
    #[error("Unsupported NPY version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("Malformed NPY header: {0}")]
    InvalidHeader(String),
    #[error("Unsupported dtype {0}, only '<f4' is readable")]
    UnsupportedDtype(String),
    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,
    #[error("Array data truncated: header promises {expected} bytes, file holds {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// A decoded array: its shape header plus the flattened data.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NpyArray {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Memory-map `path` and decode it.
pub fn read_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray, NpyError> {
    let file = File::open(path.as_ref())?;
    // Safety: the map is dropped before this function returns and never handed out.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| NpyError::MemoryMapping(e.to_string()))?;
    parse_npy(&mmap)
}

pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray, NpyError> {
    let mut reader = bytes;
    if reader.len() < MAGIC.len() + 2 || &reader[..MAGIC.len()] != MAGIC {
        return Err(NpyError::InvalidMagic);
    }
    reader = &reader[MAGIC.len()..];
    let major = reader.read_u8()?;
    let minor = reader.read_u8()?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };
    if reader.len() < header_len {
        return Err(NpyError::InvalidHeader(format!("header length {header_len} exceeds file")));
    }
    let header = std::str::from_utf8(&reader[..header_len]).map_err(|_| NpyError::InvalidHeader("header is not UTF-8".into()))?;
    let (descr, fortran_order, shape) = parse_header(header)?;
    if descr != "<f4" {
        return Err(NpyError::UnsupportedDtype(descr));
    }
    if fortran_order {
        return Err(NpyError::FortranOrder);
    }

    let mut payload = &reader[header_len..];
    let count = shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| NpyError::InvalidHeader(format!("shape {shape:?} overflows the element count")))?;
    let expected = count
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| NpyError::InvalidHeader(format!("shape {shape:?} overflows the byte size")))?;
    if payload.len() < expected {
        return Err(NpyError::Truncated {
            expected,
            actual: payload.len(),
        });
    }
    let mut data = vec![0.0f32; count];
    payload.read_f32_into::<LittleEndian>(&mut data)?;
    Ok(NpyArray { shape, data })
}

fn parse_header(header: &str) -> Result<(String, bool, Vec<usize>), NpyError> {
    let descr = dict_value(header, "descr")?
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    let fortran_order = match dict_value(header, "fortran_order")? {
        "True" => true,
        "False" => false,
        other => return Err(NpyError::InvalidHeader(format!("fortran_order = {other}"))),
    };

    let shape_start = header
        .find("'shape'")
        .and_then(|at| header[at..].find('(').map(|open| at + open + 1))
        .ok_or_else(|| NpyError::InvalidHeader("missing shape".into()))?;
    let shape_end = header[shape_start..]
        .find(')')
        .map(|close| shape_start + close)
        .ok_or_else(|| NpyError::InvalidHeader("unterminated shape".into()))?;
    let shape = header[shape_start..shape_end]
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.parse::<usize>().map_err(|_| NpyError::InvalidHeader(format!("bad dimension '{dim}'"))))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((descr, fortran_order, shape))
}

/// Scalar value for `key` in the header's python dict literal.
fn dict_value<'h>(header: &'h str, key: &str) -> Result<&'h str, NpyError> {
    let quoted = format!("'{key}'");
    let at = header
        .find(&quoted)
        .ok_or_else(|| NpyError::InvalidHeader(format!("missing {key}")))?;
    let rest = &header[at + quoted.len()..];
    let rest = rest
        .trim_start()
        .strip_prefix(':')
        .ok_or_else(|| NpyError::InvalidHeader(format!("no value for {key}")))?;
    let end = rest.find(',').unwrap_or(rest.len());
    Ok(rest[..end].trim())
}

/// Encode an array as NPY version 1.0.
pub fn write_npy<W: Write>(mut writer: W, shape: &[usize], data: &[f32]) -> Result<(), NpyError> {
    let count: usize = shape.iter().product();
    if count != data.len() {
        return Err(NpyError::InvalidHeader(format!("shape {shape:?} holds {count} elements, data has {}", data.len())));
    }
    let dims = match shape {
        [single] => format!("{single},"),
        dims => dims.iter().map(usize::to_string).collect::<Vec<_>>().join(", "),
    };
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({dims}), }}");
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN));
    header.push('\n');

    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_u16::<LittleEndian>(header.len() as u16)?;
    writer.write_all(header.as_bytes())?;
    for value in data {
        writer.write_f32::<LittleEndian>(*value)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_npy<P: AsRef<Path>>(path: P, shape: &[usize], data: &[f32]) -> Result<(), NpyError> {
    let file = File::create(path)?;
    write_npy(io::BufWriter::new(file), shape, data)
}
