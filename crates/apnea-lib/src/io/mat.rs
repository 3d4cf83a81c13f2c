//! Level 5 MAT-file reader and the `RR/`, `SAT/`, `LABELS/` directory loader.
//!
//! Supports numeric, char, cell and struct arrays, with or without zlib
//! compression. Sparse arrays, function handles and HDF5-based v7.3 files are
//! not decoded.

use crate::{
    config::{MatLayoutConfig, PipelineConfig},
    dataset::SequenceSource,
    error::{ApneaError, Result},
};
use flate2::read::ZlibDecoder;
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 128;

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;
const MI_UTF8: u32 = 16;
const MI_UTF16: u32 = 17;

const MX_CELL: u8 = 1;
const MX_STRUCT: u8 = 2;
const MX_OBJECT: u8 = 3;
const MX_CHAR: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum MatValue {
    /// Real part of a numeric or logical array, column-major.
    Numeric { dims: Vec<usize>, data: Vec<f64> },
    Char(String),
    Cell { dims: Vec<usize>, items: Vec<MatValue> },
    /// One entry per field; each holds the field value for every struct element.
    Struct { fields: Vec<(String, Vec<MatValue>)> },
    Unsupported { class: u8 },
}

impl MatValue {
    /// Concatenate every non-empty numeric sub-array in storage order.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            MatValue::Numeric { data, .. } => out.extend_from_slice(data),
            MatValue::Cell { items, .. } => items.iter().for_each(|item| item.flatten_into(out)),
            MatValue::Struct { fields } => fields
                .iter()
                .flat_map(|(_, values)| values)
                .for_each(|value| value.flatten_into(out)),
            MatValue::Char(_) | MatValue::Unsupported { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatVariable {
    pub name: String,
    pub value: MatValue,
}

impl MatVariable {
    /// Names the loader treats as file metadata rather than data.
    pub fn is_metadata(&self) -> bool {
        self.name.is_empty() || self.name.starts_with("__")
    }
}

struct Element<'a> {
    ty: u32,
    data: &'a [u8],
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Self {
            buf,
            pos: 0,
            big_endian,
        }
    }

    fn at_end(&self) -> bool {
        self.pos + 8 > self.buf.len()
    }

    /// Upper bound on how many more elements this reader can yield.
    fn max_elements(&self) -> usize {
        (self.buf.len() - self.pos) / 8
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                ApneaError::MatFormat(format!(
                    "element of {n} bytes at offset {} overruns buffer of {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        let bytes = [b[0], b[1], b[2], b[3]];
        Ok(if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn element(&mut self) -> Result<Element<'a>> {
        let word = self.u32()?;
        if word >> 16 != 0 {
            // small data element: type and size share the tag, payload padded to 4 bytes
            let ty = word & 0xFFFF;
            let n = (word >> 16) as usize;
            if n > 4 {
                return Err(ApneaError::MatFormat(format!(
                    "small element claims {n} bytes"
                )));
            }
            let data = self.take(4)?;
            return Ok(Element { ty, data: &data[..n] });
        }
        let n = self.u32()? as usize;
        let data = self.take(n)?;
        // compressed elements are not padded to an 8-byte boundary
        if n % 8 != 0 && word != MI_COMPRESSED {
            let pad = (8 - n % 8).min(self.buf.len() - self.pos);
            self.pos += pad;
        }
        Ok(Element { ty: word, data })
    }
}

fn numbers(el: &Element<'_>, big_endian: bool) -> Result<Vec<f64>> {
    macro_rules! decode {
        ($t:ty, $n:expr) => {
            el.data
                .chunks_exact($n)
                .map(|c| {
                    let mut b = [0u8; $n];
                    b.copy_from_slice(c);
                    (if big_endian {
                        <$t>::from_be_bytes(b)
                    } else {
                        <$t>::from_le_bytes(b)
                    }) as f64
                })
                .collect()
        };
    }
    Ok(match el.ty {
        MI_INT8 => el.data.iter().map(|&b| b as i8 as f64).collect(),
        MI_UINT8 | MI_UTF8 => el.data.iter().map(|&b| b as f64).collect(),
        MI_INT16 => decode!(i16, 2),
        MI_UINT16 | MI_UTF16 => decode!(u16, 2),
        MI_INT32 => decode!(i32, 4),
        MI_UINT32 => decode!(u32, 4),
        MI_SINGLE => decode!(f32, 4),
        MI_DOUBLE => decode!(f64, 8),
        MI_INT64 => decode!(i64, 8),
        MI_UINT64 => decode!(u64, 8),
        other => {
            return Err(ApneaError::MatFormat(format!(
                "data type {other} is not numeric"
            )))
        }
    })
}

fn text(el: &Element<'_>) -> String {
    String::from_utf8_lossy(el.data)
        .trim_end_matches('\0')
        .to_string()
}

/// Every cell or struct entry is a tagged element of at least 8 bytes.
fn check_entries(entries: usize, r: &Reader<'_>) -> Result<()> {
    if entries > r.max_elements() {
        return Err(ApneaError::MatFormat(format!(
            "{entries} entries declared but only room for {}",
            r.max_elements()
        )));
    }
    Ok(())
}

fn parse_matrix(data: &[u8], big_endian: bool) -> Result<(String, MatValue)> {
    if data.is_empty() {
        return Ok((
            String::new(),
            MatValue::Numeric {
                dims: vec![0, 0],
                data: Vec::new(),
            },
        ));
    }
    let mut r = Reader::new(data, big_endian);
    let flags = numbers(&r.element()?, big_endian)?;
    let class = flags.first().copied().unwrap_or(0.0) as u32 as u8;
    let dims: Vec<usize> = numbers(&r.element()?, big_endian)?
        .into_iter()
        .map(|d| d.max(0.0) as usize)
        .collect();
    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ApneaError::MatFormat(format!("dimensions {dims:?} overflow")))?;
    let name = text(&r.element()?);

    let value = match class {
        MX_CELL => {
            check_entries(count, &r)?;
            let mut items = Vec::new();
            for _ in 0..count {
                let el = r.element()?;
                if el.ty != MI_MATRIX {
                    return Err(ApneaError::MatFormat(format!(
                        "cell entry has type {}",
                        el.ty
                    )));
                }
                items.push(parse_matrix(el.data, big_endian)?.1);
            }
            MatValue::Cell { dims, items }
        }
        MX_STRUCT | MX_OBJECT => {
            if class == MX_OBJECT {
                r.element()?; // class name
            }
            let name_len = numbers(&r.element()?, big_endian)?
                .first()
                .copied()
                .unwrap_or(0.0) as usize;
            let names_el = r.element()?;
            let field_names: Vec<String> = if name_len == 0 {
                Vec::new()
            } else {
                names_el
                    .data
                    .chunks(name_len)
                    .map(|chunk| {
                        String::from_utf8_lossy(chunk)
                            .trim_end_matches('\0')
                            .to_string()
                    })
                    .collect()
            };
            let entries = count.checked_mul(field_names.len()).ok_or_else(|| {
                ApneaError::MatFormat(format!("struct of {dims:?} entries overflows"))
            })?;
            check_entries(entries, &r)?;
            let mut fields: Vec<(String, Vec<MatValue>)> =
                field_names.into_iter().map(|n| (n, Vec::new())).collect();
            for _ in 0..count {
                for (_, values) in fields.iter_mut() {
                    let el = r.element()?;
                    values.push(parse_matrix(el.data, big_endian)?.1);
                }
            }
            MatValue::Struct { fields }
        }
        MX_CHAR => {
            let el = r.element()?;
            let s = match el.ty {
                MI_UTF8 | MI_UINT8 | MI_INT8 => text(&el),
                _ => numbers(&el, big_endian)?
                    .into_iter()
                    .filter_map(|c| char::from_u32(c as u32))
                    .collect(),
            };
            MatValue::Char(s)
        }
        6..=15 => {
            let data = if count == 0 {
                Vec::new()
            } else {
                numbers(&r.element()?, big_endian)?
            };
            MatValue::Numeric { dims, data }
        }
        other => MatValue::Unsupported { class: other },
    };
    Ok((name, value))
}

fn parse_elements(buf: &[u8], big_endian: bool, out: &mut Vec<MatVariable>) -> Result<()> {
    let mut r = Reader::new(buf, big_endian);
    while !r.at_end() {
        let el = r.element()?;
        match el.ty {
            MI_MATRIX => {
                let (name, value) = parse_matrix(el.data, big_endian)?;
                out.push(MatVariable { name, value });
            }
            MI_COMPRESSED => {
                let mut inflated = Vec::new();
                ZlibDecoder::new(el.data)
                    .read_to_end(&mut inflated)
                    .map_err(|e| ApneaError::MatFormat(format!("bad zlib stream: {e}")))?;
                parse_elements(&inflated, big_endian, out)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse an in-memory MAT v5 file into its variables, in file order.
pub fn parse_mat(buf: &[u8]) -> Result<Vec<MatVariable>> {
    if buf.len() < HEADER_LEN {
        return Err(ApneaError::MatFormat(format!(
            "file is {} bytes, shorter than the {HEADER_LEN}-byte header",
            buf.len()
        )));
    }
    let big_endian = match &buf[126..128] {
        b"IM" => false,
        b"MI" => true,
        other => {
            return Err(ApneaError::MatFormat(format!(
                "unknown endian indicator {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    let version = if big_endian {
        u16::from_be_bytes([buf[124], buf[125]])
    } else {
        u16::from_le_bytes([buf[124], buf[125]])
    };
    if version == 0x0200 {
        return Err(ApneaError::MatFormat(
            "HDF5-based MAT v7.3 files are not supported".into(),
        ));
    }
    let mut vars = Vec::new();
    parse_elements(&buf[HEADER_LEN..], big_endian, &mut vars)?;
    Ok(vars)
}

pub fn read_mat(path: &Path) -> Result<Vec<MatVariable>> {
    let buf = fs::read(path).map_err(|e| ApneaError::io(path, e))?;
    parse_mat(&buf)
}

/// Flattened contents of the first non-metadata variable.
pub fn first_array(vars: &[MatVariable]) -> Option<Vec<f64>> {
    vars.iter()
        .find(|var| !var.is_metadata())
        .map(|var| var.value.flatten())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatSignal {
    Rr,
    Sat,
    Labels,
}

/// Loader over a root with one `.mat` file per record in each of the RR,
/// SAT and LABELS subfolders.
#[derive(Debug, Clone)]
pub struct MatDataLoader {
    root: PathBuf,
    layout: MatLayoutConfig,
}

impl MatDataLoader {
    pub fn new(root: impl Into<PathBuf>, cfg: &PipelineConfig) -> Self {
        let root = root.into();
        if !root.exists() {
            warn!("data directory {} does not exist", root.display());
        }
        Self {
            root,
            layout: cfg.mat.clone(),
        }
    }

    pub fn dir(&self, kind: MatSignal) -> PathBuf {
        let sub = match kind {
            MatSignal::Rr => &self.layout.rr_dir,
            MatSignal::Sat => &self.layout.sat_dir,
            MatSignal::Labels => &self.layout.labels_dir,
        };
        self.root.join(sub)
    }

    /// Record names from the RR folder, sorted.
    pub fn list_records(&self) -> Vec<String> {
        let dir = self.dir(MatSignal::Rr);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot list {}: {err}", dir.display());
                return Vec::new();
            }
        };
        let names: BTreeSet<String> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.eq_ignore_ascii_case("mat"))
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        info!("found {} .mat records in {}", names.len(), dir.display());
        names.into_iter().collect()
    }

    /// First data array of `{kind}/{name}.mat`; `None` (logged) on any failure.
    pub fn load(&self, kind: MatSignal, name: &str) -> Option<Vec<f64>> {
        let path = self.dir(kind).join(format!("{name}.mat"));
        match read_mat(&path) {
            Ok(vars) => {
                let data = first_array(&vars);
                if data.is_none() {
                    warn!("{} holds no data variables", path.display());
                }
                data
            }
            Err(err) => {
                error!("error loading {}: {err}", path.display());
                None
            }
        }
    }
}

impl SequenceSource for MatDataLoader {
    fn list_records(&self) -> Vec<String> {
        MatDataLoader::list_records(self)
    }

    fn load_sequence(&self, name: &str) -> Option<Vec<f64>> {
        self.load(MatSignal::Rr, name)
    }
}
