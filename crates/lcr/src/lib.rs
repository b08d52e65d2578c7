//! LCR1: single-band i16 raster container for land-cover grids and height masks.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"LCR1"
//!   04  : u32     version = 1
//!   08  : u32     flags (bitfield)
//!                 bit 0 => CRS string present
//!                 bit 1 => nodata value meaningful
//!                 bit 2 => payload is RLE
//!   0C  : u32     width
//!   10  : u32     height
//!   14  : i16     nodata
//!   16  : u16     reserved (0)
//!   18  : f64[6]  affine transform a b c d e f
//!                 x = a*col + b*row + c, y = d*col + e*row + f
//!   ..  : u16 crs_len + crs_len bytes of UTF-8   (if bit0)
//!   ..  : u32 payload_size + payload
//!
//! Payload: width*height raw i16 cells, row-major, or
//! RLE repeated [u16 run_len][i16 value].

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

pub const LCR_MAGIC: [u8; 4] = *b"LCR1";
pub const LCR_VERSION: u32 = 1;

const FLAG_CRS: u32 = 1 << 0;
const FLAG_NODATA: u32 = 1 << 1;
const FLAG_RLE: u32 = 1 << 2;
const KNOWN_FLAGS: u32 = FLAG_CRS | FLAG_NODATA | FLAG_RLE;

/// Fixed header size up to the optional CRS block.
pub const HEADER_LEN: usize = 0x18 + 6 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Raw,
    Rle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterFile {
    pub width: u32,
    pub height: u32,
    pub transform: [f64; 6],
    pub crs: Option<String>,
    pub nodata: Option<i16>,
    /// Row-major, `width * height` values.
    pub cells: Vec<i16>,
}

impl RasterFile {
    #[inline]
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, col: u32, row: u32) -> Option<i16> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.cells.get(row as usize * self.width as usize + col as usize).copied()
    }
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated LCR1"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_i16(buf: &mut &[u8]) -> io::Result<i16> {
    let b = take(buf, 2)?;
    Ok(i16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f64(buf: &mut &[u8]) -> io::Result<f64> {
    let b = take(buf, 8)?;
    Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Parse LCR1 from a contiguous byte slice.
pub fn parse_lcr_bytes(mut p: &[u8]) -> io::Result<RasterFile> {
    if take(&mut p, 4)? != LCR_MAGIC {
        return Err(bad("bad LCR1 magic"));
    }

    let version = le_u32(&mut p)?;
    if version != LCR_VERSION {
        return Err(bad(&format!("unsupported LCR1 version {version}")));
    }

    let flags = le_u32(&mut p)?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(bad(&format!("unknown LCR1 flags {flags:#x}")));
    }

    let width = le_u32(&mut p)?;
    let height = le_u32(&mut p)?;
    let nodata = le_i16(&mut p)?;
    let _reserved = le_u16(&mut p)?;

    let mut transform = [0f64; 6];
    for t in &mut transform {
        *t = le_f64(&mut p)?;
    }

    let crs = if flags & FLAG_CRS != 0 {
        let len = le_u16(&mut p)? as usize;
        let raw = take(&mut p, len)?;
        let s = std::str::from_utf8(raw).map_err(|_| bad("CRS is not UTF-8"))?;
        Some(s.to_owned())
    } else {
        None
    };

    let count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| bad("raster size overflow"))?;

    let payload_size = le_u32(&mut p)? as usize;
    let payload = take(&mut p, payload_size)?;

    let cells = if flags & FLAG_RLE != 0 {
        decode_rle(payload, count)?
    } else {
        decode_raw(payload)?
    };

    if cells.len() != count {
        return Err(bad(&format!(
            "payload holds {} cells, expected {width}x{height}",
            cells.len()
        )));
    }

    Ok(RasterFile {
        width,
        height,
        transform,
        crs,
        nodata: (flags & FLAG_NODATA != 0).then_some(nodata),
        cells,
    })
}

fn decode_raw(raw: &[u8]) -> io::Result<Vec<i16>> {
    if raw.len() % 2 != 0 {
        return Err(bad("raw payload has an odd byte count"));
    }

    #[cfg(target_endian = "little")]
    {
        // The payload offset depends on the CRS length, so it is not always
        // 2-aligned; fall through to the portable decode when it is not.
        if let Ok(cells) = bytemuck::try_cast_slice::<u8, i16>(raw) {
            return Ok(cells.to_vec());
        }
    }

    Ok(raw
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<RasterFile> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_lcr_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<RasterFile> {
    let bytes = std::fs::read(path)?;
    parse_lcr_bytes(&bytes)
}

pub fn write_file<P: AsRef<Path>>(path: P, raster: &RasterFile, encoding: Encoding) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_to(&mut out, raster, encoding)?;
    out.flush()
}

/// Serialize `raster` into `w`.
pub fn write_to<W: Write>(w: &mut W, raster: &RasterFile, encoding: Encoding) -> io::Result<()> {
    if raster.cells.len() != raster.len() {
        return Err(bad("cells length != width * height"));
    }

    let mut flags = 0u32;
    if raster.crs.is_some() {
        flags |= FLAG_CRS;
    }
    if raster.nodata.is_some() {
        flags |= FLAG_NODATA;
    }
    if encoding == Encoding::Rle {
        flags |= FLAG_RLE;
    }

    w.write_all(&LCR_MAGIC)?;
    write_u32(w, LCR_VERSION)?;
    write_u32(w, flags)?;
    write_u32(w, raster.width)?;
    write_u32(w, raster.height)?;
    w.write_all(&raster.nodata.unwrap_or(0).to_le_bytes())?;
    write_u16(w, 0)?;

    for t in raster.transform {
        w.write_all(&t.to_le_bytes())?;
    }

    if let Some(crs) = raster.crs.as_deref() {
        let len = u16::try_from(crs.len()).map_err(|_| bad("CRS longer than 65535 bytes"))?;
        write_u16(w, len)?;
        w.write_all(crs.as_bytes())?;
    }

    let payload = match encoding {
        Encoding::Raw => encode_raw(&raster.cells),
        Encoding::Rle => encode_rle(&raster.cells),
    };
    let size = u32::try_from(payload.len()).map_err(|_| bad("payload exceeds 4 GiB"))?;
    write_u32(w, size)?;
    w.write_all(&payload)
}

fn encode_raw(cells: &[i16]) -> Vec<u8> {
    #[cfg(target_endian = "little")]
    {
        bytemuck::cast_slice::<i16, u8>(cells).to_vec()
    }

    #[cfg(not(target_endian = "little"))]
    {
        cells.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

pub fn encode_rle(raw: &[i16]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(raw.len() / 4);
    if raw.is_empty() {
        return out;
    }

    let mut i = 0usize;
    while i < raw.len() {
        let value = raw[i];
        let mut run_length = 1usize;

        while i + run_length < raw.len()
            && raw[i + run_length] == value
            && run_length < u16::MAX as usize
        {
            run_length += 1;
        }

        out.extend_from_slice(&(run_length as u16).to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
        i += run_length;
    }

    out
}

/// Expand `[u16 run][i16 value]` pairs into at most `count` cells. A payload
/// that would expand past `count` is rejected before it is materialized.
pub fn decode_rle(rle: &[u8], count: usize) -> io::Result<Vec<i16>> {
    if rle.len() % 4 != 0 {
        return Err(io::Error::new(ErrorKind::InvalidData, "RLE payload truncated"));
    }

    let mut out = Vec::<i16>::with_capacity(count.min((rle.len() / 4).saturating_mul(u16::MAX as usize)));
    for pair in rle.chunks_exact(4) {
        let run = u16::from_le_bytes([pair[0], pair[1]]) as usize;
        let v = i16::from_le_bytes([pair[2], pair[3]]);
        if out.len() + run > count {
            return Err(bad(&format!("RLE payload expands past {count} cells")));
        }
        out.resize(out.len() + run, v);
    }

    Ok(out)
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
