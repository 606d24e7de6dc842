//! On-disk layout: header encoding and the fixed-width value codecs.

use std::io::{Read, Write};

use crate::{Result, StoreError};

pub(crate) const MAGIC: &[u8; 4] = b"CST1";
pub(crate) const VERSION: u8 = 1;

/// Header occupies a fixed prefix so value offsets are computable.
pub(crate) const HEADER_LEN: usize = 48;

/// Value codec for a store file.
///
/// Both codecs are fixed-width so any `(dim0, dim1)` cell is seekable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Raw little-endian `f32`. Used for series whose magnitude grows
    /// without bound (accumulated variables).
    Float32,
    /// `round(value * scale_factor)` stored as `i16`, NaN as `i16::MIN`.
    ScaledInt16,
}

impl Compression {
    pub(crate) fn code(self) -> u8 {
        match self {
            Compression::Float32 => 0,
            Compression::ScaledInt16 => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compression::Float32),
            1 => Ok(Compression::ScaledInt16),
            other => Err(StoreError::UnknownCompression(other)),
        }
    }

    /// Bytes per stored value.
    pub(crate) fn value_width(self) -> usize {
        match self {
            Compression::Float32 => 4,
            Compression::ScaledInt16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub dim0: usize,
    pub dim1: usize,
    pub chunk0: usize,
    pub chunk1: usize,
    pub compression: Compression,
    pub scale_factor: f32,
}

impl Header {
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.compression.code();
        buf[8..16].copy_from_slice(&(self.dim0 as u64).to_le_bytes());
        buf[16..24].copy_from_slice(&(self.dim1 as u64).to_le_bytes());
        buf[24..32].copy_from_slice(&(self.chunk0 as u64).to_le_bytes());
        buf[32..40].copy_from_slice(&(self.chunk1 as u64).to_le_bytes());
        buf[40..44].copy_from_slice(&self.scale_factor.to_le_bytes());
        out.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from(input: &mut impl Read) -> Result<Self> {
        let mut buf = [0u8; HEADER_LEN];
        input.read_exact(&mut buf)?;
        if &buf[0..4] != MAGIC {
            return Err(StoreError::BadMagic(format!("{:?}", &buf[0..4])));
        }
        if buf[4] != VERSION {
            return Err(StoreError::UnsupportedVersion(buf[4]));
        }
        let compression = Compression::from_code(buf[5])?;
        let dim0 = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let dim1 = u64::from_le_bytes(buf[16..24].try_into().unwrap()) as usize;
        let chunk0 = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;
        let chunk1 = u64::from_le_bytes(buf[32..40].try_into().unwrap()) as usize;
        let scale_factor = f32::from_le_bytes(buf[40..44].try_into().unwrap());
        Ok(Header {
            dim0,
            dim1,
            chunk0,
            chunk1,
            compression,
            scale_factor,
        })
    }
}

/// Encode a run of values into `out`.
pub(crate) fn encode_values(
    values: &[f32],
    compression: Compression,
    scale_factor: f32,
    out: &mut Vec<u8>,
) {
    match compression {
        Compression::Float32 => {
            out.reserve(values.len() * 4);
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Compression::ScaledInt16 => {
            out.reserve(values.len() * 2);
            for v in values {
                let q = if v.is_nan() {
                    i16::MIN
                } else {
                    let scaled = (v * scale_factor).round();
                    // i16::MIN is reserved for NaN
                    scaled.clamp((i16::MIN + 1) as f32, i16::MAX as f32) as i16
                };
                out.extend_from_slice(&q.to_le_bytes());
            }
        }
    }
}

/// Decode `count` values from `bytes` into `out`.
pub(crate) fn decode_values(
    bytes: &[u8],
    compression: Compression,
    scale_factor: f32,
    out: &mut Vec<f32>,
) {
    match compression {
        Compression::Float32 => {
            for chunk in bytes.chunks_exact(4) {
                out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
            }
        }
        Compression::ScaledInt16 => {
            for chunk in bytes.chunks_exact(2) {
                let q = i16::from_le_bytes(chunk.try_into().unwrap());
                if q == i16::MIN {
                    out.push(f32::NAN);
                } else {
                    out.push(q as f32 / scale_factor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            dim0: 12,
            dim1: 3400,
            chunk0: 1,
            chunk1: 600,
            compression: Compression::ScaledInt16,
            scale_factor: 20.0,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let read = Header::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(read.dim0, 12);
        assert_eq!(read.dim1, 3400);
        assert_eq!(read.chunk1, 600);
        assert_eq!(read.compression, Compression::ScaledInt16);
        assert_eq!(read.scale_factor, 20.0);
    }

    #[test]
    fn scaled_int16_preserves_nan() {
        let values = [1.25, f32::NAN, -3.5];
        let mut bytes = Vec::new();
        encode_values(&values, Compression::ScaledInt16, 20.0, &mut bytes);

        let mut decoded = Vec::new();
        decode_values(&bytes, Compression::ScaledInt16, 20.0, &mut decoded);
        assert_eq!(decoded[0], 1.25);
        assert!(decoded[1].is_nan());
        assert_eq!(decoded[2], -3.5);
    }

    #[test]
    fn scaled_int16_clamps_out_of_range() {
        let values = [1e9, -1e9];
        let mut bytes = Vec::new();
        encode_values(&values, Compression::ScaledInt16, 1.0, &mut bytes);

        let mut decoded = Vec::new();
        decode_values(&bytes, Compression::ScaledInt16, 1.0, &mut decoded);
        assert_eq!(decoded[0], i16::MAX as f32);
        // MIN is the NaN sentinel, so the clamp stops one short
        assert_eq!(decoded[1], (i16::MIN + 1) as f32);
    }
}
