//! The GRIB decode seam.
//!
//! The pipeline only needs three things from a decoded message: named
//! attributes, the grid shape, and the dense value array. Everything
//! else about GRIB stays behind [`MessageDecode`]; production binds the
//! ecCodes library through [`EccodesDecode`], tests substitute fakes.

use std::path::Path;

use bytes::Bytes;

use crate::error::Result;

/// One decoded meteorological message.
pub trait GribMessage {
    /// Read a message attribute by its ecCodes key name, e.g.
    /// `validityTime` or `perturbationNumber`. `None` when the message
    /// does not carry the key.
    fn attribute(&self, name: &str) -> Option<String>;

    /// `(nx, ny)` of the encoded grid.
    fn grid_shape(&self) -> Result<(usize, usize)>;

    /// The dense value array, row-major, `nx * ny` values.
    fn values(&self) -> Result<Vec<f32>>;
}

/// Callback invoked per message, in file order.
pub type MessageFn<'a> = &'a mut dyn FnMut(&dyn GribMessage) -> Result<()>;

/// Iteration over the messages of a GRIB payload.
pub trait MessageDecode {
    fn iterate_file(&self, path: &Path, f: MessageFn) -> Result<()>;

    fn iterate_bytes(&self, data: Bytes, f: MessageFn) -> Result<()>;
}

/// Production decoder backed by ecCodes.
pub struct EccodesDecode;

mod eccodes_impl {
    use std::path::Path;

    use bytes::Bytes;
    use eccodes::{CodesHandle, FallibleStreamingIterator, KeyType, KeyedMessage, ProductKind};

    use super::{EccodesDecode, GribMessage, MessageDecode, MessageFn};
    use crate::error::{IngestError, Result};

    struct EccodesMessage<'a>(&'a KeyedMessage);

    impl GribMessage for EccodesMessage<'_> {
        fn attribute(&self, name: &str) -> Option<String> {
            let key = self.0.read_key(name).ok()?;
            match key.value {
                KeyType::Str(s) => Some(s),
                KeyType::Int(i) => Some(i.to_string()),
                KeyType::Float(f) => Some(f.to_string()),
                _ => None,
            }
        }

        fn grid_shape(&self) -> Result<(usize, usize)> {
            let read_dim = |name: &str| -> Result<usize> {
                match self.0.read_key(name).map_err(decode_err)?.value {
                    KeyType::Int(v) if v > 0 => Ok(v as usize),
                    other => Err(IngestError::Decode(format!(
                        "unexpected {name} key: {other:?}"
                    ))),
                }
            };
            Ok((read_dim("Ni")?, read_dim("Nj")?))
        }

        fn values(&self) -> Result<Vec<f32>> {
            match self.0.read_key("values").map_err(decode_err)?.value {
                KeyType::FloatArray(values) => {
                    Ok(values.into_iter().map(|v| v as f32).collect())
                }
                other => Err(IngestError::Decode(format!(
                    "unexpected values key: {other:?}"
                ))),
            }
        }
    }

    impl MessageDecode for EccodesDecode {
        fn iterate_file(&self, path: &Path, f: MessageFn) -> Result<()> {
            let mut handle =
                CodesHandle::new_from_file(path, ProductKind::GRIB).map_err(decode_err)?;
            while let Some(message) = handle.next().map_err(decode_err)? {
                f(&EccodesMessage(message))?;
            }
            Ok(())
        }

        fn iterate_bytes(&self, data: Bytes, f: MessageFn) -> Result<()> {
            let mut handle =
                CodesHandle::new_from_memory(data, ProductKind::GRIB).map_err(decode_err)?;
            while let Some(message) = handle.next().map_err(decode_err)? {
                f(&EccodesMessage(message))?;
            }
            Ok(())
        }
    }

    fn decode_err(e: eccodes::errors::CodesError) -> IngestError {
        IngestError::Decode(e.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory decoder fakes shared by the fetcher and elevation tests.

    use std::collections::HashMap;
    use std::path::Path;

    use bytes::Bytes;

    use super::{GribMessage, MessageDecode, MessageFn};
    use crate::error::{IngestError, Result};

    /// A fully materialized fake message.
    #[derive(Debug, Clone)]
    pub struct FakeMessage {
        pub attributes: HashMap<String, String>,
        pub nx: usize,
        pub ny: usize,
        pub values: Vec<f32>,
    }

    impl FakeMessage {
        pub fn filled(nx: usize, ny: usize, value: f32) -> Self {
            Self {
                attributes: HashMap::new(),
                nx,
                ny,
                values: vec![value; nx * ny],
            }
        }

        pub fn with_attribute(mut self, name: &str, value: impl ToString) -> Self {
            self.attributes.insert(name.to_string(), value.to_string());
            self
        }
    }

    impl GribMessage for FakeMessage {
        fn attribute(&self, name: &str) -> Option<String> {
            self.attributes.get(name).cloned()
        }

        fn grid_shape(&self) -> Result<(usize, usize)> {
            Ok((self.nx, self.ny))
        }

        fn values(&self) -> Result<Vec<f32>> {
            Ok(self.values.clone())
        }
    }

    /// Decoder fake: yields a canned message list per payload key. Both
    /// files and byte buffers are keyed by their UTF-8 contents, so a
    /// fake transport just writes the key as the payload.
    #[derive(Default)]
    pub struct FakeDecode {
        pub by_key: HashMap<String, Vec<FakeMessage>>,
    }

    impl FakeDecode {
        fn run(&self, key: &str, f: MessageFn) -> Result<()> {
            let messages = self
                .by_key
                .get(key)
                .ok_or_else(|| IngestError::Decode(format!("no fake payload '{key}'")))?;
            for message in messages {
                f(message)?;
            }
            Ok(())
        }
    }

    impl MessageDecode for FakeDecode {
        fn iterate_file(&self, path: &Path, f: MessageFn) -> Result<()> {
            let key = std::fs::read_to_string(path)?;
            self.run(&key, f)
        }

        fn iterate_bytes(&self, data: Bytes, f: MessageFn) -> Result<()> {
            let key = String::from_utf8_lossy(&data).to_string();
            self.run(&key, f)
        }
    }
}
