//! GGUF header reader.
//!
//! Reads the fixed header and metadata key/value section of a GGUF file
//! without touching tensor data. The session manager runs this before tearing
//! down an existing session, so a bad path or a non-GGUF file never costs the
//! user their loaded model.

use jarvis_core::{LoadError, ModelHeader};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Upper bound for a single metadata string. Anything larger is corruption.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

// Metadata value type tags.
const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

#[derive(Debug)]
enum Value {
    Int(i128),
    Str(String),
    Other,
}

/// Validate `path` as a GGUF model and recover its header metadata.
pub fn read_header(path: &Path) -> Result<ModelHeader, LoadError> {
    let file = File::open(path).map_err(|_| LoadError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
        return Err(LoadError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let mut reader = HeaderReader::new(BufReader::new(file));
    reader.parse().map_err(|e| {
        LoadError::InvalidFormat(format!("{}: {}", path.display(), e))
    })
}

struct HeaderReader<R> {
    inner: R,
    version: u32,
}

impl<R: Read> HeaderReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, version: 0 }
    }

    fn parse(&mut self) -> Result<ModelHeader, String> {
        let mut magic = [0u8; 4];
        self.inner
            .read_exact(&mut magic)
            .map_err(|_| "file too short for a GGUF header".to_string())?;
        if magic != GGUF_MAGIC {
            return Err("missing GGUF magic".into());
        }

        self.version = self.u32().map_err(io_err)?;
        if !(1..=3).contains(&self.version) {
            return Err(format!("unsupported GGUF version {}", self.version));
        }

        let tensor_count = self.count().map_err(io_err)?;
        let kv_count = self.count().map_err(io_err)?;

        let mut header = ModelHeader {
            format_version: self.version,
            architecture: None,
            name: None,
            context_length: None,
            chat_template: None,
            tensor_count,
        };
        let mut context_lengths: Vec<(String, i128)> = Vec::new();

        for _ in 0..kv_count {
            let key = self.string().map_err(io_err)?;
            let value_type = self.u32().map_err(io_err)?;
            let value = self.value(value_type)?;

            match (key.as_str(), value) {
                ("general.architecture", Value::Str(s)) => header.architecture = Some(s),
                ("general.name", Value::Str(s)) => header.name = Some(s),
                ("tokenizer.chat_template", Value::Str(s)) => header.chat_template = Some(s),
                (k, Value::Int(n)) if k.ends_with(".context_length") => {
                    context_lengths.push((k.to_string(), n));
                }
                _ => {}
            }
        }

        // The key is prefixed with the architecture, which may appear after it.
        if let Some(arch) = &header.architecture {
            let wanted = format!("{arch}.context_length");
            header.context_length = context_lengths
                .iter()
                .find(|(k, _)| *k == wanted)
                .and_then(|(_, n)| usize::try_from(*n).ok())
                .filter(|n| *n > 0);
        }

        Ok(header)
    }

    fn value(&mut self, value_type: u32) -> Result<Value, String> {
        let v = match value_type {
            TYPE_U8 => Value::Int(self.u8().map_err(io_err)? as i128),
            TYPE_I8 => Value::Int(self.u8().map_err(io_err)? as i8 as i128),
            TYPE_U16 => Value::Int(u16::from_le_bytes(self.bytes().map_err(io_err)?) as i128),
            TYPE_I16 => Value::Int(i16::from_le_bytes(self.bytes().map_err(io_err)?) as i128),
            TYPE_U32 => Value::Int(self.u32().map_err(io_err)? as i128),
            TYPE_I32 => Value::Int(i32::from_le_bytes(self.bytes().map_err(io_err)?) as i128),
            TYPE_U64 => Value::Int(self.u64().map_err(io_err)? as i128),
            TYPE_I64 => Value::Int(i64::from_le_bytes(self.bytes().map_err(io_err)?) as i128),
            TYPE_F32 => {
                self.bytes::<4>().map_err(io_err)?;
                Value::Other
            }
            TYPE_F64 => {
                self.bytes::<8>().map_err(io_err)?;
                Value::Other
            }
            TYPE_BOOL => {
                self.u8().map_err(io_err)?;
                Value::Other
            }
            TYPE_STRING => Value::Str(self.string().map_err(io_err)?),
            TYPE_ARRAY => {
                let item_type = self.u32().map_err(io_err)?;
                if item_type == TYPE_ARRAY {
                    return Err("nested metadata arrays are not supported".into());
                }
                let len = self.count().map_err(io_err)?;
                for _ in 0..len {
                    self.value(item_type)?;
                }
                Value::Other
            }
            other => return Err(format!("unknown metadata value type {other}")),
        };
        Ok(v)
    }

    fn bytes<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    /// Counts and lengths are 32-bit in version 1, 64-bit afterwards.
    fn count(&mut self) -> io::Result<u64> {
        if self.version == 1 {
            self.u32().map(u64::from)
        } else {
            self.u64()
        }
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.count()?;
        if len > MAX_STRING_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("metadata string of {len} bytes"),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn io_err(e: io::Error) -> String {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => "truncated GGUF metadata".into(),
        _ => e.to_string(),
    }
}

/// Builder for minimal GGUF files (metadata only, no tensors).
#[cfg(any(test, feature = "test-utils"))]
pub struct GgufStub {
    strings: Vec<(String, String)>,
    ints: Vec<(String, u32)>,
}

#[cfg(any(test, feature = "test-utils"))]
impl GgufStub {
    pub fn new(architecture: &str) -> Self {
        Self {
            strings: vec![("general.architecture".into(), architecture.into())],
            ints: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.strings.push(("general.name".into(), name.into()));
        self
    }

    pub fn chat_template(mut self, template: &str) -> Self {
        self.strings.push(("tokenizer.chat_template".into(), template.into()));
        self
    }

    pub fn context_length(mut self, n: u32) -> Self {
        let arch = self.strings[0].1.clone();
        self.ints.push((format!("{arch}.context_length"), n));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }

        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&((self.strings.len() + self.ints.len()) as u64).to_le_bytes());
        for (k, v) in &self.strings {
            put_str(&mut out, k);
            out.extend_from_slice(&TYPE_STRING.to_le_bytes());
            put_str(&mut out, v);
        }
        for (k, v) in &self.ints {
            put_str(&mut out, k);
            out.extend_from_slice(&TYPE_U32.to_le_bytes());
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }
}
