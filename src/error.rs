use std::fmt;

/// Failure taxonomy for the whole engine. Every variant is fatal to the
/// current pack/unpack operation; nothing here is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not a recognized ELF image (magic/class/data/machine/version).
    InvalidFormat(&'static str),
    /// Structurally valid ELF that violates a packing precondition.
    CantPack(String),
    /// The input already carries this engine's signature.
    AlreadyPacked,
    /// PT_DYNAMIC walk failed (no DT_NULL, conflicting duplicate tags, ...).
    MalformedDynamic(&'static str),
    /// SysV or GNU hash table failed a consistency check.
    CorruptHashTable(&'static str),
    /// A field access would read or write past the buffer end.
    OutOfBounds,
    /// The compressed stream or its block records are inconsistent.
    CompressedDataViolation(&'static str),
    /// Reconstructed bytes do not match the recorded checksums or size.
    ChecksumError,
    /// Codec-level failure reported by the compressor backend.
    Compression(String),
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidFormat(why) => write!(f, "not a supported ELF image: {}", why),
            Error::CantPack(why) => write!(f, "cannot pack: {}", why),
            Error::AlreadyPacked => write!(f, "already packed by this tool"),
            Error::MalformedDynamic(why) => write!(f, "malformed dynamic segment: {}", why),
            Error::CorruptHashTable(why) => write!(f, "corrupt hash table: {}", why),
            Error::OutOfBounds => write!(f, "field access outside file bounds"),
            Error::CompressedDataViolation(why) => {
                write!(f, "compressed data violation: {}", why)
            }
            Error::ChecksumError => write!(f, "checksum mismatch"),
            Error::Compression(why) => write!(f, "compression backend: {}", why),
            Error::Io(why) => write!(f, "i/o: {}", why),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    pub fn cant_pack(why: impl Into<String>) -> Error {
        Error::CantPack(why.into())
    }
}
