use thiserror::Error;

#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("unexpected end of input")]
    Eof,
    #[error("unknown token {0}")]
    UnknownToken(u8),
    #[error("invalid node: {0}")]
    InvalidNode(&'static str),
    #[error("attribute key is not a string")]
    NonStringKey,
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("string too long for packed encoding: {0} chars")]
    PackedTooLong(usize),
    #[error("invalid packed nibble {0}")]
    InvalidPackedByte(u8),
    #[error("missing required attribute '{0}'")]
    MissingAttr(String),
    #[error("failed to parse attribute: {0}")]
    AttrParse(String),
    #[error("frame is compressed but decompression failed: {0}")]
    Decompress(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for BinaryError {
    fn clone(&self) -> Self {
        match self {
            Self::Eof => Self::Eof,
            Self::UnknownToken(t) => Self::UnknownToken(*t),
            Self::InvalidNode(s) => Self::InvalidNode(s),
            Self::NonStringKey => Self::NonStringKey,
            Self::InvalidUtf8(e) => Self::InvalidUtf8(*e),
            Self::PackedTooLong(n) => Self::PackedTooLong(*n),
            Self::InvalidPackedByte(b) => Self::InvalidPackedByte(*b),
            Self::MissingAttr(s) => Self::MissingAttr(s.clone()),
            Self::AttrParse(s) => Self::AttrParse(s.clone()),
            Self::Decompress(s) => Self::Decompress(s.clone()),
            Self::Io(e) => Self::AttrParse(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BinaryError>;
