use thiserror::Error;

// Hard failure categories. Lookup misses are Option returns, and unknown
// opcodes or section stamps are logged and skipped, not raised.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NitroError {
    #[error("compressed stream exhausted before declared output size")]
    OutOfData,

    #[error("malformed container: {0}")]
    MalformedContainer(&'static str),

    #[error("unsupported format {0:#04x}")]
    UnsupportedFormat(u8),
}
