pub mod model;
pub mod primitive;
pub mod vmd;

use crate::error::Error;
use nom::IResult;

pub(crate) type Result<'a, T> = IResult<&'a [u8], T, Error>;

/// Unwraps a nom result at the decoder boundary, discarding the remaining
/// input and flattening the error wrapper into our own type.
pub(crate) fn finish<T>(res: Result<T>) -> std::result::Result<T, Error> {
    match res {
        Ok((_, value)) => Ok(value),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(..)) => Err(Error::TruncatedData),
    }
}

/// Text codec used for the name and comment fields of a file. PMX declares
/// UTF-16LE or UTF-8 in its header; the legacy formats are always Shift-JIS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    Utf16Le,
    Utf8,
    ShiftJis,
}

impl TextCodec {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextCodec::Utf16Le => encoding_rs::UTF_16LE.decode(bytes).0.into_owned(),
            TextCodec::Utf8 => encoding_rs::UTF_8.decode(bytes).0.into_owned(),
            TextCodec::ShiftJis => encoding_rs::SHIFT_JIS.decode(bytes).0.into_owned(),
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            // encoding_rs has no UTF-16 encoder, the pairs are emitted by hand.
            TextCodec::Utf16Le => text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            TextCodec::Utf8 => text.as_bytes().to_vec(),
            TextCodec::ShiftJis => encoding_rs::SHIFT_JIS.encode(text).0.into_owned(),
        }
    }
}

/// Width in bytes of an index field, declared per element list in the PMX
/// header. The legacy format uses fixed widths instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    Bytes1,
    Bytes2,
    Bytes4,
}

impl IndexWidth {
    /// Returns the width in bytes.
    pub fn bytes_num(self) -> usize {
        match self {
            IndexWidth::Bytes1 => 1,
            IndexWidth::Bytes2 => 2,
            IndexWidth::Bytes4 => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(IndexWidth::Bytes1),
            2 => Some(IndexWidth::Bytes2),
            4 => Some(IndexWidth::Bytes4),
            _ => None,
        }
    }

    /// Smallest width able to hold any index below `len` when the field is
    /// stored unsigned (the vertex index convention).
    pub fn for_count(len: usize) -> Self {
        if len <= usize::from(u8::MAX) {
            IndexWidth::Bytes1
        } else if len <= usize::from(u16::MAX) {
            IndexWidth::Bytes2
        } else {
            IndexWidth::Bytes4
        }
    }

    /// Smallest width able to hold any index below `len` when the field is
    /// stored signed with -1 meaning "no reference" (every other index kind).
    pub fn for_signed_count(len: usize) -> Self {
        if len <= i8::MAX as usize {
            IndexWidth::Bytes1
        } else if len <= i16::MAX as usize {
            IndexWidth::Bytes2
        } else {
            IndexWidth::Bytes4
        }
    }
}
