use super::{IndexWidth, Result, TextCodec};
use nom::{
    bytes::complete::take,
    number::complete::{le_f32, le_i16, le_i32, le_i8, le_u16, le_u32, le_u8},
};

pub fn vec2(input: &[u8]) -> Result<[f32; 2]> {
    let (input, x) = le_f32(input)?;
    let (input, y) = le_f32(input)?;
    Ok((input, [x, y]))
}

pub fn vec3(input: &[u8]) -> Result<[f32; 3]> {
    let (input, x) = le_f32(input)?;
    let (input, y) = le_f32(input)?;
    let (input, z) = le_f32(input)?;
    Ok((input, [x, y, z]))
}

pub fn vec4(input: &[u8]) -> Result<[f32; 4]> {
    let (input, x) = le_f32(input)?;
    let (input, y) = le_f32(input)?;
    let (input, z) = le_f32(input)?;
    let (input, w) = le_f32(input)?;
    Ok((input, [x, y, z, w]))
}

/// Length-prefixed string: a u32 byte length followed by the encoded text.
pub fn text(input: &[u8], codec: TextCodec) -> Result<String> {
    let (input, len) = le_u32(input)?;
    let (input, bytes) = take(len as usize)(input)?;
    Ok((input, codec.decode(bytes)))
}

/// Fixed-width string field, zero padded. Everything from the first NUL
/// onwards is discarded before decoding.
pub fn fixed_text(input: &[u8], len: usize, codec: TextCodec) -> Result<String> {
    let (input, bytes) = take(len)(input)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok((input, codec.decode(&bytes[..end])))
}

/// Signed index field of a declared width. Any negative value means "no
/// reference" and becomes `None`.
pub fn index(input: &[u8], width: IndexWidth) -> Result<Option<u32>> {
    let (input, value) = match width {
        IndexWidth::Bytes1 => le_i8(input).map(|(i, n)| (i, i32::from(n)))?,
        IndexWidth::Bytes2 => le_i16(input).map(|(i, n)| (i, i32::from(n)))?,
        IndexWidth::Bytes4 => le_i32(input)?,
    };
    if value < 0 {
        Ok((input, None))
    } else {
        Ok((input, Some(value as u32)))
    }
}

/// Vertex index field. Unlike every other index kind, widths 1 and 2 are
/// stored unsigned and there is no "no reference" value.
pub fn vertex_index(input: &[u8], width: IndexWidth) -> Result<u32> {
    match width {
        IndexWidth::Bytes1 => le_u8(input).map(|(i, n)| (i, u32::from(n))),
        IndexWidth::Bytes2 => le_u16(input).map(|(i, n)| (i, u32::from(n))),
        IndexWidth::Bytes4 => le_i32(input).map(|(i, n)| (i, n as u32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn signed_index_widths() {
        assert_eq!(index(&[0xff], IndexWidth::Bytes1).unwrap().1, None);
        assert_eq!(index(&[0x7f], IndexWidth::Bytes1).unwrap().1, Some(127));
        assert_eq!(index(&[0xff, 0xff], IndexWidth::Bytes2).unwrap().1, None);
        assert_eq!(
            index(&[0x10, 0x27, 0, 0], IndexWidth::Bytes4).unwrap().1,
            Some(10_000)
        );
    }

    #[test]
    fn vertex_index_is_unsigned() {
        assert_eq!(vertex_index(&[0xff], IndexWidth::Bytes1).unwrap().1, 255);
        assert_eq!(
            vertex_index(&[0xff, 0xff], IndexWidth::Bytes2).unwrap().1,
            65_535
        );
    }

    #[test]
    fn short_buffer_is_truncation() {
        let err = match vec3(&[0u8; 8]) {
            Err(nom::Err::Error(e)) => e,
            other => panic!("expected error, got {:?}", other),
        };
        assert!(matches!(err, Error::TruncatedData));
    }

    #[test]
    fn fixed_text_stops_at_nul() {
        let (_, s) = fixed_text(b"abc\0zzzz", 8, TextCodec::ShiftJis).unwrap();
        assert_eq!(s, "abc");
    }
}
