pub mod model;
pub mod vmd;

use crate::parsers::{IndexWidth, TextCodec};
use byteorder::{LittleEndian, WriteBytesExt};

/// Little-endian byte sink shared by the encoders. All writes go to an
/// in-memory buffer, which makes every `io::Result` on the way infallible.
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.write_u8(v).expect("write to Vec<u8>");
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.write_i8(v).expect("write to Vec<u8>");
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).expect("write to Vec<u8>");
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.write_i16::<LittleEndian>(v).expect("write to Vec<u8>");
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).expect("write to Vec<u8>");
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.write_i32::<LittleEndian>(v).expect("write to Vec<u8>");
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.write_f32::<LittleEndian>(v).expect("write to Vec<u8>");
    }

    pub fn put_vec2(&mut self, v: [f32; 2]) {
        for c in v {
            self.put_f32(c);
        }
    }

    pub fn put_vec3(&mut self, v: [f32; 3]) {
        for c in v {
            self.put_f32(c);
        }
    }

    pub fn put_vec4(&mut self, v: [f32; 4]) {
        for c in v {
            self.put_f32(c);
        }
    }

    /// Length-prefixed string in the given codec.
    pub fn put_text(&mut self, text: &str, codec: TextCodec) {
        let bytes = codec.encode(text);
        self.put_u32(bytes.len() as u32);
        self.put_bytes(&bytes);
    }

    /// Fixed-width string field, truncated at the encoded byte level and
    /// padded with NULs.
    pub fn put_fixed_text(&mut self, text: &str, len: usize, codec: TextCodec) {
        let mut bytes = codec.encode(text);
        bytes.resize(len, 0);
        self.put_bytes(&bytes[..len]);
    }

    /// Signed index field; `None` is stored as -1.
    pub fn put_index(&mut self, width: IndexWidth, idx: Option<u32>) {
        match (width, idx) {
            (IndexWidth::Bytes1, None) => self.put_i8(-1),
            (IndexWidth::Bytes1, Some(i)) => self.put_i8(i as i8),
            (IndexWidth::Bytes2, None) => self.put_i16(-1),
            (IndexWidth::Bytes2, Some(i)) => self.put_i16(i as i16),
            (IndexWidth::Bytes4, None) => self.put_i32(-1),
            (IndexWidth::Bytes4, Some(i)) => self.put_i32(i as i32),
        }
    }

    /// Unsigned vertex index field.
    pub fn put_vertex_index(&mut self, width: IndexWidth, idx: u32) {
        match width {
            IndexWidth::Bytes1 => self.put_u8(idx as u8),
            IndexWidth::Bytes2 => self.put_u16(idx as u16),
            IndexWidth::Bytes4 => self.put_i32(idx as i32),
        }
    }
}
