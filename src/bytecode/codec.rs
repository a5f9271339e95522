//! Byte-exact serialization of [`Image`] to and from the `.tailc` format.
//!
//! Everything is little-endian. Each constant record is a 1-byte type tag
//! followed by a fixed 8-byte payload, so constant records are uniform width.

use std::fmt;

use super::{
    FunctionInfo, Image, Instr, Value, MAGIC, TYPE_ARRAY_FLOAT, TYPE_ARRAY_INT, TYPE_ARRAY_STRING,
    TYPE_BOOL, TYPE_FLOAT, TYPE_INT, TYPE_NIL, TYPE_STRING,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before a complete record could be read.
    UnexpectedEof,
    /// The file does not start with the `TAIL` magic.
    BadMagic,
    /// A string or function name was not valid UTF-8.
    InvalidUtf8,
    /// A constant record carried an unknown type tag.
    UnknownConstantTag(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of bytecode file"),
            Self::BadMagic => write!(f, "not a Tail bytecode file (bad magic)"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in string data"),
            Self::UnknownConstantTag(tag) => write!(f, "unknown constant type tag {}", tag),
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Writer ──────────────────────────────────────

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn write_constant(out: &mut Vec<u8>, value: Value) {
    out.push(value.type_tag());
    match value {
        Value::Int(v) => write_i64(out, v),
        Value::Float(v) => write_f64(out, v),
        Value::Bool(v) => {
            out.push(u8::from(v));
            out.extend_from_slice(&[0; 7]);
        }
        Value::Str(idx) | Value::ArrayInt(idx) | Value::ArrayFloat(idx) | Value::ArrayStr(idx) => {
            write_u32(out, idx);
            out.extend_from_slice(&[0; 4]);
        }
        Value::Nil => out.extend_from_slice(&[0; 8]),
    }
}

pub fn serialize(image: &Image) -> Vec<u8> {
    let mut out = Vec::new();

    write_u32(&mut out, MAGIC);
    write_u16(&mut out, image.version);
    write_u16(&mut out, image.flags);

    write_u32(&mut out, image.code.len() as u32);
    for instr in &image.code {
        out.push(instr.opcode);
        write_u32(&mut out, instr.operand);
    }

    write_u32(&mut out, image.constants.len() as u32);
    for &constant in &image.constants {
        write_constant(&mut out, constant);
    }

    write_u32(&mut out, image.strings.len() as u32);
    for s in &image.strings {
        write_str(&mut out, s);
    }

    write_u32(&mut out, image.int_arrays.len() as u32);
    for arr in &image.int_arrays {
        write_u32(&mut out, arr.len() as u32);
        for &v in arr {
            write_i64(&mut out, v);
        }
    }

    write_u32(&mut out, image.float_arrays.len() as u32);
    for arr in &image.float_arrays {
        write_u32(&mut out, arr.len() as u32);
        for &v in arr {
            write_f64(&mut out, v);
        }
    }

    write_u32(&mut out, image.string_arrays.len() as u32);
    for arr in &image.string_arrays {
        write_u32(&mut out, arr.len() as u32);
        for s in arr {
            write_str(&mut out, s);
        }
    }

    write_u32(&mut out, image.functions.len() as u32);
    for func in &image.functions {
        write_str(&mut out, &func.name);
        write_u32(&mut out, func.address);
        out.push(func.arity);
        out.push(func.locals);
    }

    write_u32(&mut out, image.native_imports.len() as u32);
    for name in &image.native_imports {
        write_str(&mut out, name);
    }

    out
}

// ── Reader ──────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("slice is 8 bytes")))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("slice is 8 bytes")))
    }

    fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

fn read_constant(r: &mut Reader<'_>) -> Result<Value, DecodeError> {
    let tag = r.read_u8()?;
    let payload = r.take(8)?;
    let value = match tag {
        TYPE_NIL => Value::Nil,
        TYPE_INT => Value::Int(i64::from_le_bytes(payload.try_into().expect("8 bytes"))),
        TYPE_FLOAT => Value::Float(f64::from_le_bytes(payload.try_into().expect("8 bytes"))),
        TYPE_BOOL => Value::Bool(payload[0] != 0),
        TYPE_STRING | TYPE_ARRAY_INT | TYPE_ARRAY_FLOAT | TYPE_ARRAY_STRING => {
            let idx = u32::from_le_bytes(payload[..4].try_into().expect("4 bytes"));
            match tag {
                TYPE_STRING => Value::Str(idx),
                TYPE_ARRAY_INT => Value::ArrayInt(idx),
                TYPE_ARRAY_FLOAT => Value::ArrayFloat(idx),
                _ => Value::ArrayStr(idx),
            }
        }
        other => return Err(DecodeError::UnknownConstantTag(other)),
    };
    Ok(value)
}

pub fn deserialize(bytes: &[u8]) -> Result<Image, DecodeError> {
    let mut r = Reader::new(bytes);

    if r.read_u32()? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.read_u16()?;
    let flags = r.read_u16()?;

    let code_len = r.read_u32()? as usize;
    if r.remaining() < code_len.checked_mul(5).ok_or(DecodeError::UnexpectedEof)? {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        let opcode = r.read_u8()?;
        let operand = r.read_u32()?;
        code.push(Instr::new(opcode, operand));
    }

    let const_count = r.read_u32()? as usize;
    let mut constants = Vec::new();
    for _ in 0..const_count {
        constants.push(read_constant(&mut r)?);
    }

    let str_count = r.read_u32()? as usize;
    let mut strings = Vec::new();
    for _ in 0..str_count {
        strings.push(r.read_str()?);
    }

    let int_array_count = r.read_u32()? as usize;
    let mut int_arrays = Vec::new();
    for _ in 0..int_array_count {
        let len = r.read_u32()? as usize;
        let mut arr = Vec::new();
        for _ in 0..len {
            arr.push(r.read_i64()?);
        }
        int_arrays.push(arr);
    }

    let float_array_count = r.read_u32()? as usize;
    let mut float_arrays = Vec::new();
    for _ in 0..float_array_count {
        let len = r.read_u32()? as usize;
        let mut arr = Vec::new();
        for _ in 0..len {
            arr.push(r.read_f64()?);
        }
        float_arrays.push(arr);
    }

    let string_array_count = r.read_u32()? as usize;
    let mut string_arrays = Vec::new();
    for _ in 0..string_array_count {
        let len = r.read_u32()? as usize;
        let mut arr = Vec::new();
        for _ in 0..len {
            arr.push(r.read_str()?);
        }
        string_arrays.push(arr);
    }

    let func_count = r.read_u32()? as usize;
    let mut functions = Vec::new();
    for _ in 0..func_count {
        let name = r.read_str()?;
        let address = r.read_u32()?;
        let arity = r.read_u8()?;
        let locals = r.read_u8()?;
        functions.push(FunctionInfo { name, address, arity, locals });
    }

    let native_count = r.read_u32()? as usize;
    let mut native_imports = Vec::new();
    for _ in 0..native_count {
        native_imports.push(r.read_str()?);
    }

    if r.remaining() > 0 {
        eprintln!("Warning: {} extra bytes in bytecode file", r.remaining());
    }

    Ok(Image {
        version,
        flags,
        code,
        constants,
        strings,
        int_arrays,
        float_arrays,
        string_arrays,
        functions,
        native_imports,
    })
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::{deserialize, serialize, DecodeError};

    fn sample_image() -> Image {
        Image {
            version: VERSION,
            flags: 0,
            code: vec![
                Instr::new(OP_PUSH, 0),
                Instr::new(OP_PRINTLN, 0),
                Instr::new(OP_PUSH, 1),
                Instr::new(OP_RET, 0),
                Instr::new(OP_HALT, 0),
            ],
            constants: vec![
                Value::Str(0),
                Value::Nil,
                Value::Int(-7),
                Value::Float(2.5),
                Value::Bool(true),
                Value::ArrayInt(1),
            ],
            strings: vec!["hi".into(), "".into(), "snowman \u{2603}".into()],
            int_arrays: vec![vec![1, 2, 3]],
            float_arrays: vec![vec![0.5]],
            string_arrays: vec![vec!["a".into(), "b".into()]],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            native_imports: vec!["System.env".into()],
        }
    }

    #[test]
    fn round_trip_is_field_exact() {
        let image = sample_image();
        let bytes = serialize(&image);
        let back = deserialize(&bytes).expect("deserialize");
        assert_eq!(image, back);
    }

    #[test]
    fn magic_bytes_are_little_endian_tail() {
        let bytes = serialize(&Image::new());
        assert_eq!(&bytes[0..4], &[0x4C, 0x49, 0x41, 0x54]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = serialize(&Image::new());
        bytes[0] = 0x00;
        assert_eq!(deserialize(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn truncation_anywhere_is_an_error() {
        let bytes = serialize(&sample_image());
        for len in 0..bytes.len() {
            assert_eq!(
                deserialize(&bytes[..len]),
                Err(DecodeError::UnexpectedEof),
                "truncated at {} bytes",
                len
            );
        }
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let image = sample_image();
        let mut bytes = serialize(&image);
        bytes.extend_from_slice(&[0xDE, 0xAD]);
        assert_eq!(deserialize(&bytes).expect("deserialize"), image);
    }

    #[test]
    fn constant_records_are_nine_bytes_each() {
        let mut a = Image::new();
        let mut b = a.clone();
        b.constants.push(Value::Bool(true));
        assert_eq!(serialize(&b).len(), serialize(&a).len() + 9);
        a.constants.push(Value::Str(3));
        assert_eq!(serialize(&a).len(), serialize(&b).len());
    }

    #[test]
    fn unknown_constant_tag_is_rejected() {
        let mut image = Image::new();
        image.constants.push(Value::Nil);
        let mut bytes = serialize(&image);
        // constant section starts right after header + empty code section
        let tag_offset = 4 + 2 + 2 + 4 + 4;
        bytes[tag_offset] = 0x7F;
        assert_eq!(deserialize(&bytes), Err(DecodeError::UnknownConstantTag(0x7F)));
    }
}
