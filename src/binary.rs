// Binary encoding of compiled units, used to cache compilation results on
// disk. The format is versioned and magic-prefixed; decode failures are
// recoverable errors, never panics.

use crate::compiler::code::CodeObject;
use crate::error::{Position, Span};
use crate::vm::interner::intern;
use crate::vm::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"SILT";
const VERSION: u8 = 1;

const TAG_NONE: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_TUPLE: u8 = 5;
const TAG_CODE: u8 = 6;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a compiled silt unit")]
    BadMagic,
    #[error("unsupported compiled-unit version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated stream at offset {0}")]
    Truncated(usize),
    #[error("invalid constant tag {0:#04x}")]
    BadTag(u8),
    #[error("invalid utf-8 in string table")]
    BadString(#[from] std::string::FromUtf8Error),
}

pub fn encode(code: &CodeObject) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    encode_unit(&mut out, code);
    out
}

pub fn decode(data: &[u8]) -> Result<CodeObject, DecodeError> {
    if data.len() < 5 {
        return Err(DecodeError::Truncated(data.len()));
    }
    if &data[0..4] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = data[4];
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let mut cursor = 5;
    decode_unit(data, &mut cursor)
}

fn encode_unit(out: &mut Vec<u8>, code: &CodeObject) {
    write_str(out, &code.name);
    write_str(out, &code.qualname);
    write_str(out, &code.file);

    write_u32(out, code.code.len() as u32);
    out.extend_from_slice(&code.code);

    write_u32(out, code.spans.len() as u32);
    for span in code.spans.iter() {
        write_u32(out, span.start.line as u32);
        write_u32(out, span.start.column as u32);
        write_u32(out, span.start.offset as u32);
        write_u32(out, span.end.line as u32);
        write_u32(out, span.end.column as u32);
        write_u32(out, span.end.offset as u32);
    }

    write_u32(out, code.constants.len() as u32);
    for constant in &code.constants {
        encode_value(out, constant);
    }

    write_u32(out, code.names.len() as u32);
    for name in &code.names {
        write_str(out, name);
    }
    write_u32(out, code.varnames.len() as u32);
    for name in &code.varnames {
        write_str(out, name);
    }

    write_u32(out, code.arg_count as u32);
    out.push(u8::from(code.has_varargs));
    write_u32(out, code.kwonly_count as u32);

    write_u32(out, code.defaults.len() as u32);
    for value in &code.defaults {
        encode_value(out, value);
    }

    // Keyword defaults in name order, so equal units encode to equal bytes.
    let mut kw: Vec<(&Arc<str>, &Value)> = code.kw_defaults.iter().collect();
    kw.sort_by(|a, b| a.0.cmp(b.0));
    write_u32(out, kw.len() as u32);
    for (name, value) in kw {
        write_str(out, name);
        encode_value(out, value);
    }
}

fn decode_unit(data: &[u8], cursor: &mut usize) -> Result<CodeObject, DecodeError> {
    let name = read_str(data, cursor)?;
    let qualname = read_str(data, cursor)?;
    let file = read_str(data, cursor)?;

    let code_len = read_u32(data, cursor)? as usize;
    let code = read_bytes(data, cursor, code_len)?.to_vec();

    let span_count = read_u32(data, cursor)? as usize;
    let mut spans = Vec::with_capacity(span_count);
    for _ in 0..span_count {
        let start = Position::new(
            read_u32(data, cursor)? as usize,
            read_u32(data, cursor)? as usize,
            read_u32(data, cursor)? as usize,
        );
        let end = Position::new(
            read_u32(data, cursor)? as usize,
            read_u32(data, cursor)? as usize,
            read_u32(data, cursor)? as usize,
        );
        spans.push(Span::new(start, end));
    }

    let constant_count = read_u32(data, cursor)? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        constants.push(decode_value(data, cursor)?);
    }

    let name_count = read_u32(data, cursor)? as usize;
    let mut names = Vec::with_capacity(name_count);
    for _ in 0..name_count {
        names.push(intern(&read_str(data, cursor)?));
    }
    let varname_count = read_u32(data, cursor)? as usize;
    let mut varnames = Vec::with_capacity(varname_count);
    for _ in 0..varname_count {
        varnames.push(intern(&read_str(data, cursor)?));
    }

    let arg_count = read_u32(data, cursor)? as usize;
    let has_varargs = read_u8(data, cursor)? != 0;
    let kwonly_count = read_u32(data, cursor)? as usize;

    let default_count = read_u32(data, cursor)? as usize;
    let mut defaults = Vec::with_capacity(default_count);
    for _ in 0..default_count {
        defaults.push(decode_value(data, cursor)?);
    }

    let kw_count = read_u32(data, cursor)? as usize;
    let mut kw_defaults = FxHashMap::default();
    for _ in 0..kw_count {
        let name = intern(&read_str(data, cursor)?);
        let value = decode_value(data, cursor)?;
        kw_defaults.insert(name, value);
    }

    Ok(CodeObject {
        name,
        qualname,
        file,
        code: code.into_boxed_slice(),
        spans: spans.into_boxed_slice(),
        constants,
        names,
        varnames,
        arg_count,
        has_varargs,
        kwonly_count,
        defaults,
        kw_defaults,
    })
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::None => out.push(TAG_NONE),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(n) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            write_str(out, s);
        }
        Value::Tuple(items) => {
            out.push(TAG_TUPLE);
            write_u32(out, items.len() as u32);
            for item in items.iter() {
                encode_value(out, item);
            }
        }
        Value::Code(code) => {
            out.push(TAG_CODE);
            encode_unit(out, code);
        }
    }
}

fn decode_value(data: &[u8], cursor: &mut usize) -> Result<Value, DecodeError> {
    let tag = read_u8(data, cursor)?;
    Ok(match tag {
        TAG_NONE => Value::None,
        TAG_BOOL => Value::Bool(read_u8(data, cursor)? != 0),
        TAG_INT => {
            let bytes: [u8; 8] = read_bytes(data, cursor, 8)?.try_into().expect("8 bytes");
            Value::Int(i64::from_be_bytes(bytes))
        }
        TAG_FLOAT => {
            let bytes: [u8; 8] = read_bytes(data, cursor, 8)?.try_into().expect("8 bytes");
            Value::Float(f64::from_bits(u64::from_be_bytes(bytes)))
        }
        TAG_STR => Value::Str(intern(&read_str(data, cursor)?)),
        TAG_TUPLE => {
            let count = read_u32(data, cursor)? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(data, cursor)?);
            }
            Value::tuple(items)
        }
        TAG_CODE => Value::Code(Arc::new(decode_unit(data, cursor)?)),
        other => return Err(DecodeError::BadTag(other)),
    })
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8, DecodeError> {
    let byte = *data.get(*cursor).ok_or(DecodeError::Truncated(*cursor))?;
    *cursor += 1;
    Ok(byte)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = read_bytes(data, cursor, 4)?.try_into().expect("4 bytes");
    Ok(u32::from_be_bytes(bytes))
}

fn read_bytes<'a>(
    data: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], DecodeError> {
    let end = cursor
        .checked_add(len)
        .ok_or(DecodeError::Truncated(*cursor))?;
    if end > data.len() {
        return Err(DecodeError::Truncated(*cursor));
    }
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_str(data: &[u8], cursor: &mut usize) -> Result<String, DecodeError> {
    let len = read_u32(data, cursor)? as usize;
    Ok(String::from_utf8(read_bytes(data, cursor, len)?.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FunctionDef, Literal, Module, Param, Stmt};
    use crate::compiler::{Compiler, GlobalEnv};
    use crate::error::Span;

    fn sample() -> Arc<CodeObject> {
        let def = FunctionDef {
            name: "double".to_string(),
            params: vec![Param::new("n", Span::line(1))],
            vararg: None,
            kwonly: Vec::new(),
            kwarg: None,
            body: vec![Stmt::Return {
                value: Some(Expr::Binary {
                    left: Box::new(Expr::Identifier {
                        name: "n".to_string(),
                        span: Span::line(2),
                    }),
                    op: crate::ast::BinaryOp::Mul,
                    right: Box::new(Expr::Literal {
                        value: Literal::Int(2),
                        span: Span::line(2),
                    }),
                    span: Span::line(2),
                }),
                span: Span::line(2),
            }],
            span: Span::line(1),
        };
        let env = GlobalEnv::with_default_builtins();
        let mut compiler = Compiler::new("sample.si", "", &env);
        compiler
            .compile(&Module::new(vec![Stmt::Function { def }]))
            .unwrap();
        compiler.finish().unwrap()
    }

    #[test]
    fn encoded_units_decode_to_the_same_shape() {
        let code = sample();
        let decoded = decode(&encode(&code)).unwrap();

        assert_eq!(decoded.name, code.name);
        assert_eq!(&decoded.code[..], &code.code[..]);
        assert_eq!(decoded.names, code.names);
        assert_eq!(decoded.spans.len(), code.spans.len());

        let nested = decoded
            .constants
            .iter()
            .find_map(|c| c.as_code())
            .expect("nested function survives");
        assert_eq!(nested.name, "double");
        assert_eq!(nested.arg_count, 1);
        assert_eq!(nested.get_line(0), 2);
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        assert!(matches!(decode(b"NOPE\x01rest"), Err(DecodeError::BadMagic)));
        assert!(matches!(
            decode(b"SILT\x63"),
            Err(DecodeError::UnsupportedVersion(0x63))
        ));
        assert!(matches!(decode(b"SI"), Err(DecodeError::Truncated(_))));

        let mut bytes = encode(&sample());
        bytes.truncate(bytes.len() / 2);
        assert!(decode(&bytes).is_err());
    }
}
