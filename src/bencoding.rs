use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

const MAX_NESTING: usize = 64;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorElem {
    Unknown,
    Str,
    Int,
    List,
    Dict,
    Trailing,
    TooDeep,
}

#[derive(PartialEq, Debug, Error)]
#[error("malformed bencoded {elem:?} at byte {index}")]
pub struct DecodeError {
    pub elem: ErrorElem,
    pub index: usize,
}

fn err<T>(elem: ErrorElem, index: usize) -> Result<T, DecodeError> {
    Err(DecodeError { elem, index })
}

#[derive(PartialEq, Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>, usize, usize), // map, start and end (exclusive) offset in the source
}

impl Value {
    pub fn decode(source: &[u8]) -> Result<Self, DecodeError> {
        let (value, index) = Self::parse(source, 0, 0)?;
        if index != source.len() {
            return err(ErrorElem::Trailing, index);
        }
        Ok(value)
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    #[cfg(test)]
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => out.extend_from_slice(format!("i{i}e").as_bytes()),
            Value::Str(s) => encode_str(s, out),
            Value::List(l) => {
                out.push(b'l');
                l.iter().for_each(|v| v.encode_into(out));
                out.push(b'e');
            }
            Value::Dict(d, _, _) => {
                out.push(b'd');
                for (k, v) in d {
                    encode_str(k, out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d, _, _) => d.get(key),
            _ => None,
        }
    }

    // return Value, index of next byte to read
    fn parse(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), DecodeError> {
        if depth > MAX_NESTING {
            return err(ErrorElem::TooDeep, index);
        }
        match source.get(index) {
            Some(b'0'..=b'9') => Self::parse_str(source, index),
            Some(b'i') => Self::parse_int(source, index),
            Some(b'l') => Self::parse_list(source, index, depth),
            Some(b'd') => Self::parse_dict(source, index, depth),
            _ => err(ErrorElem::Unknown, index),
        }
    }

    fn parse_str(source: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let start = index;
        let Some(colon) = source[start..].iter().position(|b| *b == b':') else {
            return err(ErrorElem::Str, start);
        };
        let len_digits = &source[start..start + colon];
        if !len_digits.iter().all(u8::is_ascii_digit)
            || (len_digits.len() > 1 && len_digits[0] == b'0')
        {
            return err(ErrorElem::Str, start);
        }
        let len = match std::str::from_utf8(len_digits).map(str::parse::<usize>) {
            Ok(Ok(len)) => len,
            _ => return err(ErrorElem::Str, start),
        };
        let data_start = start + colon + 1;
        let Some(data_end) = data_start.checked_add(len).filter(|e| *e <= source.len()) else {
            return err(ErrorElem::Str, start);
        };
        Ok((Value::Str(source[data_start..data_end].to_vec()), data_end))
    }

    fn parse_int(source: &[u8], index: usize) -> Result<(Self, usize), DecodeError> {
        let start = index + 1;
        let Some(e) = source[start..].iter().position(|b| *b == b'e') else {
            return err(ErrorElem::Int, start);
        };
        let digits = &source[start..start + e];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || !unsigned.iter().all(u8::is_ascii_digit)
            || digits == b"-0"
            || (unsigned.len() > 1 && unsigned[0] == b'0')
        {
            return err(ErrorElem::Int, start);
        }
        match std::str::from_utf8(digits).map(str::parse::<i64>) {
            Ok(Ok(i)) => Ok((Value::Int(i), start + e + 1)),
            _ => err(ErrorElem::Int, start),
        }
    }

    fn parse_list(
        source: &[u8],
        index: usize,
        depth: usize,
    ) -> Result<(Self, usize), DecodeError> {
        let mut l = Vec::new();
        let mut index = index + 1;
        loop {
            match source.get(index) {
                None => return err(ErrorElem::List, index),
                Some(b'e') => return Ok((Value::List(l), index + 1)),
                _ => {
                    let (v, next) = Self::parse(source, index, depth + 1)?;
                    l.push(v);
                    index = next;
                }
            }
        }
    }

    fn parse_dict(
        source: &[u8],
        index: usize,
        depth: usize,
    ) -> Result<(Self, usize), DecodeError> {
        let start = index;
        let mut d = BTreeMap::new();
        let mut index = index + 1;
        loop {
            match source.get(index) {
                None => return err(ErrorElem::Dict, index),
                Some(b'e') => return Ok((Value::Dict(d, start, index + 1), index + 1)),
                Some(b'0'..=b'9') => {
                    let (k, next) = Self::parse_str(source, index)?;
                    let (v, next) = Self::parse(source, next, depth + 1)?;
                    if let Value::Str(k) = k {
                        d.insert(k, v);
                    }
                    index = next;
                }
                _ => return err(ErrorElem::Dict, index),
            }
        }
    }
}

#[cfg(test)]
fn encode_str(s: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s);
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => match std::str::from_utf8(s) {
                Ok(s) => write!(f, "\"{s}\""),
                Err(_) => write!(f, "<{} bytes>", s.len()),
            },
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Dict(d, _, _) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {v}", String::from_utf8_lossy(k))?;
                }
                write!(f, "}}")
            }
        }
    }
}
