use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 64;

/// Decodes a complete bencode value from `data`.
///
/// The whole input must be consumed; trailing bytes are an error, as are
/// unsorted or duplicate dictionary keys.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;

    if cursor.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;

        while self.peek()? != b'e' {
            self.pos += 1;
        }

        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

        if digits.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }

        // i-0e and leading zeros are non-canonical.
        if digits == "-0" || (digits.len() > 1 && digits.starts_with('0')) || digits.starts_with("-0")
        {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(digits.into()))?;

        self.pos += 1;
        Ok(Value::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;

        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidStringLength);
            }
            self.pos += 1;
        }

        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        self.pos += 1;

        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Bytes> = None;

        while self.peek()? != b'e' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidKey);
            }

            let key = self.byte_string()?;

            if let Some(ref prev) = last_key {
                if key <= *prev {
                    return Err(BencodeError::UnsortedKeys);
                }
            }
            last_key = Some(key.clone());

            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
