use super::value::Value;

/// Encodes a bencode value to a fresh byte vector.
///
/// Dictionary keys come out sorted because [`Value::Dict`] is a `BTreeMap`,
/// so output is always canonical.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Encodes a bencode value, appending to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => {
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            for (key, val) in dict {
                buf.extend_from_slice(key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(key);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}
