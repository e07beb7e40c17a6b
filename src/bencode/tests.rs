use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn decode_rejects_noncanonical_integers() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i042e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn decode_byte_strings() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert!(decode(b"5:spam").is_err());
}

#[test]
fn decode_list() {
    let value = decode(b"l4:spami42ee").unwrap();
    let list = value.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].as_str(), Some("spam"));
    assert_eq!(list[1].as_integer(), Some(42));
}

#[test]
fn decode_dict() {
    let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(value.get(b"cow").and_then(Value::as_str), Some("moo"));
    assert_eq!(value.get(b"spam").and_then(Value::as_str), Some("eggs"));
    assert_eq!(value.get(b"missing"), None);
}

#[test]
fn decode_rejects_unsorted_keys() {
    // "spam" before "cow" violates key ordering.
    assert!(decode(b"d4:spam4:eggs3:cow3:mooe").is_err());
    // Duplicate keys are also rejected.
    assert!(decode(b"d3:cow3:moo3:cow3:booe").is_err());
}

#[test]
fn decode_rejects_trailing_data() {
    assert!(decode(b"i42ei43e").is_err());
    assert!(decode(b"4:spamx").is_err());
}

#[test]
fn decode_rejects_deep_nesting() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat_n(b'l', 200));
    data.extend(std::iter::repeat_n(b'e', 200));
    assert!(decode(&data).is_err());
}

#[test]
fn encode_round_trips() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"a"), Value::Integer(1));
    dict.insert(
        Bytes::from_static(b"b"),
        Value::List(vec![Value::string("x"), Value::Integer(-2)]),
    );
    let value = Value::Dict(dict);

    let encoded = encode(&value);
    assert_eq!(encoded, b"d1:ai1e1:bl1:xi-2eee");
    assert_eq!(decode(&encoded).unwrap(), value);
}

#[test]
fn encode_is_canonical() {
    // Decode then re-encode must reproduce the input exactly.
    let input = b"d4:infod6:lengthi1024e4:name4:test12:piece lengthi256eee".to_vec();
    let value = decode(&input).unwrap();
    assert_eq!(encode(&value), input);
}
