use super::BencodeValue;

/// Encode a value into its canonical byte representation.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut output = Vec::new();
    encode_into(value, &mut output);
    output
}

/// Append the canonical encoding of `value` to `output`.
///
/// Dictionary keys come out in ascending byte order because the map is
/// ordered; the info-hash depends on this.
pub fn encode_into(value: &BencodeValue, output: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            output.push(b'i');
            output.extend_from_slice(i.to_string().as_bytes());
            output.push(b'e');
        }
        BencodeValue::Bytes(s) => put_bytes(s, output),
        BencodeValue::List(list) => {
            output.push(b'l');
            for item in list {
                encode_into(item, output);
            }
            output.push(b'e');
        }
        BencodeValue::Dict(dict) => {
            output.push(b'd');
            for (key, value) in dict {
                put_bytes(key, output);
                encode_into(value, output);
            }
            output.push(b'e');
        }
    }
}

fn put_bytes(bytes: &[u8], output: &mut Vec<u8>) {
    output.extend_from_slice(bytes.len().to_string().as_bytes());
    output.push(b':');
    output.extend_from_slice(bytes);
}
