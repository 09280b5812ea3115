use super::BencodeValue;
use crate::error::BencodeError;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Lists and dictionaries nested deeper than this are rejected, so hostile
/// input cannot exhaust the stack.
pub const MAX_DEPTH: usize = 64;

type DecodeResult<T> = std::result::Result<T, BencodeError>;

/// Decode a buffer that must contain exactly one bencoded value.
pub fn decode(data: &[u8]) -> DecodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData {
            position: consumed,
            remaining: data.len() - consumed,
        });
    }
    Ok(value)
}

/// Decode the value at the start of `data`, returning it together with the
/// number of bytes it occupied. Bytes after the value are left untouched.
pub fn decode_prefix(data: &[u8]) -> DecodeResult<(BencodeValue, usize)> {
    if data.is_empty() {
        return Err(BencodeError::EmptyInput);
    }

    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        match self.peek() {
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => self.bytes().map(BencodeValue::Bytes),
            Some(byte) => Err(BencodeError::InvalidToken {
                byte,
                position: self.pos,
            }),
            // Callers only ask for a value inside a container whose end
            // marker is still missing.
            None => Err(BencodeError::UnterminatedContainer { position: self.pos }),
        }
    }

    fn integer(&mut self) -> DecodeResult<BencodeValue> {
        let start = self.pos;
        let digits_start = start + 1;

        let end = self.data[digits_start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|offset| digits_start + offset)
            .ok_or(BencodeError::UnterminatedInteger { position: start })?;

        let digits = &self.data[digits_start..end];
        let value = parse_integer(digits).ok_or(BencodeError::MalformedInteger { position: start })?;

        self.pos = end + 1;
        Ok(BencodeValue::Integer(value))
    }

    fn bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let start = self.pos;

        let digits_len = self.data[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let colon = start + digits_len;

        if digits_len == 0 || self.data.get(colon) != Some(&b':') {
            return Err(BencodeError::MalformedLength { position: start });
        }

        let digits = &self.data[start..colon];
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::MalformedLength { position: start });
        }

        let declared = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::MalformedLength { position: start })?;

        let body_start = colon + 1;
        let available = self.data.len() - body_start;
        if declared > available {
            return Err(BencodeError::TruncatedInput {
                position: start,
                declared,
                available,
            });
        }

        self.pos = body_start + declared;
        Ok(self.data[body_start..self.pos].to_vec())
    }

    fn enter(&self, depth: usize) -> DecodeResult<usize> {
        if depth >= MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep {
                limit: MAX_DEPTH,
                position: self.pos,
            });
        }
        Ok(depth + 1)
    }

    fn list(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        let depth = self.enter(depth)?;
        let start = self.pos;
        self.pos += 1; // 'l'

        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => break,
                Some(_) => items.push(self.value(depth)?),
                None => return Err(BencodeError::UnterminatedContainer { position: start }),
            }
        }

        self.pos += 1; // 'e'
        Ok(BencodeValue::List(items))
    }

    fn dict(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        let depth = self.enter(depth)?;
        let start = self.pos;
        self.pos += 1; // 'd'

        let mut entries = BTreeMap::new();
        loop {
            let key_pos = self.pos;
            match self.peek() {
                Some(b'e') => break,
                Some(b'0'..=b'9') => {}
                Some(_) => return Err(BencodeError::NonStringKey { position: key_pos }),
                None => return Err(BencodeError::UnterminatedContainer { position: start }),
            }

            let key = self.bytes()?;
            if self.peek().is_none() {
                return Err(BencodeError::UnterminatedContainer { position: start });
            }
            let value = self.value(depth)?;

            match entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(_) => {
                    return Err(BencodeError::DuplicateKey { position: key_pos });
                }
            }
        }

        self.pos += 1; // 'e'
        Ok(BencodeValue::Dict(entries))
    }
}

/// Canonical integer syntax: optional '-', no leading zeros, no "-0".
fn parse_integer(digits: &[u8]) -> Option<i64> {
    let magnitude = digits.strip_prefix(b"-").unwrap_or(digits);
    if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if magnitude.len() > 1 && magnitude[0] == b'0' {
        return None;
    }
    if digits[0] == b'-' && magnitude == b"0" {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), BencodeValue::from("spam"));
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_prefix_reports_consumed_length() {
        let (value, consumed) = decode_prefix(b"l4:spami1eeXYZ").unwrap();
        assert_eq!(consumed, 11);
        assert_eq!(
            value,
            BencodeValue::List(vec![BencodeValue::from("spam"), BencodeValue::Integer(1)])
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(decode(b""), Err(BencodeError::EmptyInput));
    }

    #[test]
    fn test_truncated_string() {
        assert_eq!(
            decode(b"4:sp"),
            Err(BencodeError::TruncatedInput {
                position: 0,
                declared: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_malformed_integers() {
        let inputs: [&[u8]; 6] = [b"i4.2e", b"ie", b"i-e", b"i-0e", b"i03e", b"i+3e"];
        for input in inputs {
            assert_eq!(
                decode(input),
                Err(BencodeError::MalformedInteger { position: 0 }),
                "input {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_unterminated_values() {
        assert_eq!(
            decode(b"i42"),
            Err(BencodeError::UnterminatedInteger { position: 0 })
        );
        assert_eq!(
            decode(b"l4:spam"),
            Err(BencodeError::UnterminatedContainer { position: 0 })
        );
        assert_eq!(
            decode(b"d3:foo"),
            Err(BencodeError::UnterminatedContainer { position: 0 })
        );
        assert_eq!(
            decode(b"ll"),
            Err(BencodeError::UnterminatedContainer { position: 1 })
        );
    }

    #[test]
    fn test_malformed_length() {
        assert_eq!(
            decode(b"4spam"),
            Err(BencodeError::MalformedLength { position: 0 })
        );
        assert_eq!(
            decode(b"04:spam"),
            Err(BencodeError::MalformedLength { position: 0 })
        );
        assert_eq!(
            decode(b"99999999999999999999999:x"),
            Err(BencodeError::MalformedLength { position: 0 })
        );
    }

    #[test]
    fn test_non_string_key() {
        assert_eq!(
            decode(b"di1ei2ee"),
            Err(BencodeError::NonStringKey { position: 1 })
        );
    }

    #[test]
    fn test_duplicate_key() {
        assert_eq!(
            decode(b"d3:fooi1e3:fooi2ee"),
            Err(BencodeError::DuplicateKey { position: 9 })
        );
    }

    #[test]
    fn test_trailing_data() {
        assert_eq!(
            decode(b"i1ei2e"),
            Err(BencodeError::TrailingData {
                position: 3,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_invalid_token() {
        assert_eq!(
            decode(b"x"),
            Err(BencodeError::InvalidToken {
                byte: b'x',
                position: 0
            })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 1];
        deep.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 1));
        assert!(matches!(
            decode(&deep),
            Err(BencodeError::NestingTooDeep { .. })
        ));

        let mut ok = vec![b'l'; MAX_DEPTH];
        ok.extend(std::iter::repeat(b'e').take(MAX_DEPTH));
        assert!(decode(&ok).is_ok());
    }
}
