use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("{num_remaining} bytes left over after the top-level value")]
    UnconsumedContents { num_remaining: usize },
    #[error("input ended in the middle of a value")]
    InsufficientContents,
    #[error("unknown type marker {value:#04x} at {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("integer at {pos} has leading zeros")]
    IntegerWithLeadingZeros { pos: usize },
    #[error("integer at {pos} has no digits")]
    EmptyInteger { pos: usize },
    #[error("integer at {pos} is not representable")]
    IllegalInteger { pos: usize },
    #[error("value at {pos} is missing its 'e' terminator")]
    UnterminatedValue { pos: usize },
    #[error("string at {pos} is missing the ':' separator")]
    StringMissingSeparator { pos: usize },
    #[error("dictionary key at {pos} is not a byte string")]
    IllegalDictionaryKeyType { pos: usize },
    #[error("duplicate dictionary key '{name}'")]
    DuplicateDictionaryKey { name: String },
    #[error("dictionary key '{name}' is out of order")]
    DictionaryKeysOutOfOrder { name: String },
    #[error("container at {pos} is nested too deeply")]
    NestingTooDeep { pos: usize },
}

/// Deepest list/dictionary nesting the decoder accepts.
pub const MAX_DEPTH: usize = 256;

type Result<T> = std::result::Result<T, BencodeError>;

struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    if bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte)) {
        write!(f, "{}", String::from_utf8_lossy(bytes))
    } else {
        for byte in bytes {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{num}"),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            },
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {value}")?;
                }
                write!(f, "}}")
            },
        }
    }
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let mut parser = BencodeParser { contents: bytes, pos: 0, depth: 0 };
        let value = parser.parse_value()?;
        if parser.pos != bytes.len() {
            return Err(BencodeError::UnconsumedContents { num_remaining: bytes.len() - parser.pos });
        }
        Ok(value)
    }
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        let mut out = Vec::new();
        value.encode_into(&mut out);
        out
    }
}

impl BencodeValue {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => out.extend(format!("i{i}e").as_bytes()),
            BencodeValue::ByteString(bytes) => {
                out.extend(format!("{}:", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            },
            BencodeValue::List(elements) => {
                out.push(b'l');
                for element in elements {
                    element.encode_into(out);
                }
                out.push(b'e');
            },
            BencodeValue::Dictionary(items) => {
                // BTreeMap iterates keys in sorted order, which is the canonical form
                out.push(b'd');
                for (key, value) in items {
                    out.extend(format!("{}:", key.len()).as_bytes());
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            },
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl BencodeParser<'_> {
    fn peek(&self) -> Result<u8> {
        self.contents.get(self.pos).copied().ok_or(BencodeError::InsufficientContents)
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        let first = self.peek()?;
        match first {
            b'i' => self.parse_integer(),
            b'l' | b'd' => {
                if self.depth >= MAX_DEPTH {
                    return Err(BencodeError::NestingTooDeep { pos: self.pos });
                }
                self.depth += 1;
                let value = if first == b'l' { self.parse_list() } else { self.parse_dictionary() };
                self.depth -= 1;
                value
            },
            b'0'..=b'9' => self.parse_string(),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first }),
        }
    }

    fn parse_digits(&mut self, leading_zeros_allowed: bool) -> Result<i64> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let slice = &self.contents[start..self.pos];
        if slice.is_empty() {
            return Err(BencodeError::EmptyInteger { pos: start });
        }
        if !leading_zeros_allowed && slice[0] == b'0' && slice.len() > 1 {
            return Err(BencodeError::IntegerWithLeadingZeros { pos: start });
        }
        std::str::from_utf8(slice)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::IllegalInteger { pos: start })
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let value = self.parse_digits(false)?;
        if negative && value == 0 {
            return Err(BencodeError::IllegalInteger { pos: start });
        }
        self.expect_end(start)?;
        Ok(BencodeValue::Integer(if negative { -value } else { value }))
    }

    fn parse_byte_string(&mut self) -> Result<Vec<u8>> {
        let length = self.parse_digits(true)? as usize;
        if self.peek()? != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        self.pos += 1;
        let end = self.pos.checked_add(length).ok_or(BencodeError::InsufficientContents)?;
        let bytes = self.contents.get(self.pos..end).ok_or(BencodeError::InsufficientContents)?;
        self.pos = end;
        Ok(bytes.to_vec())
    }

    fn parse_string(&mut self) -> Result<BencodeValue> {
        self.parse_byte_string().map(BencodeValue::ByteString)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut values = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::IllegalDictionaryKeyType { pos: self.pos });
            }
            let key = self.parse_byte_string()?;
            if let Some((last, _)) = map.last_key_value() {
                let name = String::from_utf8_lossy(&key).into_owned();
                if key < *last {
                    return Err(BencodeError::DictionaryKeysOutOfOrder { name });
                } else if key == *last {
                    return Err(BencodeError::DuplicateDictionaryKey { name });
                }
            }
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn expect_end(&mut self, start: usize) -> Result<()> {
        if self.peek()? != b'e' {
            return Err(BencodeError::UnterminatedValue { pos: start });
        }
        self.pos += 1;
        Ok(())
    }
}
