//! Fixed-size encryption header: parse and write
//!
//! Header format (ASCII, always exactly `HEADER_SIZE` bytes):
//! ```text
//! HBEGIN:oc_encryption_module:SFE_DEFAULT_MODULE:cipher:XCHACHA20-POLY1305:HEND-------...
//! ```
//!
//! Rules:
//! - `HBEGIN:` opens the block, `HEND` closes it, `-` pads to the block size
//! - Entries are `key:value:` pairs; the module key always comes first
//! - The stream reader consumes one full block before the ciphertext, so
//!   the serialized size never varies
//! - Anything that does not parse is "no header" (legacy plaintext), never an error

use sfe_core::{SfeError, SfeResult};

use crate::module::EncryptionModule;

/// Size of the header block in bytes
pub const HEADER_SIZE: usize = 8192;

pub const HEADER_START: &str = "HBEGIN";

pub const HEADER_END: &str = "HEND";

pub const HEADER_PADDING_CHAR: u8 = b'-';

/// Reserved key naming the module that wrote the file
pub const HEADER_MODULE_KEY: &str = "oc_encryption_module";

const SEPARATOR: u8 = b':';

/// Ordered string → string mapping stored in a file header.
///
/// Insertion order is preserved; inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (k, v) in iter {
            header.insert(k, v);
        }
        header
    }
}

/// Parse a raw header block.
///
/// Returns an empty header when the `HBEGIN:` prefix is missing, when `HEND`
/// is never reached, when a key has no value, or when a token is not UTF-8.
/// Only the first `HEADER_SIZE` bytes are examined.
pub fn parse_raw_header(raw: &[u8]) -> Header {
    let raw = &raw[..raw.len().min(HEADER_SIZE)];

    let Some(mut cursor) = raw
        .strip_prefix(HEADER_START.as_bytes())
        .and_then(|rest| rest.strip_prefix(&[SEPARATOR]))
    else {
        return Header::new();
    };

    let mut header = Header::new();
    loop {
        if cursor.starts_with(HEADER_END.as_bytes()) {
            return header;
        }
        let Some((key, rest)) = next_token(cursor) else {
            return Header::new();
        };
        let Some((value, rest)) = next_token(rest) else {
            return Header::new();
        };
        header.insert(key, value);
        cursor = rest;
    }
}

/// Read one `:`-terminated token.
fn next_token(input: &[u8]) -> Option<(&str, &[u8])> {
    let end = input.iter().position(|&b| b == SEPARATOR)?;
    let token = std::str::from_utf8(&input[..end]).ok()?;
    Some((token, &input[end + 1..]))
}

/// Serialize `fields` into a header block for `module`.
///
/// Fails with `HeaderKeyExists` if `fields` tries to set the reserved module
/// key, and with `InvalidHeader` if an entry would corrupt the tokenizer or
/// the block would overflow.
pub fn create_header(fields: &Header, module: &dyn EncryptionModule) -> SfeResult<Vec<u8>> {
    if fields.contains_key(HEADER_MODULE_KEY) {
        return Err(SfeError::HeaderKeyExists(HEADER_MODULE_KEY.to_string()));
    }

    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(HEADER_START.as_bytes());
    out.push(SEPARATOR);
    push_entry(&mut out, HEADER_MODULE_KEY, module.id())?;
    for (key, value) in fields.iter() {
        push_entry(&mut out, key, value)?;
    }
    out.extend_from_slice(HEADER_END.as_bytes());

    if out.len() > HEADER_SIZE {
        return Err(SfeError::InvalidHeader(format!(
            "serialized header is {} bytes (block size {HEADER_SIZE})",
            out.len()
        )));
    }
    out.resize(HEADER_SIZE, HEADER_PADDING_CHAR);
    Ok(out)
}

fn push_entry(out: &mut Vec<u8>, key: &str, value: &str) -> SfeResult<()> {
    if key.is_empty() || key.starts_with(HEADER_END) {
        return Err(SfeError::InvalidHeader(format!("unusable header key {key:?}")));
    }
    for part in [key, value] {
        if !part.is_ascii() || part.as_bytes().contains(&SEPARATOR) {
            return Err(SfeError::InvalidHeader(format!(
                "header entry {key:?} must be ASCII without ':'"
            )));
        }
    }
    out.extend_from_slice(key.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(value.as_bytes());
    out.push(SEPARATOR);
    Ok(())
}

/// Id of the module that wrote the file, or `""` for legacy content.
pub fn get_encryption_module_id(header: &Header) -> &str {
    header.get(HEADER_MODULE_KEY).unwrap_or("")
}

/// Split raw file content into its header and ciphertext body.
///
/// Content without a parseable header block is returned whole as the body.
pub fn split_header(raw: &[u8]) -> (Header, &[u8]) {
    if raw.len() >= HEADER_SIZE {
        let header = parse_raw_header(&raw[..HEADER_SIZE]);
        if !header.is_empty() {
            return (header, &raw[HEADER_SIZE..]);
        }
    }
    (Header::new(), raw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
