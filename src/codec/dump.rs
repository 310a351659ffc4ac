use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::error::ForceError;

/// One whitespace-split dump line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRow {
    pub identifier: String,
    pub value_tokens: Vec<String>,
}

impl DumpRow {
    fn from_line(line: &str) -> Option<DumpRow> {
        let mut tokens = line.split_whitespace();
        let identifier = tokens.next()?.to_string();
        Some(DumpRow {
            identifier,
            value_tokens: tokens.map(str::to_string).collect(),
        })
    }
}

/// Lazily splits a dump into [`DumpRow`]s. Blank lines are dropped; nothing else is validated.
///
/// Lines are decoded lossily, so stray non-UTF-8 bytes only garble the line they sit on.
pub struct DumpParser<R> {
    reader: R,
    buf: Vec<u8>,
}

impl DumpParser<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ForceError> {
        tracing::debug!("Opening dump {:?}", path.as_ref());
        Ok(DumpParser::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> DumpParser<R> {
    pub fn new(reader: R) -> Self {
        DumpParser {
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for DumpParser<R> {
    type Item = Result<DumpRow, ForceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    if let Some(row) = DumpRow::from_line(&line) {
                        return Some(Ok(row));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Decoded form of a dump identifier token: the first hex byte is an ASCII category letter,
/// the remaining hex digits a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalName {
    pub category: char,
    pub sequence: u64,
}

impl CanonicalName {
    /// `None` when either hex segment fails to parse or the sequence segment is empty.
    pub fn decode(token: &str) -> Option<CanonicalName> {
        let category_hex = token.get(..2)?;
        let sequence_hex = token.get(2..)?;
        let category = hex::decode(category_hex).ok()?.first().copied()?;
        let sequence = u64::from_str_radix(sequence_hex, 16).ok()?;
        Some(CanonicalName {
            category: char::from(category),
            sequence,
        })
    }

    /// Identifier token as the controller writes it. `None` if the category does not fit in a
    /// single byte.
    pub fn encode(&self) -> Option<String> {
        let byte = u8::try_from(u32::from(self.category)).ok()?;
        Some(format!("{}{:X}", hex::encode_upper([byte]), self.sequence))
    }
}

impl Display for CanonicalName {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}{:05}", self.category, self.sequence)
    }
}

/// Rewrite a row's identifier to its canonical bit name, or hand the row back untouched if the
/// identifier does not decode.
pub fn decode_row(row: DumpRow) -> DumpRow {
    match CanonicalName::decode(&row.identifier) {
        Some(name) => DumpRow {
            identifier: name.to_string(),
            value_tokens: row.value_tokens,
        },
        None => {
            tracing::debug!(
                "Identifier {:?} does not decode, passing through",
                row.identifier
            );
            row
        }
    }
}
