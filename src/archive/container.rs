//! Archive container format
//!
//! A container is a concatenation of independently decodable zstd frames.
//! Decompressed, it is a sequence of lines
//!
//! ```text
//! <index_key> \t <format_version> \t <body> \n
//! ```
//!
//! sorted ascending by index key, with `\`, tab and newline escaped in the
//! key and body fields. Because frames are independent, decoding may start
//! at any frame boundary.

use crate::measurement::{FormatVersion, MeasurementRef};
use crate::{Error, Result};

use bytes::Bytes;
use std::io::{BufRead, BufReader, Read};
use zstd::stream::read::Decoder;

/// Scanner over a zstd-compressed container read from `R`.
pub type ZstdScanner<R> = RecordScanner<BufReader<Decoder<'static, BufReader<R>>>>;

/// Open a scanner that decompresses `reader` as it goes.
pub fn open_scanner<R: Read>(reader: R, container: &str) -> Result<ZstdScanner<R>> {
    let decoder = Decoder::new(reader).map_err(|e| Error::CorruptArchive {
        container: container.to_string(),
        detail: e.to_string(),
    })?;
    Ok(RecordScanner::new(BufReader::new(decoder), container))
}

/// One decoded container line.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub index_key: String,
    pub format_version: FormatVersion,
    /// Body as stored; unescaped only when the record is wanted
    escaped_body: Vec<u8>,
}

impl ArchiveRecord {
    pub fn into_body(self) -> std::result::Result<Bytes, String> {
        unescape(&self.escaped_body).map(Bytes::from)
    }
}

fn escape_into(out: &mut Vec<u8>, raw: &[u8]) {
    for byte in raw {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            other => out.push(*other),
        }
    }
}

fn unescape(escaped: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(byte) = bytes.next() {
        if *byte != b'\\' {
            out.push(*byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(other) => return Err(format!("invalid escape sequence \\{}", *other as char)),
            None => return Err("dangling escape at end of field".to_string()),
        }
    }
    Ok(out)
}

fn parse_line(line: &[u8]) -> std::result::Result<ArchiveRecord, String> {
    let mut fields = line.splitn(3, |b| *b == b'\t');
    let (Some(key), Some(version), Some(body)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err("expected three tab separated fields".to_string());
    };

    let index_key = String::from_utf8(unescape(key)?)
        .map_err(|_| "index key is not valid UTF-8".to_string())?;
    let format_version = std::str::from_utf8(version)
        .map_err(|_| "format version is not valid UTF-8".to_string())?
        .parse::<FormatVersion>()?;

    Ok(ArchiveRecord {
        index_key,
        format_version,
        escaped_body: body.to_vec(),
    })
}

/// Lazy iterator over the records of a decompressed container.
///
/// Enforces ascending key order as it reads; any decode, framing or order
/// failure ends the iteration with [`Error::CorruptArchive`].
pub struct RecordScanner<R> {
    reader: R,
    container: String,
    line: Vec<u8>,
    previous_key: Option<String>,
    scanned: u64,
    done: bool,
}

impl<R: BufRead> RecordScanner<R> {
    pub fn new(reader: R, container: &str) -> Self {
        Self {
            reader,
            container: container.to_string(),
            line: Vec::new(),
            previous_key: None,
            scanned: 0,
            done: false,
        }
    }

    /// Records decoded so far
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    fn corrupt(&self, detail: impl Into<String>) -> Error {
        Error::CorruptArchive {
            container: self.container.clone(),
            detail: detail.into(),
        }
    }

    fn read_record(&mut self) -> Result<Option<ArchiveRecord>> {
        self.line.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.line)
            .map_err(|e| self.corrupt(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        if self.line.pop() != Some(b'\n') {
            return Err(self.corrupt("truncated record at end of container"));
        }

        let record = parse_line(&self.line).map_err(|detail| self.corrupt(detail))?;
        if let Some(previous) = &self.previous_key {
            if record.index_key <= *previous {
                return Err(self.corrupt(format!(
                    "record {:?} out of order after {:?}",
                    record.index_key, previous
                )));
            }
        }
        self.previous_key = Some(record.index_key.clone());
        self.scanned += 1;
        Ok(Some(record))
    }

    /// Scan for `index_key`, stopping at the first larger key.
    pub fn find(&mut self, index_key: &str) -> Result<Option<ArchiveRecord>> {
        while let Some(record) = self.next().transpose()? {
            match record.index_key.as_str().cmp(index_key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }
}

impl<R: BufRead> Iterator for RecordScanner<R> {
    type Item = Result<ArchiveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// An encoded container and the frame offset of every record in it.
#[derive(Debug, Clone)]
pub struct EncodedContainer {
    pub bytes: Bytes,
    pub frame_offsets: Vec<(String, u64)>,
}

impl EncodedContainer {
    pub fn frame_offset(&self, index_key: &str) -> Option<u64> {
        self.frame_offsets
            .iter()
            .find(|(key, _)| key == index_key)
            .map(|(_, offset)| *offset)
    }
}

/// Builds containers for fixtures and archive tooling.
#[derive(Debug)]
pub struct ContainerBuilder {
    records: Vec<(String, FormatVersion, Bytes)>,
    records_per_frame: usize,
    level: i32,
}

impl ContainerBuilder {
    pub fn new(records_per_frame: usize) -> Self {
        Self {
            records: Vec::new(),
            records_per_frame: records_per_frame.max(1),
            level: 3,
        }
    }

    pub fn add(
        &mut self,
        reference: &MeasurementRef,
        format_version: FormatVersion,
        body: impl Into<Bytes>,
    ) -> &mut Self {
        self.records
            .push((reference.index_key(), format_version, body.into()));
        self
    }

    pub fn finish(mut self) -> Result<EncodedContainer> {
        self.records.sort_by(|a, b| a.0.cmp(&b.0));
        self.records.dedup_by(|a, b| a.0 == b.0);

        let mut bytes = Vec::new();
        let mut frame_offsets = Vec::with_capacity(self.records.len());
        for frame in self.records.chunks(self.records_per_frame) {
            let offset = bytes.len() as u64;
            let mut plain = Vec::new();
            for (key, version, body) in frame {
                escape_into(&mut plain, key.as_bytes());
                plain.push(b'\t');
                plain.extend_from_slice(version.as_str().as_bytes());
                plain.push(b'\t');
                escape_into(&mut plain, body);
                plain.push(b'\n');
                frame_offsets.push((key.clone(), offset));
            }
            bytes.extend(zstd::stream::encode_all(&plain[..], self.level)?);
        }

        Ok(EncodedContainer {
            bytes: Bytes::from(bytes),
            frame_offsets,
        })
    }
}
