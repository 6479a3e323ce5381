//! The section-tagged state stream

use crate::absorb::Absorb;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Fields are loaded from the stream
    Read,
    /// Fields are appended to the stream
    Write,
    /// Only the encoded size is computed
    Measure,
}

/// Why a stream stopped accepting sections
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Expected section {expected:?}, found {found:?}")]
    NameMismatch { expected: String, found: String },

    #[error("Section {section:?} has version {stored}, newest supported is {supported}")]
    VersionTooNew {
        section: String,
        stored: u32,
        supported: u32,
    },

    #[error("Stream truncated in section {section:?}")]
    Truncated { section: String },

    #[error("Invalid string in section {section:?}")]
    InvalidString { section: String },

    #[error("Corrupt data in section {section:?}: {detail}")]
    Corrupt { section: String, detail: String },
}

#[derive(Debug)]
struct OpenSection {
    name: String,
    version: u32,
    /// Read: offset of the section end. Write: offset of the length field.
    marker: usize,
}

/// A versioned, section-tagged save/restore stream
///
/// Every stateful entity calls [`StateStream::section`] with its section
/// name and layout version, and absorbs its fields inside the closure in
/// a fixed order. The same code path saves and loads.
///
/// # Wire format
///
/// ```text
/// name_len: u16 | name | version: u32 | body_len: u32 | body
/// ```
///
/// All integers are little-endian; strings and containers carry a `u32`
/// length prefix.
///
/// # Failure
///
/// A section that cannot be opened in read mode (different name, newer
/// version, truncated header) is skipped and marks the stream failed. All
/// later sections and absorbs are no-ops, so state loaded before the
/// failure is left intact.
#[derive(Debug)]
pub struct StateStream {
    mode: StreamMode,
    buffer: Vec<u8>,
    cursor: usize,
    measured: usize,
    open: Vec<OpenSection>,
    error: Option<StreamError>,
}

impl StateStream {
    fn with_mode(mode: StreamMode, buffer: Vec<u8>) -> Self {
        Self {
            mode,
            buffer,
            cursor: 0,
            measured: 0,
            open: Vec::new(),
            error: None,
        }
    }

    /// Creates an empty stream for saving
    pub fn writer() -> Self {
        Self::with_mode(StreamMode::Write, Vec::new())
    }

    /// Creates an empty stream for saving with room for `capacity` bytes
    pub fn writer_with_capacity(capacity: usize) -> Self {
        Self::with_mode(StreamMode::Write, Vec::with_capacity(capacity))
    }

    /// Creates a stream that only measures the encoded size
    pub fn measurer() -> Self {
        Self::with_mode(StreamMode::Measure, Vec::new())
    }

    /// Creates a stream loading from `bytes`
    pub fn reader(bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_mode(StreamMode::Read, bytes.into())
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == StreamMode::Read
    }

    /// Returns true once a section failed to open or a read ran short
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// The first failure, if any
    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    /// Encoded size so far
    pub fn len(&self) -> usize {
        match self.mode {
            StreamMode::Measure => self.measured,
            _ => self.buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a reader has consumed every byte
    pub fn at_end(&self) -> bool {
        self.cursor >= self.buffer.len()
    }

    /// Version of the innermost open section
    ///
    /// When reading this is the stored version, which may be older than
    /// the version the caller asked for.
    pub fn version(&self) -> u32 {
        self.open.last().map(|s| s.version).unwrap_or(0)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// SHA-256 of the encoded bytes
    ///
    /// Two machines in identical state produce identical digests.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.buffer);
        hasher.finalize().into()
    }

    /// Lower-case hex rendering of [`StateStream::digest`]
    pub fn digest_hex(&self) -> String {
        self.digest().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Opens a named, versioned section and runs `body` inside it
    ///
    /// Returns false if the section could not be opened or the stream
    /// failed while absorbing the body.
    pub fn section<F>(&mut self, name: &str, version: u32, body: F) -> bool
    where
        F: FnOnce(&mut StateStream),
    {
        if self.is_failed() {
            return false;
        }

        match self.mode {
            StreamMode::Write => {
                self.put(&(name.len() as u16).to_le_bytes());
                self.put(name.as_bytes());
                self.put(&version.to_le_bytes());
                let marker = self.buffer.len();
                self.put(&0u32.to_le_bytes());

                self.open.push(OpenSection {
                    name: name.to_string(),
                    version,
                    marker,
                });
                body(self);
                self.open.pop();

                let body_len = (self.buffer.len() - marker - 4) as u32;
                self.buffer[marker..marker + 4].copy_from_slice(&body_len.to_le_bytes());
                true
            }
            StreamMode::Measure => {
                self.measured += 2 + name.len() + 4 + 4;
                self.open.push(OpenSection {
                    name: name.to_string(),
                    version,
                    marker: 0,
                });
                body(self);
                self.open.pop();
                true
            }
            StreamMode::Read => {
                let Some((stored_version, end)) = self.open_for_read(name, version) else {
                    return false;
                };

                self.open.push(OpenSection {
                    name: name.to_string(),
                    version: stored_version,
                    marker: end,
                });
                body(self);
                self.open.pop();

                if self.is_failed() {
                    return false;
                }
                // Skip fields appended by a newer minor layout
                self.cursor = end;
                true
            }
        }
    }

    fn open_for_read(&mut self, name: &str, version: u32) -> Option<(u32, usize)> {
        let name_len = u16::from_le_bytes(self.take_array::<2>(name)?) as usize;
        let stored_name = self.take_header(name, name_len)?.to_vec();
        if stored_name != name.as_bytes() {
            self.fail(StreamError::NameMismatch {
                expected: name.to_string(),
                found: String::from_utf8_lossy(&stored_name).into_owned(),
            });
            return None;
        }

        let stored_version = u32::from_le_bytes(self.take_array::<4>(name)?);
        if stored_version > version {
            self.fail(StreamError::VersionTooNew {
                section: name.to_string(),
                stored: stored_version,
                supported: version,
            });
            return None;
        }

        let body_len = u32::from_le_bytes(self.take_array::<4>(name)?) as usize;
        if self.cursor + body_len > self.limit() {
            self.fail(StreamError::Truncated {
                section: name.to_string(),
            });
            return None;
        }

        Some((stored_version, self.cursor + body_len))
    }

    fn take_header(&mut self, section: &str, len: usize) -> Option<&[u8]> {
        if self.cursor + len > self.limit() {
            self.fail(StreamError::Truncated {
                section: section.to_string(),
            });
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(&self.buffer[start..start + len])
    }

    fn take_array<const N: usize>(&mut self, section: &str) -> Option<[u8; N]> {
        let bytes = self.take_header(section, N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        Some(raw)
    }

    /// End of the readable region: the innermost open section, or the buffer
    fn limit(&self) -> usize {
        self.open
            .last()
            .map(|s| s.marker)
            .unwrap_or(self.buffer.len())
            .min(self.buffer.len())
    }

    fn current_section(&self) -> String {
        self.open
            .last()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "<root>".to_string())
    }

    pub(crate) fn fail(&mut self, error: StreamError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Marks the stream failed because a decoded value makes no sense
    ///
    /// The enclosing section then reports failure and later sections are
    /// skipped, as for a truncated stream.
    pub fn fail_corrupt(&mut self, detail: impl Into<String>) {
        let section = self.current_section();
        self.fail(StreamError::Corrupt {
            section,
            detail: detail.into(),
        });
    }

    pub(crate) fn fail_invalid_string(&mut self) {
        let section = self.current_section();
        self.fail(StreamError::InvalidString { section });
    }

    /// Bytes left in the innermost open section
    pub(crate) fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.cursor)
    }

    /// Appends raw bytes (write) or counts them (measure)
    pub(crate) fn put(&mut self, bytes: &[u8]) {
        match self.mode {
            StreamMode::Write => self.buffer.extend_from_slice(bytes),
            StreamMode::Measure => self.measured += bytes.len(),
            StreamMode::Read => {}
        }
    }

    /// Consumes raw bytes from the innermost open section
    pub(crate) fn take(&mut self, len: usize) -> Option<&[u8]> {
        if self.is_failed() {
            return None;
        }
        if len > self.remaining() {
            let section = self.current_section();
            self.fail(StreamError::Truncated { section });
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(&self.buffer[start..start + len])
    }

    /// Saves or loads one field
    pub fn absorb<T: Absorb + ?Sized>(&mut self, value: &mut T) {
        if self.is_failed() {
            return;
        }
        value.absorb(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut stream = StateStream::writer();
        let mut a = 7u32;
        let mut b = String::from("Main");
        stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.absorb(&mut b);
        });
        let mut c = -3i32;
        stream.section("Second", 2, |s| s.absorb(&mut c));
        stream.into_bytes()
    }

    #[test]
    fn test_section_header_layout() {
        let bytes = sample();
        assert_eq!(&bytes[0..2], &5u16.to_le_bytes());
        assert_eq!(&bytes[2..7], b"First");
        assert_eq!(&bytes[7..11], &1u32.to_le_bytes());
        // u32 field plus length-prefixed "Main"
        assert_eq!(&bytes[11..15], &(4u32 + 4 + 4).to_le_bytes());
    }

    #[test]
    fn test_measure_matches_write() {
        let bytes = sample();
        let mut stream = StateStream::measurer();
        let mut a = 7u32;
        let mut b = String::from("Main");
        stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.absorb(&mut b);
        });
        let mut c = -3i32;
        stream.section("Second", 2, |s| s.absorb(&mut c));
        assert_eq!(stream.len(), bytes.len());
        assert!(stream.bytes().is_empty());
    }

    #[test]
    fn test_read_back() {
        let mut stream = StateStream::reader(sample());
        let mut a = 0u32;
        let mut b = String::new();
        let mut c = 0i32;
        assert!(stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.absorb(&mut b);
        }));
        assert!(stream.section("Second", 2, |s| s.absorb(&mut c)));
        assert_eq!((a, b.as_str(), c), (7, "Main", -3));
        assert!(stream.at_end());
    }

    #[test]
    fn test_name_mismatch_stops_reading() {
        let mut stream = StateStream::reader(sample());
        let mut ran = false;
        assert!(!stream.section("Other", 1, |_| ran = true));
        assert!(!ran);
        assert!(matches!(
            stream.error(),
            Some(StreamError::NameMismatch { .. })
        ));

        // Later sections are no-ops
        let mut c = 0i32;
        assert!(!stream.section("Second", 2, |s| s.absorb(&mut c)));
        assert_eq!(c, 0);
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut stream = StateStream::reader(sample());
        let mut a = 0u32;
        let mut b = String::new();
        assert!(stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.absorb(&mut b);
        }));
        let mut c = 0i32;
        // Stored version 2 is newer than what this reader understands
        assert!(!stream.section("Second", 1, |s| s.absorb(&mut c)));
        assert_eq!(
            stream.error(),
            Some(&StreamError::VersionTooNew {
                section: "Second".into(),
                stored: 2,
                supported: 1
            })
        );
        // State read before the failure survives
        assert_eq!(a, 7);
        assert_eq!(c, 0);
    }

    #[test]
    fn test_older_version_accepted() {
        let mut stream = StateStream::reader(sample());
        let mut seen = 0;
        assert!(stream.section("First", 3, |s| seen = s.version()));
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_unread_trailing_fields_skipped() {
        let mut stream = StateStream::reader(sample());
        let mut a = 0u32;
        // Reader only knows the first field of "First"
        assert!(stream.section("First", 1, |s| s.absorb(&mut a)));
        let mut c = 0i32;
        assert!(stream.section("Second", 2, |s| s.absorb(&mut c)));
        assert_eq!((a, c), (7, -3));
    }

    #[test]
    fn test_truncated_stream() {
        let mut bytes = sample();
        bytes.truncate(bytes.len() - 2);
        let mut stream = StateStream::reader(bytes);
        let mut a = 0u32;
        let mut b = String::new();
        assert!(stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.absorb(&mut b);
        }));
        let mut c = 0i32;
        assert!(!stream.section("Second", 2, |s| s.absorb(&mut c)));
        assert!(matches!(stream.error(), Some(StreamError::Truncated { .. })));
    }

    #[test]
    fn test_corrupt_value_fails_section() {
        let mut stream = StateStream::reader(sample());
        let mut a = 0u32;
        assert!(!stream.section("First", 1, |s| {
            s.absorb(&mut a);
            s.fail_corrupt("bad count");
        }));
        assert_eq!(
            stream.error(),
            Some(&StreamError::Corrupt {
                section: "First".to_string(),
                detail: "bad count".to_string(),
            })
        );

        let mut c = 0i32;
        assert!(!stream.section("Second", 2, |s| s.absorb(&mut c)));
        assert_eq!(c, 0);
    }

    #[test]
    fn test_read_past_section_end_fails() {
        let mut stream = StateStream::reader(sample());
        let mut c = 0i32;
        let mut extra = 0u64;
        stream.section("First", 1, |_| {});
        assert!(!stream.section("Second", 2, |s| {
            s.absorb(&mut c);
            s.absorb(&mut extra);
        }));
        assert_eq!(extra, 0);
    }

    #[test]
    fn test_nested_sections() {
        let mut stream = StateStream::writer();
        let mut outer = 1u8;
        let mut inner = 2u8;
        stream.section("Outer", 1, |s| {
            s.absorb(&mut outer);
            s.section("Inner", 1, |s| s.absorb(&mut inner));
        });
        let bytes = stream.into_bytes();

        let mut stream = StateStream::reader(bytes);
        let (mut outer, mut inner) = (0u8, 0u8);
        assert!(stream.section("Outer", 1, |s| {
            s.absorb(&mut outer);
            s.section("Inner", 1, |s| s.absorb(&mut inner));
        }));
        assert_eq!((outer, inner), (1, 2));
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = StateStream::reader(sample());
        let b = StateStream::reader(sample());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest_hex().len(), 64);

        let empty = StateStream::writer();
        assert_ne!(empty.digest(), a.digest());
    }
}
