//! Byte-stream document model.
//!
//! A stream is UTF-8 text interleaved with control records:
//!
//! ```text
//! [0x1B][kind][len hi][len lo][id b3..b0][payload ...][len hi][len lo][0x1B]
//! ```
//!
//! `len` covers the whole record. The trailer repeats it and ends with the escape byte, so a
//! backward step can recognise a record from the byte immediately before the cursor. Text never
//! contains 0x1B (it is replaced by a space on insertion).

use std::collections::HashMap;

use crate::error::RippleError;
use crate::records::{Record, RecordKind};

pub const ESC: u8 = 0x1B;
pub const HEADER_LEN: usize = 8;
pub const TRAILER_LEN: usize = 3;
pub const RECORD_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;
pub const MAX_RECORD_LEN: usize = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    bytes: Vec<u8>,
    next_id: u32,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of one control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub index: usize,
    pub kind: RecordKind,
    pub element_id: u32,
    pub payload: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn len(&self) -> usize {
        self.payload.len() + RECORD_OVERHEAD
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn end(&self) -> usize {
        self.index + self.len()
    }

    pub fn record(&self) -> Result<Record, RippleError> {
        Record::decode(self.kind, self.payload).ok_or_else(|| {
            RippleError::structural(
                self.index,
                format!("malformed {} payload", self.kind.name()),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit<'a> {
    /// A maximal run of text starting at `index`.
    Text { index: usize, text: &'a str },
    Record(RecordView<'a>),
}

impl<'a> Unit<'a> {
    pub fn index(&self) -> usize {
        match self {
            Unit::Text { index, .. } => *index,
            Unit::Record(view) => view.index,
        }
    }

    pub fn end(&self) -> usize {
        match self {
            Unit::Text { index, text } => index + text.len(),
            Unit::Record(view) => view.end(),
        }
    }
}

impl Stream {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            next_id: 1,
        }
    }

    /// Loads raw bytes, rejecting anything that does not walk cleanly from start to end.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, RippleError> {
        let mut stream = Self { bytes, next_id: 1 };
        let mut max_id = 0u32;
        for unit in stream.units(0, stream.len()) {
            if let Unit::Record(view) = unit? {
                max_id = max_id.max(view.element_id);
            }
        }
        stream.next_id = max_id.saturating_add(1).max(1);
        Ok(stream)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Length of the unit at `index`: the record length for a control record, otherwise the
    /// UTF-8 length of the character.
    pub fn record_length(&self, index: usize) -> Result<usize, RippleError> {
        let Some(&lead) = self.bytes.get(index) else {
            return Err(RippleError::structural(index, "index past end of stream"));
        };
        if lead == ESC {
            let hi = self.byte(index + 2)?;
            let lo = self.byte(index + 3)?;
            let len = ((hi as usize) << 8) | lo as usize;
            if len < RECORD_OVERHEAD || index + len > self.bytes.len() {
                return Err(RippleError::structural(index, "record length out of range"));
            }
            return Ok(len);
        }
        utf8_len(lead).ok_or_else(|| RippleError::structural(index, "index inside a character"))
    }

    /// Forward step over one character or record. `None` at the end or on malformed data.
    pub fn next_position(&self, index: usize) -> Option<usize> {
        if index >= self.bytes.len() {
            return None;
        }
        if self.bytes[index] == ESC {
            return self.decode(index).ok().map(|view| view.end());
        }
        let len = self.record_length(index).ok()?;
        Some((index + len).min(self.bytes.len()))
    }

    /// Backward step over one character or record using the trailer length.
    pub fn prev_position(&self, index: usize) -> Option<usize> {
        if index == 0 || index > self.bytes.len() {
            return None;
        }
        if self.bytes[index - 1] == ESC {
            if index < RECORD_OVERHEAD {
                return None;
            }
            let len = ((self.bytes[index - 3] as usize) << 8) | self.bytes[index - 2] as usize;
            let start = index.checked_sub(len)?;
            let view = self.decode(start).ok()?;
            return (view.end() == index).then_some(start);
        }
        let mut pos = index - 1;
        while pos > 0 && (self.bytes[pos] & 0xC0) == 0x80 {
            pos -= 1;
        }
        Some(pos)
    }

    /// Reads the record at `index` without copying its payload.
    pub fn decode(&self, index: usize) -> Result<RecordView<'_>, RippleError> {
        if self.bytes.get(index) != Some(&ESC) {
            return Err(RippleError::structural(index, "no record at index"));
        }
        let len = self.record_length(index)?;
        let kind_code = self.byte(index + 1)?;
        let kind = RecordKind::from_u8(kind_code).ok_or_else(|| {
            RippleError::structural(index, format!("unknown record kind {kind_code}"))
        })?;
        let end = index + len;
        let trailer = &self.bytes[end - TRAILER_LEN..end];
        let header_len = &self.bytes[index + 2..index + 4];
        if trailer[0] != header_len[0] || trailer[1] != header_len[1] || trailer[2] != ESC {
            return Err(RippleError::structural(
                index,
                "record trailer does not match header length",
            ));
        }
        let id_bytes = &self.bytes[index + 4..index + HEADER_LEN];
        let element_id = u32::from_be_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);
        Ok(RecordView {
            index,
            kind,
            element_id,
            payload: &self.bytes[index + HEADER_LEN..end - TRAILER_LEN],
        })
    }

    pub fn units(&self, start: usize, end: usize) -> Units<'_> {
        Units {
            stream: self,
            pos: start,
            end: end.min(self.bytes.len()),
            failed: false,
        }
    }

    /// Appends text, returning the index after it.
    pub fn push_text(&mut self, text: &str) -> Result<usize, RippleError> {
        let at = self.bytes.len();
        self.insert_text(at, text)
    }

    /// Appends a record, returning its element id.
    pub fn push_record(&mut self, record: &Record) -> Result<u32, RippleError> {
        let at = self.bytes.len();
        self.insert_record(at, record)?;
        Ok(self.next_id - 1)
    }

    /// Inserts a record at a unit boundary and returns the index just after it.
    pub fn insert_record(&mut self, index: usize, record: &Record) -> Result<usize, RippleError> {
        self.check_boundary(index)?;
        let payload = record.encode_payload();
        let total = payload.len() + RECORD_OVERHEAD;
        if total > MAX_RECORD_LEN {
            return Err(RippleError::Capacity(format!(
                "{} record of {} bytes exceeds the {} byte limit",
                record.kind().name(),
                total,
                MAX_RECORD_LEN
            )));
        }
        self.bytes.try_reserve(total)?;
        let id = self.next_id;
        let mut encoded = Vec::with_capacity(total);
        encoded.push(ESC);
        encoded.push(record.kind() as u8);
        encoded.push((total >> 8) as u8);
        encoded.push((total & 0xFF) as u8);
        encoded.extend_from_slice(&id.to_be_bytes());
        encoded.extend_from_slice(&payload);
        encoded.push((total >> 8) as u8);
        encoded.push((total & 0xFF) as u8);
        encoded.push(ESC);
        self.bytes.splice(index..index, encoded);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        Ok(index + total)
    }

    /// Inserts UTF-8 text at a unit boundary and returns the index just after it.
    pub fn insert_text(&mut self, index: usize, text: &str) -> Result<usize, RippleError> {
        self.check_boundary(index)?;
        self.bytes.try_reserve(text.len())?;
        let cleaned = text.bytes().map(|b| if b == ESC { b' ' } else { b });
        self.bytes.splice(index..index, cleaned);
        Ok(index + text.len())
    }

    /// Replaces the payload of an existing record with one of identical length, keeping its id.
    pub fn rewrite_record(&mut self, index: usize, record: &Record) -> Result<(), RippleError> {
        let view = self.decode(index)?;
        if view.kind != record.kind() {
            return Err(RippleError::structural(
                index,
                format!("cannot rewrite {} as {}", view.kind.name(), record.kind().name()),
            ));
        }
        let payload = record.encode_payload();
        if payload.len() != view.payload.len() {
            return Err(RippleError::Capacity(format!(
                "rewrite of {} changes payload length {} -> {}",
                view.kind.name(),
                view.payload.len(),
                payload.len()
            )));
        }
        let start = index + HEADER_LEN;
        self.bytes[start..start + payload.len()].copy_from_slice(&payload);
        Ok(())
    }

    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<(), RippleError> {
        if start > end {
            return Err(RippleError::structural(start, "inverted removal range"));
        }
        self.check_boundary(start)?;
        self.check_boundary(end)?;
        self.bytes.drain(start..end);
        Ok(())
    }

    /// Verifies that every record decodes and that text is valid UTF-8.
    pub fn validate(&self) -> Result<(), RippleError> {
        for unit in self.units(0, self.len()) {
            if let Unit::Record(view) = unit? {
                view.record()?;
            }
        }
        Ok(())
    }

    /// Pairs start and end records over `[start, end)`.
    pub fn scan_structure(&self, start: usize, end: usize) -> StructureMap {
        let mut map = StructureMap::default();
        let mut open: Vec<(RecordKind, usize)> = Vec::new();
        let end = end.min(self.bytes.len());
        for unit in self.units(start, end) {
            let view = match unit {
                Ok(Unit::Record(view)) => view,
                Ok(Unit::Text { .. }) => continue,
                Err(err) => {
                    map.fault = Some(err);
                    break;
                }
            };
            if view.kind.closing().is_some() {
                open.push((view.kind, view.index));
                continue;
            }
            let Some(opener) = view.kind.opening() else {
                continue;
            };
            match open.iter().rposition(|(kind, _)| *kind == opener) {
                Some(pos) => {
                    for (kind, index) in open.drain(pos + 1..) {
                        map.unterminated.insert(index, (kind, view.index));
                    }
                    if let Some((_, index)) = open.pop() {
                        map.pairs.insert(index, view.index);
                    }
                }
                None => map.stray.push(view.index),
            }
        }
        let cut = map
            .fault
            .as_ref()
            .and_then(|err| match err {
                RippleError::Structural { index, .. } => Some(*index),
                _ => None,
            })
            .unwrap_or(end);
        for (kind, index) in open {
            map.unterminated.insert(index, (kind, cut));
        }
        map
    }

    /// Element id of the record at `index`, if there is one.
    pub fn element_id(&self, index: usize) -> Option<u32> {
        self.decode(index).ok().map(|view| view.element_id)
    }

    fn check_boundary(&self, index: usize) -> Result<(), RippleError> {
        if index == self.bytes.len() || index == 0 {
            return Ok(());
        }
        if index > self.bytes.len() {
            return Err(RippleError::structural(index, "index past end of stream"));
        }
        let mut pos = 0;
        while pos < index {
            pos += self.record_length(pos)?;
        }
        if pos == index {
            Ok(())
        } else {
            Err(RippleError::structural(index, "index is not a unit boundary"))
        }
    }

    fn byte(&self, index: usize) -> Result<u8, RippleError> {
        self.bytes
            .get(index)
            .copied()
            .ok_or_else(|| RippleError::structural(index, "truncated record header"))
    }
}

fn utf8_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

/// Iterator over text runs and records. Yields one error and stops on malformed data.
pub struct Units<'a> {
    stream: &'a Stream,
    pos: usize,
    end: usize,
    failed: bool,
}

impl<'a> Iterator for Units<'a> {
    type Item = Result<Unit<'a>, RippleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.end {
            return None;
        }
        let bytes = &self.stream.bytes;
        if bytes[self.pos] == ESC {
            return match self.stream.decode(self.pos) {
                Ok(view) => {
                    self.pos = view.end();
                    Some(Ok(Unit::Record(view)))
                }
                Err(err) => {
                    self.failed = true;
                    Some(Err(err))
                }
            };
        }
        let start = self.pos;
        let stop = bytes[start..self.end]
            .iter()
            .position(|&b| b == ESC)
            .map(|offset| start + offset)
            .unwrap_or(self.end);
        match std::str::from_utf8(&bytes[start..stop]) {
            Ok(text) => {
                self.pos = stop;
                Some(Ok(Unit::Text { index: start, text }))
            }
            Err(_) => {
                self.failed = true;
                Some(Err(RippleError::structural(start, "text run is not valid UTF-8")))
            }
        }
    }
}

/// Result of pairing start and end records.
#[derive(Debug, Default)]
pub struct StructureMap {
    pairs: HashMap<usize, usize>,
    /// Start index -> (kind, index where the construct is cut off).
    unterminated: HashMap<usize, (RecordKind, usize)>,
    stray: Vec<usize>,
    fault: Option<RippleError>,
}

impl StructureMap {
    /// Index of the end record matching the start record at `start`.
    pub fn closing_of(&self, start: usize) -> Option<usize> {
        self.pairs.get(&start).copied()
    }

    /// Where an unterminated start record's content stops.
    pub fn cut_of(&self, start: usize) -> Option<usize> {
        self.unterminated.get(&start).map(|(_, cut)| *cut)
    }

    pub fn unterminated(&self) -> impl Iterator<Item = (usize, RecordKind)> + '_ {
        self.unterminated.iter().map(|(index, (kind, _))| (*index, *kind))
    }

    pub fn stray(&self) -> &[usize] {
        &self.stray
    }

    pub fn fault(&self) -> Option<&RippleError> {
        self.fault.as_ref()
    }

    pub fn is_balanced(&self) -> bool {
        self.unterminated.is_empty() && self.stray.is_empty() && self.fault.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::IndexStart;

    fn sample() -> Stream {
        let mut stream = Stream::new();
        stream.push_text("Hé").unwrap();
        stream.push_record(&Record::ParagraphStart(Default::default())).unwrap();
        stream.push_text("a€").unwrap();
        stream.push_record(&Record::ParagraphEnd).unwrap();
        stream
    }

    #[test]
    fn record_layout_is_bit_exact() {
        let mut stream = Stream::new();
        let id = stream.push_record(&Record::Inverse(true)).unwrap();
        assert_eq!(id, 1);
        let bytes = stream.as_bytes();
        assert_eq!(bytes.len(), RECORD_OVERHEAD + 1);
        assert_eq!(bytes[0], ESC);
        assert_eq!(bytes[1], RecordKind::Inverse as u8);
        assert_eq!(&bytes[2..4], &[0x00, 12]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..12], &[0x00, 12, ESC]);
    }

    #[test]
    fn next_and_prev_are_inverse_at_every_boundary() {
        let stream = sample();
        let mut forward = vec![0];
        let mut pos = 0;
        while let Some(next) = stream.next_position(pos) {
            forward.push(next);
            pos = next;
        }
        assert_eq!(pos, stream.len());
        for pair in forward.windows(2) {
            assert_eq!(stream.prev_position(pair[1]), Some(pair[0]), "step back from {}", pair[1]);
        }
        assert_eq!(stream.prev_position(0), None);
        assert_eq!(stream.next_position(stream.len()), None);
    }

    #[test]
    fn record_length_reports_chars_and_records() {
        let stream = sample();
        assert_eq!(stream.record_length(0).unwrap(), 1);
        assert_eq!(stream.record_length(1).unwrap(), 2);
        let record_len = stream.record_length(3).unwrap();
        assert_eq!(stream.decode(3).unwrap().len(), record_len);
        assert!(stream.record_length(2).is_err(), "continuation byte is not a unit");
    }

    #[test]
    fn insertion_rejects_oversized_records_without_mutation() {
        let mut stream = sample();
        let before = stream.clone();
        let huge = Record::ParagraphStart(crate::records::ParagraphStart {
            value: "x".repeat(MAX_RECORD_LEN),
            ..Default::default()
        });
        let err = stream.insert_record(0, &huge).unwrap_err();
        assert!(matches!(err, RippleError::Capacity(_)));
        assert_eq!(stream, before);
    }

    #[test]
    fn insertion_inside_a_record_is_rejected() {
        let mut stream = sample();
        assert!(stream.insert_text(5, "x").is_err());
        let after = stream.insert_text(3, "x").unwrap();
        assert_eq!(after, 4);
        stream.validate().unwrap();
    }

    #[test]
    fn escape_bytes_in_text_become_spaces() {
        let mut stream = Stream::new();
        stream.push_text("a\u{1b}b").unwrap();
        assert_eq!(stream.as_bytes(), b"a b");
    }

    #[test]
    fn mismatched_trailer_stops_traversal_with_structural_error() {
        let mut bytes = sample().as_bytes().to_vec();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        let stream = Stream { bytes, next_id: 1 };
        let results: Vec<_> = stream.units(0, stream.len()).collect();
        assert!(matches!(results.last(), Some(Err(RippleError::Structural { .. }))));
        assert!(Stream::from_bytes(stream.as_bytes().to_vec()).is_err());
    }

    #[test]
    fn rewrite_keeps_length_and_element_id() {
        let mut stream = Stream::new();
        let index_record = Record::IndexStart(IndexStart {
            name_hash: 7,
            id: 3,
            visible: true,
        });
        stream.push_record(&index_record).unwrap();
        let before_id = stream.element_id(0);
        stream
            .rewrite_record(
                0,
                &Record::IndexStart(IndexStart {
                    name_hash: 7,
                    id: 3,
                    visible: false,
                }),
            )
            .unwrap();
        assert_eq!(stream.element_id(0), before_id);
        match stream.decode(0).unwrap().record().unwrap() {
            Record::IndexStart(index) => assert!(!index.visible),
            other => panic!("unexpected record {other:?}"),
        }
        assert!(stream.rewrite_record(0, &Record::IndexEnd { id: 3 }).is_err());
    }

    #[test]
    fn structure_scan_reports_unterminated_and_stray() {
        let mut stream = Stream::new();
        let table = stream.len();
        stream
            .push_record(&Record::TableStart(Default::default()))
            .unwrap();
        stream.push_text("x").unwrap();
        stream.push_record(&Record::ListEnd).unwrap();
        let map = stream.scan_structure(0, stream.len());
        assert_eq!(map.cut_of(table), Some(stream.len()));
        assert_eq!(map.stray().len(), 1);
        assert!(!map.is_balanced());

        let balanced = sample();
        let map = balanced.scan_structure(0, balanced.len());
        assert!(map.is_balanced());
        assert_eq!(map.closing_of(3).map(|end| balanced.decode(end).unwrap().kind), Some(RecordKind::ParagraphEnd));
    }

    #[test]
    fn from_bytes_continues_element_ids() {
        let stream = sample();
        let mut reloaded = Stream::from_bytes(stream.as_bytes().to_vec()).unwrap();
        let id = reloaded.push_record(&Record::LinkEnd).unwrap();
        assert_eq!(id, 3);
    }
}
