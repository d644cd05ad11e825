// Copyright (c) 2025 Snowfetch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming parse of chunk bodies into row storage.
//!
//! Chunk bodies arrive from storage as consecutive comma-separated JSON row
//! arrays with no enclosing brackets:
//!
//! ```text
//! ["val1", "val2", null, ...],
//! ["val3", "val4", null, ...],
//! ...
//! ```
//!
//! To parse this as JSON, a `[` prefix and `]` suffix are chained around
//! the byte stream — stream concatenation, never string building — and the
//! resulting array is walked in a single pass with a seeded deserializer
//! that appends each row straight into the chunk's row storage.

use crate::error::{Error, Result};
use crate::types::ResultChunk;
use serde::de::{self, DeserializeSeed, SeqAccess, Visitor};
use serde::Deserializer;
use std::fmt;
use std::io::Read;

/// Parse a chunk body into `chunk`'s row storage.
///
/// `reader` yields the decoded body (already decompressed when the response
/// was gzip-encoded). Every row must have exactly `chunk.column_count()`
/// values; a mismatch or malformed JSON is a parse error naming the chunk.
pub(crate) fn parse_chunk_into<R: Read>(reader: R, chunk: &mut ResultChunk) -> Result<()> {
    let chunk_index = chunk.chunk_index();
    let framed = (&b"["[..]).chain(reader).chain(&b"]"[..]);
    let mut deserializer = serde_json::Deserializer::from_reader(framed);

    RowSink { chunk }
        .deserialize(&mut deserializer)
        .map_err(|e| Error::Parse(format!("chunk {}: {}", chunk_index, e)))
}

/// Seed that drains the synthesized row array into the target chunk.
struct RowSink<'a> {
    chunk: &'a mut ResultChunk,
}

impl<'de> DeserializeSeed<'de> for RowSink<'_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowSink<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of row arrays")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        let column_count = self.chunk.column_count();
        let mut row_index = 0;
        while let Some(row) = seq.next_element_seed(RowSeed {
            column_count,
            row_index,
        })? {
            self.chunk.push_row(row);
            row_index += 1;
        }
        Ok(())
    }
}

/// Seed for one row: a JSON array of exactly `column_count` cells.
struct RowSeed {
    column_count: usize,
    row_index: usize,
}

impl<'de> DeserializeSeed<'de> for RowSeed {
    type Value = Vec<Option<String>>;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for RowSeed {
    type Value = Vec<Option<String>>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a row array of {} values", self.column_count)
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut row = Vec::with_capacity(self.column_count);
        while let Some(Cell(value)) = seq.next_element()? {
            row.push(value);
        }

        if row.len() != self.column_count {
            return Err(de::Error::custom(format!(
                "row {} has {} values, expected {}",
                self.row_index,
                row.len(),
                self.column_count
            )));
        }

        Ok(row)
    }
}

/// One cell value: a string, `null`, or a primitive kept in its literal
/// text form.
struct Cell(Option<String>);

impl<'de> de::Deserialize<'de> for Cell {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(CellVisitor)
    }
}

struct CellVisitor;

impl Visitor<'_> for CellVisitor {
    type Value = Cell;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a string, number, boolean, or null")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v.to_owned())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v)))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Cell, E> {
        Ok(Cell(None))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v.to_string())))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v.to_string())))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v.to_string())))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Cell, E> {
        Ok(Cell(Some(v.to_string())))
    }
}
