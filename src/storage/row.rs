//! Row model and the row <-> leaf-cell payload codec.
//!
//! A row is the schema-ordered list of optional values plus the engine's
//! internal row-id. On disk the leaf cell stores a NULL bitmask and the
//! non-null column values back to back; masked-null columns occupy no
//! bytes, and the remainder of the fixed row slot is padding. Text columns
//! occupy a TextPointer slot: a length prefix followed by inline bytes or
//! the first page of an overflow chain.

use super::column::{Column, ColumnKind, Value};
use super::encoding::{trim_nul, ByteReader, ByteWriter};
use super::overflow;
use super::txn::TxPager;
use crate::config::EngineConfig;
use crate::errors::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Engine-assigned row identifier, independent of any user primary key.
    pub id: u64,
    /// One entry per table column, in definition order.
    pub values: Vec<Option<Value>>,
}

impl Row {
    pub fn new(id: u64, values: Vec<Option<Value>>) -> Self {
        Row { id, values }
    }

    /// Bit `i` set means column `i` is NULL.
    pub fn null_mask(&self) -> u64 {
        let mut mask = 0u64;
        for (i, value) in self.values.iter().enumerate() {
            if value.is_none() {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Looks a value up by column name.
    pub fn value<'a>(
        &'a self,
        columns: &[Column],
        name: &str,
    ) -> Result<&'a Option<Value>, Error> {
        let idx = columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| err!(FieldUnknown, "no column named '{}'", name))?;
        Ok(&self.values[idx])
    }
}

/// Fixed on-disk size of a row with the given columns.
pub fn row_size(columns: &[Column], max_inline: usize) -> usize {
    columns.iter().map(|c| c.kind.disk_size(max_inline)).sum()
}

/// Checks a row against its columns: arity, NULLability, kinds and text
/// length limits. Validation failures have no side effects.
pub fn validate_row(columns: &[Column], row: &Row, config: &EngineConfig) -> Result<(), Error> {
    if row.values.len() != columns.len() {
        return Err(err!(
            UnrecognizedStatement,
            "row has {} values, table has {} columns",
            row.values.len(),
            columns.len()
        ));
    }
    for (column, value) in columns.iter().zip(&row.values) {
        let value = match value {
            None => {
                if !column.nullable {
                    return Err(err!(
                        NullInNonNullable,
                        "column '{}' is not nullable",
                        column.name
                    ));
                }
                continue;
            }
            Some(value) => value,
        };
        if !value.matches_kind(&column.kind) {
            return Err(err!(
                UnrecognizedStatement,
                "value {} is not valid for column '{}' of kind {}",
                value,
                column.name,
                column.kind
            ));
        }
        if let Value::Text(s) = value {
            let limit = match column.kind {
                ColumnKind::Varchar(n) => n as usize,
                _ => config.max_overflow_text_size,
            };
            if s.len() > limit {
                return Err(err!(
                    RowTooLarge,
                    "value of {} bytes exceeds the {}-byte limit of column '{}'",
                    s.len(),
                    limit,
                    column.name
                ));
            }
        }
    }
    Ok(())
}

/// Serializes a row into a fixed-size payload, spilling oversized texts to
/// overflow chains. Returns the NULL bitmask and the padded payload.
pub fn encode_row(
    txn: &mut TxPager,
    columns: &[Column],
    row: &Row,
    config: &EngineConfig,
) -> Result<(u64, Vec<u8>), Error> {
    let size = row_size(columns, config.max_inline_varchar);
    let mut w = ByteWriter::with_capacity(size);

    for (column, value) in columns.iter().zip(&row.values) {
        let value = match value {
            None => continue,
            Some(value) => value,
        };
        match value {
            Value::Boolean(v) => w.put_bool(*v),
            Value::Int4(v) => w.put_i32(*v),
            Value::Int8(v) => w.put_i64(*v),
            Value::Real(v) => w.put_f32(*v),
            Value::Double(v) => w.put_f64(*v),
            Value::Text(s) => {
                let slot = column.kind.disk_size(config.max_inline_varchar);
                let capacity = slot - 4;
                let bytes = s.as_bytes();
                w.put_u32(bytes.len() as u32);
                if bytes.len() <= capacity {
                    w.put_bytes(bytes);
                    w.pad(capacity - bytes.len());
                } else {
                    let first_page = overflow::write_chain(txn, bytes, config.page_size)?;
                    w.put_u32(first_page);
                    w.pad(capacity - 4);
                }
            }
        }
    }

    if w.len() > size {
        return Err(err!(
            RowTooLarge,
            "row serialized to {} bytes, table row size is {}",
            w.len(),
            size
        ));
    }
    w.pad(size - w.len());
    Ok((row.null_mask(), w.into_bytes()))
}

/// Decodes a leaf-cell payload back into a row, rehydrating any overflow
/// chains its TextPointers reference.
pub fn decode_row(
    txn: &mut TxPager,
    columns: &[Column],
    id: u64,
    null_mask: u64,
    payload: &[u8],
    config: &EngineConfig,
) -> Result<Row, Error> {
    let mut r = ByteReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());

    for (i, column) in columns.iter().enumerate() {
        if null_mask & (1 << i) != 0 {
            values.push(None);
            continue;
        }
        let value = match &column.kind {
            ColumnKind::Boolean => Value::Boolean(r.get_bool()?),
            ColumnKind::Int4 => Value::Int4(r.get_i32()?),
            ColumnKind::Int8 => Value::Int8(r.get_i64()?),
            ColumnKind::Real => Value::Real(r.get_f32()?),
            ColumnKind::Double => Value::Double(r.get_f64()?),
            kind => {
                let slot = kind.disk_size(config.max_inline_varchar);
                let capacity = slot - 4;
                let length = r.get_u32()? as usize;
                let bytes = if length <= capacity {
                    let bytes = r.get_bytes(length)?.to_vec();
                    r.skip(capacity - length)?;
                    bytes
                } else {
                    let first_page = r.get_u32()?;
                    r.skip(capacity - 4)?;
                    trim_nul(&overflow::read_chain(txn, first_page, length)?).to_vec()
                };
                Value::Text(String::from_utf8(bytes).map_err(|e| {
                    err!(InvalidUtf8, "text in column '{}' is not UTF-8: {}", column.name, e)
                })?)
            }
        };
        values.push(Some(value));
    }

    Ok(Row::new(id, values))
}

/// Collects the first page of every overflow chain a serialized row
/// references, without touching the pager. Used by DROP TABLE to find the
/// chains reachable from a leaf.
pub fn overflow_heads(
    columns: &[Column],
    null_mask: u64,
    payload: &[u8],
    config: &EngineConfig,
    out: &mut Vec<u32>,
) -> Result<(), Error> {
    let mut r = ByteReader::new(payload);
    for (i, column) in columns.iter().enumerate() {
        if null_mask & (1 << i) != 0 {
            continue;
        }
        let slot = column.kind.disk_size(config.max_inline_varchar);
        if !column.kind.is_text() {
            r.skip(slot)?;
            continue;
        }
        let capacity = slot - 4;
        let length = r.get_u32()? as usize;
        if length <= capacity {
            r.skip(capacity)?;
        } else {
            out.push(r.get_u32()?);
            r.skip(capacity - 4)?;
        }
    }
    Ok(())
}

/// Frees every overflow chain referenced by a serialized row. Called before
/// a row is deleted or its payload replaced.
pub fn free_row_overflow(
    txn: &mut TxPager,
    columns: &[Column],
    null_mask: u64,
    payload: &[u8],
    config: &EngineConfig,
) -> Result<(), Error> {
    let mut r = ByteReader::new(payload);
    for (i, column) in columns.iter().enumerate() {
        if null_mask & (1 << i) != 0 {
            continue;
        }
        let slot = column.kind.disk_size(config.max_inline_varchar);
        if !column.kind.is_text() {
            r.skip(slot)?;
            continue;
        }
        let capacity = slot - 4;
        let length = r.get_u32()? as usize;
        if length <= capacity {
            r.skip(capacity)?;
        } else {
            let first_page = r.get_u32()?;
            r.skip(capacity - 4)?;
            overflow::free_chain(txn, first_page)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Pager;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    fn txn_pager() -> (NamedTempFile, TxPager) {
        let file = NamedTempFile::new().unwrap();
        let pager = Pager::open(file.path(), &EngineConfig::default()).unwrap();
        let mut txn = TxPager::new(Arc::new(Mutex::new(pager)));
        txn.begin(true).unwrap();
        (file, txn)
    }

    fn sample_columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnKind::Int8).primary_key(),
            Column::new("email", ColumnKind::Varchar(255)).nullable(),
            Column::new("age", ColumnKind::Int4).nullable(),
        ]
    }

    #[test]
    fn test_row_size_and_mask() {
        let columns = sample_columns();
        assert_eq!(row_size(&columns, 255), 8 + 259 + 4);

        let row = Row::new(
            1,
            vec![Some(Value::Int8(1)), None, Some(Value::Int4(30))],
        );
        assert_eq!(row.null_mask(), 0b010);
    }

    #[test]
    fn test_roundtrip_with_nulls() {
        let (_file, mut txn) = txn_pager();
        let config = EngineConfig::default();
        let columns = sample_columns();
        let row = Row::new(
            7,
            vec![
                Some(Value::Int8(7)),
                Some(Value::Text("a@b.c".into())),
                None,
            ],
        );
        let (mask, payload) = encode_row(&mut txn, &columns, &row, &config).unwrap();
        assert_eq!(mask, 0b100);
        assert_eq!(payload.len(), row_size(&columns, 255));
        // NULL columns occupy no bytes: int8 + text pointer only.
        assert_eq!(&payload[8 + 4..8 + 4 + 5], b"a@b.c");

        let decoded = decode_row(&mut txn, &columns, 7, mask, &payload, &config).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_large_text_spills_to_overflow() {
        let (_file, mut txn) = txn_pager();
        let config = EngineConfig::default();
        let columns = vec![
            Column::new("id", ColumnKind::Int8).primary_key(),
            Column::new("body", ColumnKind::Text),
        ];
        let body = "x".repeat(10_000);
        let row = Row::new(
            1,
            vec![Some(Value::Int8(1)), Some(Value::Text(body.clone()))],
        );

        let (mask, payload) = encode_row(&mut txn, &columns, &row, &config).unwrap();
        assert!(txn.total_pages().unwrap() > 0);

        let decoded = decode_row(&mut txn, &columns, 1, mask, &payload, &config).unwrap();
        assert_eq!(decoded.values[1], Some(Value::Text(body)));

        // Freeing the row returns the whole chain.
        let pages = txn.total_pages().unwrap();
        free_row_overflow(&mut txn, &columns, mask, &payload, &config).unwrap();
        assert_eq!(txn.header().unwrap().free_page_count, pages);
    }

    #[test]
    fn test_validation_errors() {
        let config = EngineConfig::default();
        let columns = sample_columns();

        let missing = Row::new(1, vec![Some(Value::Int8(1)), None]);
        assert!(matches!(
            validate_row(&columns, &missing, &config),
            Err(Error::UnrecognizedStatement(_))
        ));

        let columns_strict = vec![Column::new("name", ColumnKind::Varchar(4))];
        let null_row = Row::new(1, vec![None]);
        assert!(matches!(
            validate_row(&columns_strict, &null_row, &config),
            Err(Error::NullInNonNullable(_))
        ));

        let long_row = Row::new(1, vec![Some(Value::Text("abcdef".into()))]);
        assert!(matches!(
            validate_row(&columns_strict, &long_row, &config),
            Err(Error::RowTooLarge(_))
        ));

        let wrong_kind = Row::new(1, vec![Some(Value::Int4(9))]);
        assert!(matches!(
            validate_row(&columns_strict, &wrong_kind, &config),
            Err(Error::UnrecognizedStatement(_))
        ));
    }
}
