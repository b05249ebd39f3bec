//! Column definitions and row decoding for both wire encodings.

use std::sync::Arc;

use common::{
    Error,
    Result,
};

use crate::{
    constants::UNSIGNED_FLAG,
    packet::PayloadReader,
    value::{
        FromValue,
        Value,
    },
};

#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub column_type: u8,
    pub flags: u16,
    pub charset: u16,
}

impl Column {
    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    /// Parse a protocol-41 column definition payload.
    pub(crate) fn parse(payload: &[u8]) -> Result<Column> {
        let mut reader = PayloadReader::new(payload);
        let _catalog = reader.lenenc_bytes()?;
        let _schema = reader.lenenc_bytes()?;
        let _table = reader.lenenc_bytes()?;
        let _org_table = reader.lenenc_bytes()?;
        let name = String::from_utf8_lossy(reader.lenenc_bytes()?).into_owned();
        let _org_name = reader.lenenc_bytes()?;
        let _fixed_len = reader.lenenc_int()?;
        let charset = reader.u16_le()?;
        let _column_length = reader.u32_le()?;
        let column_type = reader.u8()?;
        let flags = reader.u16_le()?;
        let _decimals = reader.u8()?;
        Ok(Column {
            name,
            column_type,
            flags,
            charset,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<Vec<Column>>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<Vec<Column>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| Error::usage(format!("row has no column {index}")))?;
        T::from_value(value)
    }

    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::usage(format!("row has no column named {name}")))?;
        self.get(index)
    }
}

/// Text-protocol row: one length-encoded string per column, 0xfb for NULL.
pub(crate) fn decode_text_row(payload: &[u8], columns: &Arc<Vec<Column>>) -> Result<Row> {
    let mut reader = PayloadReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns.iter() {
        if reader.peek() == Some(0xfb) {
            reader.skip(1)?;
            values.push(Value::Null);
            continue;
        }
        let raw = reader.lenenc_bytes()?;
        values.push(Value::decode_text(raw, column.column_type, column.is_unsigned())?);
    }
    Ok(Row::new(columns.clone(), values))
}

/// Binary-protocol row: 0x00 header, then a NULL bitmap with a two-bit
/// offset, then the packed values.
pub(crate) fn decode_binary_row(payload: &[u8], columns: &Arc<Vec<Column>>) -> Result<Row> {
    let mut reader = PayloadReader::new(payload);
    let header = reader.u8()?;
    if header != 0x00 {
        return Err(Error::protocol(format!(
            "binary row starts with 0x{header:02x}"
        )));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = reader.take(bitmap_len)?.to_vec();
    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let bit = index + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        values.push(Value::decode_binary(
            &mut reader,
            column.column_type,
            column.is_unsigned(),
        )?);
    }
    Ok(Row::new(columns.clone(), values))
}
