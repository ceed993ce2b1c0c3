// Range database codec
//
// The upload body is a compact, self-describing dump of a contiguous
// row range. Layout, all integers little-endian:
//
//   magic "PWDB\0" | u32 version = 1 | u32 table-count
//   per table: u16 name-length | name bytes | u32 row-count
//   per row:   u32 length prefix | JSON payload
//
// End of a table's rows is the exhaustion of its row count; end of
// file is the absence of a further length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const MAGIC: &[u8; 5] = b"PWDB\0";
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct TableDump {
    pub name: String,
    pub rows: Vec<serde_json::Value>,
}

pub fn encode(tables: &[TableDump]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u32_le(VERSION);
    buf.put_u32_le(tables.len() as u32);

    for table in tables {
        if table.name.len() > u16::MAX as usize {
            return Err(Error::validation("table name too long"));
        }
        buf.put_u16_le(table.name.len() as u16);
        buf.put_slice(table.name.as_bytes());
        buf.put_u32_le(table.rows.len() as u32);
        for row in &table.rows {
            let payload = serde_json::to_vec(row)
                .map_err(|e| Error::validation(format!("row payload: {e}")))?;
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(&payload);
        }
    }
    Ok(buf.freeze())
}

#[allow(dead_code)] // The aggregator side of the codec; exercised in tests
pub fn decode(mut data: &[u8]) -> Result<Vec<TableDump>> {
    if data.len() < MAGIC.len() + 8 || &data[..MAGIC.len()] != MAGIC {
        return Err(Error::validation("not a range database file"));
    }
    data.advance(MAGIC.len());

    let version = data.get_u32_le();
    if version != VERSION {
        return Err(Error::validation(format!(
            "unsupported range database version {version}"
        )));
    }

    let table_count = data.get_u32_le();
    let mut tables = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        if data.remaining() < 2 {
            return Err(Error::validation("truncated table header"));
        }
        let name_len = data.get_u16_le() as usize;
        if data.remaining() < name_len + 4 {
            return Err(Error::validation("truncated table name"));
        }
        let name = String::from_utf8(data[..name_len].to_vec())
            .map_err(|e| Error::validation(format!("table name: {e}")))?;
        data.advance(name_len);

        let row_count = data.get_u32_le();
        let mut rows = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            // A missing length prefix is the end of the file
            if data.remaining() < 4 {
                return Err(Error::validation("truncated row length prefix"));
            }
            let len = data.get_u32_le() as usize;
            if data.remaining() < len {
                return Err(Error::validation("truncated row payload"));
            }
            let row: serde_json::Value = serde_json::from_slice(&data[..len])
                .map_err(|e| Error::validation(format!("row payload: {e}")))?;
            data.advance(len);
            rows.push(row);
        }
        tables.push(TableDump { name, rows });
    }
    Ok(tables)
}
