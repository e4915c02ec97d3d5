//! Bounds-checked FlatBuffer reading primitives.
//!
//! Just enough of the FlatBuffer wire format to walk the fixed TFLite
//! tables: vtable-indirected fields, scalar slots and vectors of scalars
//! or table offsets. Every access is validated against the buffer, so a
//! truncated or corrupt model surfaces as an error instead of a wild read.

use crate::core::Error;

fn get<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N], Error> {
    buf.get(pos..pos + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::malformed(format!("read of {} bytes at offset {} past end", N, pos)))
}

pub(crate) fn read_u16(buf: &[u8], pos: usize) -> Result<u16, Error> {
    Ok(u16::from_le_bytes(get(buf, pos)?))
}

pub(crate) fn read_u32(buf: &[u8], pos: usize) -> Result<u32, Error> {
    Ok(u32::from_le_bytes(get(buf, pos)?))
}

pub(crate) fn read_i32(buf: &[u8], pos: usize) -> Result<i32, Error> {
    Ok(i32::from_le_bytes(get(buf, pos)?))
}

pub(crate) fn read_i8(buf: &[u8], pos: usize) -> Result<i8, Error> {
    Ok(i8::from_le_bytes(get(buf, pos)?))
}

pub(crate) fn read_u8(buf: &[u8], pos: usize) -> Result<u8, Error> {
    Ok(u8::from_le_bytes(get(buf, pos)?))
}

fn checked_add(a: usize, b: usize) -> Result<usize, Error> {
    a.checked_add(b)
        .ok_or_else(|| Error::malformed("offset arithmetic overflow"))
}

/// A FlatBuffer table: a position in the buffer plus its vtable.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Table<'a> {
    buf: &'a [u8],
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    /// Follow the root offset at the start of the buffer.
    pub(crate) fn root(buf: &'a [u8]) -> Result<Table<'a>, Error> {
        let root = read_u32(buf, 0)? as usize;
        Table::at(buf, root)
    }

    fn at(buf: &'a [u8], pos: usize) -> Result<Table<'a>, Error> {
        // The first word of a table is a signed offset back to its vtable.
        let soffset = read_i32(buf, pos)? as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 || vtable as usize >= buf.len() {
            return Err(Error::malformed(format!(
                "table at offset {} has vtable outside the buffer",
                pos
            )));
        }
        let vtable = vtable as usize;
        let vtable_len = read_u16(buf, vtable)? as usize;
        if vtable_len < 4 {
            return Err(Error::malformed(format!(
                "table at offset {} has undersized vtable",
                pos
            )));
        }
        Ok(Table {
            buf,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of a field, or `None` if the slot is absent and the
    /// field takes its default value.
    fn field_pos(&self, slot: u16) -> Result<Option<usize>, Error> {
        let slot = slot as usize;
        if slot + 2 > self.vtable_len {
            return Ok(None);
        }
        let field_off = read_u16(self.buf, checked_add(self.vtable, slot)?)? as usize;
        if field_off == 0 {
            return Ok(None);
        }
        Ok(Some(checked_add(self.pos, field_off)?))
    }

    pub(crate) fn u32_field(&self, slot: u16, default: u32) -> Result<u32, Error> {
        match self.field_pos(slot)? {
            Some(pos) => read_u32(self.buf, pos),
            None => Ok(default),
        }
    }

    pub(crate) fn i32_field(&self, slot: u16, default: i32) -> Result<i32, Error> {
        match self.field_pos(slot)? {
            Some(pos) => read_i32(self.buf, pos),
            None => Ok(default),
        }
    }

    pub(crate) fn i8_field(&self, slot: u16, default: i8) -> Result<i8, Error> {
        match self.field_pos(slot)? {
            Some(pos) => read_i8(self.buf, pos),
            None => Ok(default),
        }
    }

    pub(crate) fn u8_field(&self, slot: u16, default: u8) -> Result<u8, Error> {
        match self.field_pos(slot)? {
            Some(pos) => read_u8(self.buf, pos),
            None => Ok(default),
        }
    }

    /// Follow a table-offset field.
    pub(crate) fn table_field(&self, slot: u16) -> Result<Option<Table<'a>>, Error> {
        match self.field_pos(slot)? {
            Some(pos) => {
                let off = read_u32(self.buf, pos)? as usize;
                Table::at(self.buf, checked_add(pos, off)?).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Follow a vector-offset field. An absent vector reads as `None`.
    pub(crate) fn vector_field(&self, slot: u16) -> Result<Option<Vector<'a>>, Error> {
        match self.field_pos(slot)? {
            Some(pos) => {
                let off = read_u32(self.buf, pos)? as usize;
                Vector::at(self.buf, checked_add(pos, off)?).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// A FlatBuffer vector of 4-byte elements (scalars or table offsets).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Vector<'a> {
    buf: &'a [u8],
    elems: usize,
    len: usize,
}

impl<'a> Vector<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Result<Vector<'a>, Error> {
        let len = read_u32(buf, pos)? as usize;
        let elems = checked_add(pos, 4)?;
        // Validate the element region up front so per-element reads can't
        // run past the end.
        let end = checked_add(elems, len.checked_mul(4).ok_or_else(|| {
            Error::malformed("vector length overflow")
        })?)?;
        if end > buf.len() {
            return Err(Error::malformed(format!(
                "vector at offset {} with {} elements past end of buffer",
                pos, len
            )));
        }
        Ok(Vector { buf, elems, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn elem_pos(&self, index: usize, what: &'static str) -> Result<usize, Error> {
        if index >= self.len {
            return Err(Error::IndexOutOfRange {
                what,
                index: index as i64,
                count: self.len,
            });
        }
        checked_add(self.elems, index * 4)
    }

    pub(crate) fn i32_at(&self, index: usize, what: &'static str) -> Result<i32, Error> {
        read_i32(self.buf, self.elem_pos(index, what)?)
    }

    pub(crate) fn table_at(&self, index: usize, what: &'static str) -> Result<Table<'a>, Error> {
        let pos = self.elem_pos(index, what)?;
        let off = read_u32(self.buf, pos)? as usize;
        Table::at(self.buf, checked_add(pos, off)?)
    }
}
