//! Result buffers of a query.
//!
//! A caller registers a byte capacity per field; each submission refills the
//! buffers from empty. Var-sized attributes need both a data buffer and an
//! offsets buffer (`u64` start offsets, one per cell).

use crate::array::{ArraySchema, CellSize, Field};
use crate::error::Result;
use crate::fragment::Tile;
use crate::Error;

#[derive(Debug, Clone)]
pub struct FieldBuffer {
    pub name: String,
    pub field: Field,
    data: Vec<u8>,
    data_capacity: usize,
    offsets: Vec<u64>,
    offsets_capacity: Option<usize>,
}

impl FieldBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offsets(&self) -> Option<&[u64]> {
        self.offsets_capacity.map(|_| self.offsets.as_slice())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuffers {
    fields: Vec<FieldBuffer>,
    cell_count: usize,
}

impl QueryBuffers {
    pub fn set_data_buffer(
        &mut self,
        schema: &ArraySchema,
        name: &str,
        capacity: usize,
    ) -> Result<()> {
        self.entry(schema, name)?.data_capacity = capacity;
        Ok(())
    }

    pub fn set_offsets_buffer(
        &mut self,
        schema: &ArraySchema,
        name: &str,
        capacity: usize,
    ) -> Result<()> {
        match schema.field(name) {
            Some(Field::Attribute(i)) if schema.attributes[i].is_var() => {}
            _ => {
                return Err(Error::Query(format!(
                    "{} is not a var-sized attribute and takes no offsets buffer",
                    name
                )))
            }
        }
        self.entry(schema, name)?.offsets_capacity = Some(capacity);
        Ok(())
    }

    fn entry(&mut self, schema: &ArraySchema, name: &str) -> Result<&mut FieldBuffer> {
        let field = schema
            .field(name)
            .ok_or_else(|| Error::Query(format!("unknown field {}", name)))?;
        let index = match self.fields.iter().position(|f| f.name == name) {
            Some(index) => index,
            None => {
                self.fields.push(FieldBuffer {
                    name: name.to_string(),
                    field,
                    data: Vec::new(),
                    data_capacity: 0,
                    offsets: Vec::new(),
                    offsets_capacity: None,
                });
                self.fields.len() - 1
            }
        };
        Ok(&mut self.fields[index])
    }

    /// Check every buffer is usable before the first submission.
    pub fn validate(&self, schema: &ArraySchema) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::Query("no buffers set".to_string()));
        }
        for buffer in &self.fields {
            if let Field::Attribute(i) = buffer.field {
                if schema.attributes[i].is_var() && buffer.offsets_capacity.is_none() {
                    return Err(Error::Query(format!(
                        "var-sized attribute {} needs an offsets buffer",
                        buffer.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldBuffer> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    pub fn clear(&mut self) {
        for buffer in &mut self.fields {
            buffer.data.clear();
            buffer.offsets.clear();
        }
        self.cell_count = 0;
    }

    /// Whether one more cell from `tile` fits every buffer.
    pub fn fits(&self, schema: &ArraySchema, tile: &Tile, cell: usize) -> bool {
        self.fields.iter().all(|buffer| {
            let (data_len, has_offset) = cell_footprint(schema, buffer.field, tile, cell);
            let offsets_fit = !has_offset
                || buffer
                    .offsets_capacity
                    .is_some_and(|cap| (buffer.offsets.len() + 1) * 8 <= cap);
            buffer.data.len() + data_len <= buffer.data_capacity && offsets_fit
        })
    }

    /// Copy one cell into every buffer. Call only after [`QueryBuffers::fits`].
    pub fn push(&mut self, tile: &Tile, cell: usize) {
        for buffer in &mut self.fields {
            match buffer.field {
                Field::Dimension(d) => {
                    buffer.data.extend_from_slice(&tile.coord(d, cell).to_le_bytes());
                }
                Field::Attribute(a) => {
                    if buffer.offsets_capacity.is_some() {
                        buffer.offsets.push(buffer.data.len() as u64);
                    }
                    buffer.data.extend_from_slice(tile.value(a, cell));
                }
            }
        }
        self.cell_count += 1;
    }

    /// Whether one more materialized cell fits every buffer.
    pub fn fits_values(&self, values: &[Vec<u8>]) -> bool {
        self.fields.iter().all(|buffer| match buffer.field {
            Field::Dimension(_) => buffer.data.len() + 8 <= buffer.data_capacity,
            Field::Attribute(a) => {
                let offsets_fit = buffer
                    .offsets_capacity
                    .map_or(true, |cap| (buffer.offsets.len() + 1) * 8 <= cap);
                buffer.data.len() + values[a].len() <= buffer.data_capacity && offsets_fit
            }
        })
    }

    /// Copy a materialized cell, for readers that do not work on tiles.
    pub fn push_values(&mut self, coords: &[u64], values: &[Vec<u8>]) {
        for buffer in &mut self.fields {
            match buffer.field {
                Field::Dimension(d) => buffer.data.extend_from_slice(&coords[d].to_le_bytes()),
                Field::Attribute(a) => {
                    if buffer.offsets_capacity.is_some() {
                        buffer.offsets.push(buffer.data.len() as u64);
                    }
                    buffer.data.extend_from_slice(&values[a]);
                }
            }
        }
        self.cell_count += 1;
    }
}

fn cell_footprint(schema: &ArraySchema, field: Field, tile: &Tile, cell: usize) -> (usize, bool) {
    match field {
        Field::Dimension(_) => (8, false),
        Field::Attribute(a) => match schema.attributes[a].cell_size {
            CellSize::Fixed(size) => (size as usize, false),
            CellSize::Var => (tile.value(a, cell).len(), true),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::tests::test_schema;
    use crate::array::{Attribute, Dimension};

    #[test]
    fn test_capacity_limits_cells() {
        let schema = test_schema();
        let mut buffers = QueryBuffers::default();
        buffers.set_data_buffer(&schema, "a1", 8).unwrap();
        buffers.set_data_buffer(&schema, "d1", 24).unwrap();
        buffers.validate(&schema).unwrap();

        let values = vec![5i32.to_le_bytes().to_vec()];
        assert!(buffers.fits_values(&values));
        buffers.push_values(&[1, 1], &values);
        buffers.push_values(&[2, 1], &values);
        assert!(!buffers.fits_values(&values));
        assert_eq!(buffers.cell_count(), 2);
        assert_eq!(buffers.field("d1").unwrap().data().len(), 16);

        buffers.clear();
        assert!(buffers.is_empty());
        assert!(buffers.field("a1").unwrap().data().is_empty());
    }

    #[test]
    fn test_validation() {
        let schema = ArraySchema::new(
            vec![Dimension::new("d", (0, 9), None)],
            vec![Attribute::var("s")],
        );
        let mut buffers = QueryBuffers::default();
        assert!(buffers.validate(&schema).is_err());
        assert!(buffers.set_data_buffer(&schema, "missing", 8).is_err());
        assert!(buffers.set_offsets_buffer(&schema, "d", 8).is_err());

        buffers.set_data_buffer(&schema, "s", 64).unwrap();
        assert!(buffers.validate(&schema).is_err());
        buffers.set_offsets_buffer(&schema, "s", 64).unwrap();
        buffers.validate(&schema).unwrap();
    }

    #[test]
    fn test_var_offsets() {
        let schema = ArraySchema::new(
            vec![Dimension::new("d", (0, 9), None)],
            vec![Attribute::var("s")],
        );
        let mut buffers = QueryBuffers::default();
        buffers.set_data_buffer(&schema, "s", 64).unwrap();
        buffers.set_offsets_buffer(&schema, "s", 16).unwrap();

        buffers.push_values(&[0], &[b"ab".to_vec()]);
        buffers.push_values(&[1], &[b"cde".to_vec()]);
        assert!(!buffers.fits_values(&[b"f".to_vec()]));

        let s = buffers.field("s").unwrap();
        assert_eq!(s.data(), b"abcde");
        assert_eq!(s.offsets().unwrap(), &[0, 2]);
    }
}
