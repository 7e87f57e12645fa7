//! Sparse array schema and the global cell order it defines.

use crate::encoding::keycode;
use crate::error::Result;
use crate::fragment::{CURRENT_FORMAT_VERSION, LEGACY_FORMAT_VERSION};
use crate::Error;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Traversal order for tiles within the domain, or cells within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Layout {
    #[default]
    RowMajor,
    ColMajor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// Inclusive `[lo, hi]` domain.
    pub domain: (u64, u64),
    /// Space tile extent; `None` puts the whole domain in one tile.
    pub tile_extent: Option<u64>,
}

impl Dimension {
    pub fn new(name: &str, domain: (u64, u64), tile_extent: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            domain,
            tile_extent,
        }
    }

    fn tile_index(&self, coord: u64) -> u64 {
        match self.tile_extent {
            Some(extent) => coord.saturating_sub(self.domain.0) / extent,
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellSize {
    /// Every value has exactly this many bytes.
    Fixed(u32),
    /// Values have arbitrary length and are stored with offsets.
    Var,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub cell_size: CellSize,
}

impl Attribute {
    pub fn fixed(name: &str, size: u32) -> Self {
        Self {
            name: name.to_string(),
            cell_size: CellSize::Fixed(size),
        }
    }

    pub fn var(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cell_size: CellSize::Var,
        }
    }

    pub fn is_var(&self) -> bool {
        self.cell_size == CellSize::Var
    }
}

/// A queryable field: one of the dimensions or one of the attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Dimension(usize),
    Attribute(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySchema {
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub tile_order: Layout,
    pub cell_order: Layout,
    /// Maximum number of cells per data tile.
    pub capacity: u64,
    pub allows_dups: bool,
    /// Storage format version of the fragments this array writes.
    pub format_version: u32,
}

impl ArraySchema {
    pub fn new(dimensions: Vec<Dimension>, attributes: Vec<Attribute>) -> Self {
        Self {
            dimensions,
            attributes,
            tile_order: Layout::RowMajor,
            cell_order: Layout::RowMajor,
            capacity: 10_000,
            allows_dups: false,
            format_version: CURRENT_FORMAT_VERSION,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_allows_dups(mut self, allows_dups: bool) -> Self {
        self.allows_dups = allows_dups;
        self
    }

    pub fn with_tile_order(mut self, layout: Layout) -> Self {
        self.tile_order = layout;
        self
    }

    pub fn with_cell_order(mut self, layout: Layout) -> Self {
        self.cell_order = layout;
        self
    }

    pub fn with_format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(Error::InvalidSchema("at least one dimension is required".into()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidSchema("tile capacity must be positive".into()));
        }
        if !(LEGACY_FORMAT_VERSION..=CURRENT_FORMAT_VERSION).contains(&self.format_version) {
            return Err(Error::InvalidSchema(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let mut names = HashSet::new();
        for dim in &self.dimensions {
            let (lo, hi) = dim.domain;
            if lo > hi {
                return Err(Error::InvalidSchema(format!(
                    "dimension {} has empty domain [{}, {}]",
                    dim.name, lo, hi
                )));
            }
            if let Some(extent) = dim.tile_extent {
                if extent == 0 || extent - 1 > hi - lo {
                    return Err(Error::InvalidSchema(format!(
                        "dimension {} tile extent {} does not fit domain [{}, {}]",
                        dim.name, extent, lo, hi
                    )));
                }
            }
            if !names.insert(dim.name.as_str()) {
                return Err(Error::InvalidSchema(format!("duplicate field {}", dim.name)));
            }
        }
        for attr in &self.attributes {
            if attr.cell_size == CellSize::Fixed(0) {
                return Err(Error::InvalidSchema(format!(
                    "attribute {} has zero cell size",
                    attr.name
                )));
            }
            if !names.insert(attr.name.as_str()) {
                return Err(Error::InvalidSchema(format!("duplicate field {}", attr.name)));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        if let Some(i) = self.dimensions.iter().position(|d| d.name == name) {
            return Some(Field::Dimension(i));
        }
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .map(Field::Attribute)
    }

    /// Reject coordinates of the wrong arity or outside the domain.
    pub fn check_coords(&self, coords: &[u64]) -> Result<()> {
        if coords.len() != self.dim_num() {
            return Err(Error::InvalidOperation(format!(
                "expected {} coordinates, got {}",
                self.dim_num(),
                coords.len()
            )));
        }
        for (dim, &c) in self.dimensions.iter().zip(coords) {
            if c < dim.domain.0 || c > dim.domain.1 {
                return Err(Error::InvalidOperation(format!(
                    "coordinate {} of dimension {} is outside [{}, {}]",
                    c, dim.name, dim.domain.0, dim.domain.1
                )));
            }
        }
        Ok(())
    }

    /// Byte key whose lexicographic order is the array's global order: tile
    /// indexes in tile order, then coordinates in cell order. Coordinates must
    /// already have passed [`ArraySchema::check_coords`].
    pub fn order_key(&self, coords: &[u64]) -> Vec<u8> {
        let mut components = Vec::with_capacity(coords.len() * 2);
        components.extend(
            permutation(self.tile_order, coords.len())
                .map(|i| self.dimensions[i].tile_index(coords[i])),
        );
        components.extend(permutation(self.cell_order, coords.len()).map(|i| coords[i]));
        keycode::encode_u64s(&components)
    }

    /// Decoded bytes of one cell excluding var-sized payloads.
    pub fn fixed_cell_memory(&self, with_timestamps: bool) -> u64 {
        let coords = 8 * self.dim_num() as u64;
        let attrs: u64 = self
            .attributes
            .iter()
            .map(|a| match a.cell_size {
                CellSize::Fixed(size) => size as u64,
                CellSize::Var => 8,
            })
            .sum();
        let timestamp = if with_timestamps { 8 } else { 0 };
        coords + attrs + timestamp
    }
}

fn permutation(layout: Layout, n: usize) -> Box<dyn Iterator<Item = usize>> {
    match layout {
        Layout::RowMajor => Box::new(0..n),
        Layout::ColMajor => Box::new((0..n).rev()),
    }
}
