//! JSON-deserializable layout descriptions.
//!
//! These types describe the *shape* of fixed structures. They are intended to
//! be constructed from JSON (for example a layout file shipped with your
//! application) and then loaded into a [`crate::layout::LayoutCatalog`].

use serde::{Deserialize, Serialize};

use crate::errors::SynthesisError;
use crate::layout::{Layout, LayoutCatalog, LayoutComponent};

/// Top-level definition: a set of layouts registered under one category.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogDef {
    /// Category path assigned to every layout in this definition.
    pub category: String,
    pub layouts: Vec<LayoutDef>,
}

/// Description of a single fixed layout.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LayoutDef {
    /// Layout name; the key types bind against.
    pub name: String,
    /// Components in offset order.
    pub components: Vec<ComponentDef>,
    /// Total length in bytes. Defaults to the end of the last component.
    #[serde(default)]
    pub length: Option<u64>,
}

/// One named byte range within a layout.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ComponentDef {
    pub name: String,
    /// Byte offset from the structure start. Defaults to packing after the
    /// previous component.
    #[serde(default)]
    pub offset: Option<u64>,
    /// Length in bytes.
    pub length: usize,
}

impl From<LayoutDef> for Layout {
    fn from(def: LayoutDef) -> Self {
        let mut next = 0u64;
        let mut components = Vec::with_capacity(def.components.len());
        for component in def.components {
            let offset = component.offset.unwrap_or(next);
            next = offset + component.length as u64;
            components.push(LayoutComponent {
                name: component.name,
                offset,
                length: component.length,
            });
        }
        Layout {
            name: def.name,
            category: String::new(),
            components,
            length: def.length.unwrap_or(next).max(next),
        }
    }
}

impl CatalogDef {
    /// Registers every layout of this definition into `catalog`.
    pub fn load_into(self, catalog: &mut LayoutCatalog) -> Result<(), SynthesisError> {
        for def in self.layouts {
            catalog.register(&self.category, def.into())?;
        }
        Ok(())
    }
}
