//! Structural layouts: named component lists, the catalog that resolves and
//! registers them, and the builder used during layout synthesis.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::SynthesisError;

/// One named component of a [`Layout`]: a byte range within the structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutComponent {
    pub name: String,
    pub offset: u64,
    pub length: usize,
}

/// A named description of a structure's binary layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub name: String,
    /// Category path assigned at registration.
    pub category: String,
    pub components: Vec<LayoutComponent>,
    /// Total length in bytes, covering trailing padding past the last component.
    pub length: u64,
}

impl Layout {
    /// Builds a fixed layout from `(name, length)` pairs packed back to back.
    pub fn fixed(name: &str, components: &[(&str, usize)]) -> Self {
        let mut offset = 0u64;
        let mut built = Vec::with_capacity(components.len());
        for (component_name, length) in components {
            built.push(LayoutComponent {
                name: component_name.to_string(),
                offset,
                length: *length,
            });
            offset += *length as u64;
        }
        Layout {
            name: name.to_string(),
            category: String::new(),
            components: built,
            length: offset,
        }
    }

    /// Looks up a component by name.
    pub fn component(&self, name: &str) -> Option<&LayoutComponent> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Registry of named layouts.
///
/// Resolves names for eager binding and registers newly synthesized layouts.
/// Re-registering an identical definition returns the existing entry.
#[derive(Debug, Default)]
pub struct LayoutCatalog {
    layouts: HashMap<String, Arc<Layout>>,
}

impl LayoutCatalog {
    pub fn new() -> Self {
        LayoutCatalog::default()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Layout>> {
        self.layouts.get(name).cloned()
    }

    /// Registers `layout` under `category`.
    pub fn register(
        &mut self,
        category: &str,
        mut layout: Layout,
    ) -> Result<Arc<Layout>, SynthesisError> {
        layout.category = category.to_string();
        if let Some(existing) = self.layouts.get(&layout.name) {
            if **existing == layout {
                return Ok(existing.clone());
            }
            return Err(SynthesisError::NameCollision(layout.name));
        }
        let layout = Arc::new(layout);
        self.layouts.insert(layout.name.clone(), layout.clone());
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Accumulates components for a layout being synthesized.
///
/// Output strategies append components in ordinal order; the schema renames
/// the builder when variable-length fields contribute size suffixes.
#[derive(Debug)]
pub struct LayoutBuilder {
    name: String,
    components: Vec<LayoutComponent>,
    length: u64,
}

impl LayoutBuilder {
    pub fn new(name: &str) -> Self {
        LayoutBuilder {
            name: name.to_string(),
            components: Vec::new(),
            length: 0,
        }
    }

    /// Cumulative length in bytes so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Appends a component at the current end. Returns the component's offset.
    pub fn append(&mut self, name: &str, length: usize) -> u64 {
        let offset = self.length;
        self.components.push(LayoutComponent {
            name: name.to_string(),
            offset,
            length,
        });
        self.length += length as u64;
        offset
    }

    /// Appends a component at an explicit offset. Gaps become implicit
    /// padding; an offset whose end does not fit in `u64` is rejected.
    pub fn append_at(
        &mut self,
        name: &str,
        offset: u64,
        length: usize,
    ) -> Result<u64, SynthesisError> {
        let end = offset
            .checked_add(length as u64)
            .ok_or_else(|| SynthesisError::OutputFailed {
                field: name.to_string(),
                reason: "offset overflows the layout".to_string(),
            })?;
        self.components.push(LayoutComponent {
            name: name.to_string(),
            offset,
            length,
        });
        self.length = self.length.max(end);
        Ok(offset)
    }

    /// Renames the layout. Fails on names the catalog would reject.
    pub fn rename(&mut self, name: String) -> Result<(), SynthesisError> {
        validate_name(&name)?;
        self.name = name;
        Ok(())
    }

    pub fn finish(self) -> Result<Layout, SynthesisError> {
        validate_name(&self.name)?;
        Ok(Layout {
            name: self.name,
            category: String::new(),
            components: self.components,
            length: self.length,
        })
    }
}

fn validate_name(name: &str) -> Result<(), SynthesisError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SynthesisError::InvalidName(name.to_string()))
    }
}
