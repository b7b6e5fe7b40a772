//! # structcraft
//!
//! A library for decoding binary structures into Rust types using declarative
//! schemas.
//!
//! Register a type once by describing its fields (where their bytes live, how
//! they are read, where they land), then decode instances at arbitrary
//! offsets of a byte source. Variable-length records can synthesize layouts
//! from decoded instances, and an advisory markup pass annotates a shared
//! document with comments and cross references.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use structcraft::context::Mapper;
//! use structcraft::descriptor::FieldDecl;
//! use structcraft::layout::Layout;
//! use structcraft::schema::{StructMapped, TypeDef, decode_at};
//! use structcraft::source::SliceSource;
//! use structcraft::strategy::ReadStrategy;
//!
//! #[derive(Default)]
//! struct Header {
//!     magic: u32,
//!     count: u32,
//! }
//!
//! impl StructMapped for Header {
//!     fn type_def() -> TypeDef<Self> {
//!         TypeDef::mapped("Header")
//!             .construct_default()
//!             .field(FieldDecl::new("magic").read(ReadStrategy::Scalar).assign(
//!                 |h: &mut Header, v| {
//!                     h.magic = v.expect_u64("magic")? as u32;
//!                     Ok(())
//!                 },
//!             ))
//!             .field(FieldDecl::new("count").read(ReadStrategy::Scalar).assign(
//!                 |h: &mut Header, v| {
//!                     h.count = v.expect_u64("count")? as u32;
//!                     Ok(())
//!                 },
//!             ))
//!     }
//! }
//!
//! let source = SliceSource::new(vec![0x7F, b'E', b'L', b'F', 2, 0, 0, 0]);
//! let mapper = Arc::new(Mapper::new(source));
//! mapper
//!     .register_layout("demo", Layout::fixed("Header", &[("magic", 4), ("count", 4)]))
//!     .unwrap();
//!
//! let header: Header = decode_at(&mapper, 0).unwrap();
//! assert_eq!(header.magic, 0x464C_457F);
//! assert_eq!(header.count, 2);
//! ```

pub mod context;
#[cfg(feature = "serde")]
pub mod defs;
pub mod descriptor;
pub mod errors;
pub mod layout;
pub mod markup;
pub mod schema;
pub mod source;
pub mod strategy;
pub mod value;
