//! Build and update engine for a tiled, content-addressed geospatial
//! feature store.
//!
//! A tile is a self-contained binary blob holding OSM-style features whose
//! geometry falls in a fixed world-space rectangle. This crate implements
//! the tile compiler — proto-GOL stream in, pointer-linked and checksummed
//! blob out — and the incremental updater, which applies a Tile Edit Script
//! (TES) to an existing tile while re-deduplicating shared structures and
//! rewriting pointer offsets.

pub mod area;
pub mod catalog;
mod codec;
pub mod compiler;
mod error;
pub mod geom;
pub mod index;
pub mod layout;
pub mod model;
pub mod reader;
pub mod tag;
pub mod tes;
#[cfg(test)]
pub(crate) mod testutil;
pub mod types;
pub mod updater;
pub mod writer;

pub use area::AreaClassifier;
pub use catalog::{
    ExportLookup, MemoryExportLookup, MemoryStore, MemoryStringCatalog, MemoryTileCatalog, Page,
    Settings, StoreTransaction, StringCatalog, TileCatalog, TileSource,
};
pub use compiler::{compile_pile, BuildContext, Compiler};
pub use compiler::proto::{ProtoReader, ProtoRecord, ProtoWriter};
pub use error::{TileError, TileResult};
pub use geom::{Bbox, Coord, Tile};
pub use model::TileModel;
pub use reader::read_tile;
pub use tes::writer::{TesChangeSet, TesWriter};
pub use tes::apply_tes;
pub use types::{FeatureType, ForeignFeatureRef, Tex, Tip, TypedFeatureId};
pub use updater::{update_tile, UpdateContext, Updater};
pub use writer::{validate_blob, write_tile};
