//! Shared fixtures for the end-to-end tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::area::AreaClassifier;
use crate::catalog::{
    MemoryExportLookup, MemoryStringCatalog, MemoryTileCatalog, Settings,
};
use crate::compiler::proto::ProtoWriter;
use crate::compiler::BuildContext;
use crate::geom::Tile;

/// The tile all fixture piles compile into (pile 1).
pub fn test_tile() -> Tile {
    Tile::new(12, 2048, 1365)
}

pub fn test_strings() -> Vec<&'static str> {
    vec![
        "highway", "footway", "place", "city", "type", "multipolygon", "natural", "wood",
        "building", "yes", "no", "outer", "inner", "name",
    ]
}

/// A context over one tile and its zoom-10 ancestor, with the conventional
/// string catalog and area rules.
pub fn test_context() -> Arc<BuildContext> {
    let strings = MemoryStringCatalog::new(test_strings());
    let areas = AreaClassifier::with_default_rules(&strings);
    let mut keys_to_categories = HashMap::new();
    for (i, key) in ["highway", "place", "natural", "building"].iter().enumerate() {
        if let Some(code) = crate::catalog::StringCatalog::global_code(&strings, key) {
            keys_to_categories.insert(code, i as u8 + 1);
        }
    }
    let settings = Settings {
        rtree_bucket_size: 16,
        max_key_indexes: 8,
        key_index_min_features: 1,
        keys_to_categories,
        ..Settings::default()
    };
    let tiles = MemoryTileCatalog::new(vec![test_tile(), test_tile().zoomed_out(10)]);
    Arc::new(BuildContext {
        tiles: Box::new(tiles),
        strings: Box::new(strings),
        exports: Box::new(MemoryExportLookup::default()),
        areas,
        settings,
    })
}

/// Encodes a pile with the fixture catalog and compiles it.
pub fn compile_fixture(
    context: &BuildContext,
    encode: impl FnOnce(&mut ProtoWriter<'_>),
) -> crate::error::TileResult<bytes::Bytes> {
    let mut writer = ProtoWriter::new(context.strings.as_ref());
    encode(&mut writer);
    let pile = writer.into_bytes();
    crate::compiler::compile_pile(context, 1, &pile).map(|(_, blob)| blob)
}
