//! Interfaces to the collaborators surrounding the tile compiler: the tile
//! and string catalogs, the relation-export lookup, and the feature store's
//! write transaction. In-memory implementations back the tests and the CLI.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{TileError, TileResult};
use crate::geom::{Coord, Tile};
use crate::types::{Tex, Tip};

/// Maps between piles (import work units), tiles and TIPs.
pub trait TileCatalog: Send + Sync {
    fn tile_of_pile(&self, pile: u32) -> Tile;
    fn tip_of_pile(&self, pile: u32) -> Tip;
    fn tile_of_tip(&self, tip: Tip) -> Tile;
    fn pile_of_tile(&self, tile: Tile) -> u32;
    /// Linear scan fallback; only used off the hot path.
    fn tip_of_coord_slow(&self, zoom: u8, xy: Coord) -> Option<Tip>;
    fn tile_count(&self) -> u32;
}

/// The global string table shared by every tile in a store.
pub trait StringCatalog: Send + Sync {
    fn global_code(&self, s: &str) -> Option<u16>;
    fn global_string(&self, code: u16) -> Option<&str>;
}

/// Resolves the TEX a relation was assigned when its home pile was exported.
pub trait ExportLookup: Send + Sync {
    fn tex_of_relation(&self, pile: u32, relation_id: u64) -> Tex;
}

/// Page number of a blob committed to the feature store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page(pub u64);

/// Write side of the feature store. Commits are serialized on the thread
/// driving the engine; workers never touch the store.
pub trait StoreTransaction {
    fn begin(&mut self) -> TileResult<()>;
    fn add_blob(&mut self, blob: &[u8]) -> TileResult<Page>;
    fn set_tile_index(&mut self, tip: Tip, page: Page) -> TileResult<()>;
    fn commit(&mut self) -> TileResult<()>;
}

/// Read side used by the updater to load existing tiles.
pub trait TileSource: Send + Sync {
    fn load_tile(&self, tip: Tip) -> TileResult<Bytes>;
}

/// Build and update settings consumed by the compiler and updater.
#[derive(Debug, Clone)]
pub struct Settings {
    pub include_waynode_ids: bool,
    pub rtree_bucket_size: usize,
    pub max_key_indexes: usize,
    pub key_index_min_features: u32,
    /// Global key code → category (1-based, at most 30 categories).
    pub keys_to_categories: HashMap<u16, u8>,
    pub zoom_levels: Vec<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            include_waynode_ids: false,
            rtree_bucket_size: 16,
            max_key_indexes: 8,
            key_index_min_features: 300,
            keys_to_categories: HashMap::new(),
            zoom_levels: vec![0, 2, 4, 6, 8, 10, 12],
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations

/// Catalog over a fixed list of tiles; pile `n` is tile `n - 1`, TIPs are
/// assigned sequentially starting at 1.
#[derive(Debug, Default)]
pub struct MemoryTileCatalog {
    tiles: Vec<Tile>,
    by_tile: HashMap<Tile, u32>,
}

impl MemoryTileCatalog {
    pub fn new(tiles: Vec<Tile>) -> Self {
        let by_tile = tiles
            .iter()
            .enumerate()
            .map(|(i, &tile)| (tile, i as u32 + 1))
            .collect();
        Self { tiles, by_tile }
    }
}

impl TileCatalog for MemoryTileCatalog {
    fn tile_of_pile(&self, pile: u32) -> Tile {
        self.tiles[pile as usize - 1]
    }

    fn tip_of_pile(&self, pile: u32) -> Tip {
        Tip(pile)
    }

    fn tile_of_tip(&self, tip: Tip) -> Tile {
        self.tiles[tip.0 as usize - 1]
    }

    fn pile_of_tile(&self, tile: Tile) -> u32 {
        self.by_tile.get(&tile).copied().unwrap_or(0)
    }

    fn tip_of_coord_slow(&self, zoom: u8, xy: Coord) -> Option<Tip> {
        let target = Tile::of_coord(zoom, xy);
        self.by_tile.get(&target).map(|&pile| Tip(pile))
    }

    fn tile_count(&self) -> u32 {
        self.tiles.len() as u32
    }
}

/// String catalog over a fixed list; code 0 is reserved for the empty
/// string, matching the reserved global end-marker key.
#[derive(Debug, Default)]
pub struct MemoryStringCatalog {
    strings: Vec<String>,
    codes: HashMap<String, u16>,
}

impl MemoryStringCatalog {
    pub fn new<S: Into<String>>(strings: impl IntoIterator<Item = S>) -> Self {
        let mut catalog = Self {
            strings: vec![String::new()],
            codes: HashMap::from([(String::new(), 0)]),
        };
        for s in strings {
            catalog.add(s.into());
        }
        catalog
    }

    pub fn add(&mut self, s: String) -> u16 {
        if let Some(&code) = self.codes.get(&s) {
            return code;
        }
        let code = self.strings.len() as u16;
        self.codes.insert(s.clone(), code);
        self.strings.push(s);
        code
    }
}

impl StringCatalog for MemoryStringCatalog {
    fn global_code(&self, s: &str) -> Option<u16> {
        self.codes.get(s).copied()
    }

    fn global_string(&self, code: u16) -> Option<&str> {
        self.strings.get(code as usize).map(String::as_str)
    }
}

/// Export lookup over an explicit `(pile, relation) → TEX` map.
#[derive(Debug, Default)]
pub struct MemoryExportLookup {
    texes: HashMap<(u32, u64), Tex>,
}

impl MemoryExportLookup {
    pub fn insert(&mut self, pile: u32, relation_id: u64, tex: Tex) {
        self.texes.insert((pile, relation_id), tex);
    }
}

impl ExportLookup for MemoryExportLookup {
    fn tex_of_relation(&self, pile: u32, relation_id: u64) -> Tex {
        self.texes
            .get(&(pile, relation_id))
            .copied()
            .unwrap_or(Tex(0))
    }
}

/// Store transaction collecting blobs in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub blobs: Vec<Bytes>,
    pub tile_index: HashMap<u32, Page>,
    committed: bool,
}

impl MemoryStore {
    pub fn blob_of_tip(&self, tip: Tip) -> Option<&Bytes> {
        self.tile_index
            .get(&tip.0)
            .map(|page| &self.blobs[page.0 as usize])
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl StoreTransaction for MemoryStore {
    fn begin(&mut self) -> TileResult<()> {
        Ok(())
    }

    fn add_blob(&mut self, blob: &[u8]) -> TileResult<Page> {
        let page = Page(self.blobs.len() as u64);
        self.blobs.push(Bytes::copy_from_slice(blob));
        Ok(page)
    }

    fn set_tile_index(&mut self, tip: Tip, page: Page) -> TileResult<()> {
        self.tile_index.insert(tip.0, page);
        Ok(())
    }

    fn commit(&mut self) -> TileResult<()> {
        self.committed = true;
        Ok(())
    }
}

impl TileSource for MemoryStore {
    fn load_tile(&self, tip: Tip) -> TileResult<Bytes> {
        self.blob_of_tip(tip)
            .cloned()
            .ok_or_else(|| TileError::unresolved(format!("no tile stored for {tip}")))
    }
}
