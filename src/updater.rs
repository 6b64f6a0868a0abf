//! The incremental tile updater: reads an existing tile, applies a TES
//! stream, and writes the new blob.

use std::sync::Arc;

use bytes::Bytes;

use crate::catalog::{Settings, StoreTransaction, TileCatalog, TileSource};
use crate::error::TileResult;
use crate::geom::Tile;
use crate::index::{build_indexes, IndexSettings};
use crate::layout::place;
use crate::reader::read_tile;
use crate::tes::apply_tes;
use crate::types::Tip;
use crate::writer::write_tile;

/// Applies one TES stream to an existing tile blob and returns the new blob.
pub fn update_tile(
    tile: Tile,
    blob: Bytes,
    tes: &[u8],
    settings: &Settings,
) -> TileResult<Bytes> {
    let mut model = read_tile(tile, blob)?;
    model.set_waynode_ids(settings.include_waynode_ids);
    apply_tes(&mut model, tes)?;
    let mut indexes = build_indexes(&mut model, &IndexSettings::from(settings))?;
    let layout = place(&mut model, &mut indexes)?;
    write_tile(&model, &indexes, &layout)
}

/// Shared state for an update run.
pub struct UpdateContext {
    pub tiles: Box<dyn TileCatalog>,
    pub settings: Settings,
}

/// Worker-pool engine applying per-tile TES blocks. Tiles are independent;
/// workers own their models, the calling thread commits results.
pub struct Updater {
    context: Arc<UpdateContext>,
    threads: usize,
}

impl Updater {
    #[must_use]
    pub fn new(context: Arc<UpdateContext>) -> Self {
        let threads = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self { context, threads }
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Applies each `(tip, tes)` block, loading tiles from `source` and
    /// committing updated blobs to `store`. Nothing is committed on failure.
    pub fn update(
        &self,
        batch: Vec<(Tip, Vec<u8>)>,
        source: &dyn TileSource,
        store: &mut dyn StoreTransaction,
    ) -> TileResult<()> {
        store.begin()?;
        let (task_tx, task_rx) = crossbeam::channel::unbounded::<(Tip, Vec<u8>)>();
        for task in batch {
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let (out_tx, out_rx) =
            crossbeam::channel::bounded::<TileResult<(Tip, Bytes)>>(self.threads * 2);
        let context = &self.context;

        let first_err = std::thread::scope(|scope| {
            for _ in 0..self.threads {
                let task_rx = task_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move || {
                    while let Ok((tip, tes)) = task_rx.recv() {
                        let result = source.load_tile(tip).and_then(|blob| {
                            let tile = context.tiles.tile_of_tip(tip);
                            update_tile(tile, blob, &tes, &context.settings)
                                .map(|blob| (tip, blob))
                        });
                        let failed = result.is_err();
                        if out_tx.send(result).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(out_tx);

            let mut first_err = None;
            while let Ok(result) = out_rx.recv() {
                match result {
                    Ok((tip, blob)) => {
                        if first_err.is_none() {
                            let committed = store
                                .add_blob(&blob)
                                .and_then(|page| store.set_tile_index(tip, page));
                            if let Err(e) = committed {
                                first_err = Some(e);
                            }
                        }
                    }
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            first_err
        });

        match first_err {
            Some(e) => Err(e),
            None => store.commit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Coord;
    use crate::tes::writer::{
        NodeChange, TesChangeSet, TesTagTable, TesTagsChange, TesValue, TesWriter, WayChange,
    };
    use crate::testutil::{compile_fixture, test_context, test_tile};
    use crate::types::{feature_flags, FeatureType, TypedFeatureId};

    fn way_fixture() -> Bytes {
        let context = test_context();
        let o = test_tile().bounds().bottom_left();
        compile_fixture(&context, |w| {
            w.node(5, Coord::new(o.x + 150, o.y + 150), &[("place", "city")]);
            w.node(10, Coord::new(o.x + 100, o.y + 100), &[]);
            w.node(11, Coord::new(o.x + 200, o.y + 100), &[]);
            w.way(2, &[10, 5, 11], false, &[("highway", "footway")]);
        })
        .unwrap()
    }

    #[test]
    fn empty_tes_is_a_no_op() {
        let blob = way_fixture();
        let context = test_context();
        let tes = TesWriter::new(&test_tile().bounds()).write(&TesChangeSet::default());
        let updated = update_tile(test_tile(), blob.clone(), &tes, &context.settings).unwrap();
        assert_eq!(blob, updated);
    }

    #[test]
    fn tag_change_leaves_the_way_body_alone() {
        let blob = way_fixture();
        let context = test_context();
        let building = context.strings.global_code("building").unwrap();
        let yes = context.strings.global_code("yes").unwrap();
        let mut changes = TesChangeSet::default();
        changes.nodes = vec![(5, None)];
        changes.ways = vec![(
            2,
            Some(WayChange {
                tags: Some(TesTagsChange::Inline(TesTagTable {
                    locals: vec![],
                    globals: vec![(building, TesValue::GlobalString(yes))],
                })),
                ..WayChange::default()
            }),
        )];
        let tes = TesWriter::new(&test_tile().bounds()).write(&changes);

        let old_model = crate::reader::read_tile(test_tile(), blob.clone()).unwrap();
        let updated = update_tile(test_tile(), blob, &tes, &context.settings).unwrap();
        let new_model = crate::reader::read_tile(test_tile(), updated).unwrap();

        for model in [&old_model, &new_model] {
            let way = model
                .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
                .unwrap();
            assert!(model.element(way).feature().body.is_some());
        }
        let old_way = old_model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        let new_way = new_model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        let old_body = old_model.element(old_way).feature().body.unwrap();
        let new_body = new_model.element(new_way).feature().body.unwrap();
        assert_eq!(
            old_model.payload(old_body),
            new_model.payload(new_body),
            "way body bytes must be unchanged"
        );

        // The tags did change
        let old_tags = old_model
            .stub(old_way)
            .tags_handle(old_model.element(old_way).handle);
        let new_tags = new_model
            .stub(new_way)
            .tags_handle(new_model.element(new_way).handle);
        let old_payload = old_model.payload(old_model.expect_tag_table(old_tags).unwrap());
        let new_payload = new_model.payload(new_model.expect_tag_table(new_tags).unwrap());
        assert_ne!(old_payload, new_payload);
    }

    #[test]
    fn removing_a_node_drops_it_from_the_index() {
        let blob = way_fixture();
        let context = test_context();
        let mut changes = TesChangeSet::default();
        // The way loses its feature-node table; its geometry is untouched
        changes.ways = vec![(
            2,
            Some(WayChange {
                members: Some(vec![]),
                ..WayChange::default()
            }),
        )];
        changes.removed_nodes = vec![5];
        let tes = TesWriter::new(&test_tile().bounds()).write(&changes);

        let updated = update_tile(test_tile(), blob, &tes, &context.settings).unwrap();
        let model = crate::reader::read_tile(test_tile(), updated).unwrap();
        assert!(model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 5))
            .is_none());
        let way = model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        assert!(!model.stub(way).has_flag(feature_flags::WAYNODE));
    }

    #[test]
    fn node_move_updates_its_coordinates() {
        let blob = way_fixture();
        let context = test_context();
        let o = test_tile().bounds().bottom_left();
        let moved = Coord::new(o.x + 777, o.y + 888);
        let mut changes = TesChangeSet::default();
        changes.nodes = vec![(
            5,
            Some(NodeChange {
                xy: Some(moved),
                belongs_to_way: true,
                ..NodeChange::default()
            }),
        )];
        let tes = TesWriter::new(&test_tile().bounds()).write(&changes);

        let updated = update_tile(test_tile(), blob, &tes, &context.settings).unwrap();
        let model = crate::reader::read_tile(test_tile(), updated).unwrap();
        let node = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 5))
            .unwrap();
        assert_eq!(model.stub(node).xy(), moved);
        assert!(model.stub(node).has_flag(feature_flags::WAYNODE));
    }
}
