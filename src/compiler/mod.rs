//! The tile compiler: consumes proto-GOL piles and produces finished tile
//! blobs through a pool of workers.

pub mod proto;
pub mod relation;
pub mod tags;
pub mod way;
pub mod writers;

use std::sync::Arc;

use bytes::Bytes;
use log::warn;

use crate::area::AreaClassifier;
use crate::catalog::{ExportLookup, Settings, StoreTransaction, StringCatalog, TileCatalog};
use crate::codec::StreamReader;
use crate::error::{TileError, TileResult};
use crate::geom::{Bbox, Coord};
use crate::index::{build_indexes, IndexSettings};
use crate::model::element::{elem_flags, ElemId, ExportTarget};
use crate::model::reltable::{sorted_insert, Membership};
use crate::model::tables::write_i32;
use crate::model::TileModel;
use crate::tag::{TagModel, TagValue};
use crate::types::{
    feature_flags, FeatureType, ForeignFeatureRef, Tip, TypedFeatureId,
};
use proto::{parse_tags, read_role, special_node_flags, ProtoReader, ProtoRecord, ProtoStr};
use relation::{build_rel_table, RelationBodyBuilder, Role};
use tags::build_tag_table;
use way::{build_way, set_feature_bounds, ForeignNode, FxMap};

/// Read-only state shared by all workers for the duration of a run.
pub struct BuildContext {
    pub tiles: Box<dyn TileCatalog>,
    pub strings: Box<dyn StringCatalog>,
    pub exports: Box<dyn ExportLookup>,
    pub areas: AreaClassifier,
    pub settings: Settings,
}

/// Worker-pool engine compiling one tile per task. Workers own their tile
/// model; finished blobs are committed in arrival order on the calling
/// thread.
pub struct Compiler {
    context: Arc<BuildContext>,
    threads: usize,
}

impl Compiler {
    #[must_use]
    pub fn new(context: Arc<BuildContext>) -> Self {
        let threads = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self { context, threads }
    }

    /// Overrides the worker count.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Compiles every pile of the catalog, loading pile data through `load`
    /// and committing blobs to `store`. The first failure aborts the run;
    /// nothing is committed on failure.
    pub fn compile<F>(&self, load: F, store: &mut dyn StoreTransaction) -> TileResult<()>
    where
        F: Fn(u32) -> TileResult<Vec<u8>> + Sync,
    {
        store.begin()?;
        let pile_count = self.context.tiles.tile_count();
        let (pile_tx, pile_rx) = crossbeam::channel::unbounded::<u32>();
        for pile in 1..=pile_count {
            let _ = pile_tx.send(pile);
        }
        drop(pile_tx);

        let (out_tx, out_rx) =
            crossbeam::channel::bounded::<TileResult<(Tip, Bytes)>>(self.threads * 2);
        let context = &self.context;
        let load = &load;

        let first_err = std::thread::scope(|scope| {
            for _ in 0..self.threads {
                let pile_rx = pile_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move || {
                    while let Ok(pile) = pile_rx.recv() {
                        let result =
                            load(pile).and_then(|data| compile_pile(context, pile, &data));
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
                            if let Err(e) = commit_blob(store, tip, &blob) {
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

fn commit_blob(store: &mut dyn StoreTransaction, tip: Tip, blob: &Bytes) -> TileResult<()> {
    let page = store.add_blob(blob)?;
    store.set_tile_index(tip, page)
}

/// Compiles one pile into its tile blob. Exposed for single-tile use; the
/// engine calls this from its workers.
pub fn compile_pile(
    context: &BuildContext,
    pile: u32,
    data: &[u8],
) -> TileResult<(Tip, Bytes)> {
    let tile = context.tiles.tile_of_pile(pile);
    let tip = context.tiles.tip_of_pile(pile);
    let mut model = TileModel::new(tile);
    model.set_waynode_ids(context.settings.include_waynode_ids);

    let mut build = PileBuild {
        context,
        model,
        coords: FxMap::default(),
        foreign_nodes: FxMap::default(),
        foreign_features: FxMap::default(),
        nodes: Vec::new(),
        ways: Vec::new(),
        relations: Vec::new(),
        pending_bodies: FxMap::default(),
        outer_code: context.strings.global_code("outer"),
    };
    build.read_records(data)?;
    build.build_relations()?;
    build.build_ways()?;
    build.build_nodes()?;

    let mut model = build.model;
    let index_settings = IndexSettings::from(&context.settings);
    let mut indexes = build_indexes(&mut model, &index_settings)?;
    let layout = crate::layout::place(&mut model, &mut indexes)?;
    let blob = crate::writer::write_tile(&model, &indexes, &layout)?;
    Ok((tip, blob))
}

/// A foreign 2D feature, possibly present in two tiles.
#[derive(Debug, Default, Clone, Copy)]
struct ForeignFeature {
    ref1: ForeignFeatureRef,
    ref2: ForeignFeatureRef,
    bounds: Bbox,
}

struct PileBuild<'ctx> {
    context: &'ctx BuildContext,
    model: TileModel,
    coords: FxMap<u64, Coord>,
    foreign_nodes: FxMap<u64, ForeignNode>,
    foreign_features: FxMap<TypedFeatureId, ForeignFeature>,
    nodes: Vec<ElemId>,
    ways: Vec<ElemId>,
    relations: Vec<ElemId>,
    /// Raw proto bodies of ways and relations, consumed at build time.
    pending_bodies: FxMap<ElemId, Vec<u8>>,
    outer_code: Option<u16>,
}

impl PileBuild<'_> {
    fn read_records(&mut self, data: &[u8]) -> TileResult<()> {
        let mut reader = ProtoReader::new(data);
        while let Some(record) = reader.next_record()? {
            match record {
                ProtoRecord::ExportTable(exports) => {
                    // Forward declaration: some exported nodes may still be
                    // anonymous, so targets resolve at write time
                    self.model.create_export_table(
                        exports.into_iter().map(ExportTarget::TypedId).collect(),
                    );
                }
                ProtoRecord::ForeignNode { id, xy, reference } => {
                    if reference.is_null() {
                        self.coords.insert(id, xy);
                    } else if let Some(existing) = self.foreign_nodes.get(&id) {
                        warn!(
                            "duplicate foreign node/{id}: keeping {}, ignoring {}",
                            existing.reference, reference
                        );
                    } else {
                        self.foreign_nodes.insert(id, ForeignNode { reference, xy });
                    }
                }
                ProtoRecord::ForeignFeature {
                    typed_id,
                    bounds,
                    reference,
                } => {
                    let entry = self.foreign_features.entry(typed_id).or_default();
                    if let Some(bounds) = bounds {
                        entry.bounds = bounds;
                    }
                    if entry.ref1.is_null() {
                        entry.ref1 = reference;
                    } else if entry.ref2.is_null() {
                        entry.ref2 = reference;
                    } else {
                        warn!("foreign {typed_id} declared in more than two tiles");
                    }
                }
                ProtoRecord::Node { id, xy, tags } => self.read_node(id, xy, tags)?,
                ProtoRecord::Way {
                    zoom_delta,
                    id,
                    body,
                } => self.read_way(zoom_delta, id, body)?,
                ProtoRecord::Relation { id, body } => {
                    let rel = self
                        .model
                        .create_feature(TypedFeatureId::new(FeatureType::Relation, id))?;
                    self.pending_bodies.insert(rel, body.to_vec());
                    self.relations.push(rel);
                }
                ProtoRecord::Membership {
                    relation_id,
                    zoom_delta,
                    member,
                } => self.read_membership(relation_id, zoom_delta, member)?,
                ProtoRecord::SpecialNode { id, flags } => self.read_special_node(id, flags)?,
            }
        }
        Ok(())
    }

    fn read_node(&mut self, id: u64, xy: Coord, tags: &[u8]) -> TileResult<()> {
        if !self.model.bounds().contains(xy) {
            return Err(TileError::LayoutInvariant(format!(
                "node/{id} at {xy} is outside tile bounds {}",
                self.model.bounds()
            )));
        }
        if tags.is_empty() {
            // Untagged node: only its coordinates matter
            self.coords.insert(id, xy);
            return Ok(());
        }
        let node = self
            .model
            .create_feature(TypedFeatureId::new(FeatureType::Node, id))?;
        let mut tag_model = parse_tags(tags, self.context.strings.as_ref())?;
        let table = build_tag_table(&mut self.model, &mut tag_model, None);
        self.set_node_tags(node, table);
        self.model.stub_mut(node).set_node_xy(xy);
        self.nodes.push(node);
        Ok(())
    }

    fn set_node_tags(&mut self, node: ElemId, table: ElemId) {
        let node_handle = self.model.element(node).handle;
        let tags_handle = self.model.element(table).handle;
        let has_locals = self.model.element(table).anchor != 0;
        self.model
            .stub_mut(node)
            .set_tags(node_handle, tags_handle, has_locals);
        self.model.add_user(table);
    }

    fn read_way(&mut self, zoom_delta: u8, id: u64, body: &[u8]) -> TileResult<()> {
        if zoom_delta > 0 {
            // Ghost way from a parent tile: only flags local feature nodes
            // as waynodes
            let mut r = StreamReader::new(body, "proto-GOL");
            let count = (r.u64()? >> 1) as usize;
            let mut node_id = 0i64;
            for _ in 0..count {
                node_id += r.i64()?;
                if let Some(node) = self.model.get_node(node_id as u64) {
                    self.model
                        .stub_mut(node)
                        .set_flag(feature_flags::WAYNODE, true);
                }
            }
            if !r.is_empty() {
                return Err(TileError::malformed(format!(
                    "ghost way/{id} carries unexpected payload"
                )));
            }
            return Ok(());
        }
        let way = self
            .model
            .create_feature(TypedFeatureId::new(FeatureType::Way, id))?;
        self.pending_bodies.insert(way, body.to_vec());
        self.ways.push(way);
        Ok(())
    }

    fn read_membership(
        &mut self,
        relation_id: u64,
        zoom_delta: u8,
        member: TypedFeatureId,
    ) -> TileResult<()> {
        let member_elem = match self.model.get_feature(member) {
            Some(elem) => elem,
            None if member.is_node() => self.promote_anonymous_member_node(member.id())?,
            None => {
                return Err(TileError::unresolved(format!(
                    "{member}, exported by relation/{relation_id}, not found locally"
                )))
            }
        };
        let reference = self.lookup_foreign_relation(zoom_delta, relation_id);
        sorted_insert(
            &mut self.model.element_mut(member_elem).feature_mut().memberships,
            Membership::foreign(relation_id, reference),
        );
        Ok(())
    }

    fn lookup_foreign_relation(&self, zoom_delta: u8, relation_id: u64) -> ForeignFeatureRef {
        let tile = self.model.tile();
        let parent = tile.zoomed_out(tile.zoom - zoom_delta);
        let pile = self.context.tiles.pile_of_tile(parent);
        let tip = self.context.tiles.tip_of_pile(pile);
        let tex = self.context.exports.tex_of_relation(pile, relation_id);
        ForeignFeatureRef::new(tip, tex)
    }

    /// Upgrades an untagged node to a feature node. Its coordinates leave
    /// the plain-coordinate map so later way builds see the feature.
    fn promote_anonymous_member_node(&mut self, id: u64) -> TileResult<ElemId> {
        let xy = self.coords.remove(&id).ok_or_else(|| {
            TileError::unresolved(format!("node/{id} has no local coordinates"))
        })?;
        let node = self
            .model
            .create_feature(TypedFeatureId::new(FeatureType::Node, id))?;
        let table = build_tag_table(&mut self.model, &mut TagModel::new(), None);
        self.set_node_tags(node, table);
        self.model.stub_mut(node).set_node_xy(xy);
        self.nodes.push(node);
        Ok(node)
    }

    fn read_special_node(&mut self, id: u64, flags: u8) -> TileResult<()> {
        let node = match self.model.get_node(id) {
            Some(node) => node,
            None => self.promote_anonymous_member_node(id)?,
        };
        let handle = self.model.element(node).handle;
        let tags_handle = self.model.stub(node).tags_handle(handle);
        let tags = self.model.expect_tag_table(tags_handle)?;
        let is_empty = self.model.element(tags).size == 4 && self.model.element(tags).anchor == 0;

        if !is_empty {
            if flags & special_node_flags::ORPHAN != 0 {
                warn!("tagged node/{id} flagged as orphan; ignoring");
            }
            self.model.stub_mut(node).set_flag(
                feature_flags::SHARED_LOCATION,
                flags & special_node_flags::SHARED != 0,
            );
            return Ok(());
        }

        // Untagged exception node: synthesize the reserved tags
        let mut tag_model = TagModel::new();
        let yes = match self.context.strings.global_code("yes") {
            Some(code) => TagValue::GlobalString(code),
            None => TagValue::LocalString("yes".into()),
        };
        if flags & special_node_flags::SHARED != 0 {
            tag_model.add_local("geodesk:duplicate", yes.clone());
            let mut stub = self.model.stub_mut(node);
            stub.set_flag(feature_flags::SHARED_LOCATION, true);
            stub.set_flag(feature_flags::EXCEPTION_NODE, true);
        }
        if flags & special_node_flags::ORPHAN != 0 {
            tag_model.add_local("geodesk:orphan", yes);
            self.model
                .stub_mut(node)
                .set_flag(feature_flags::EXCEPTION_NODE, true);
        }
        let table = build_tag_table(&mut self.model, &mut tag_model, None);
        self.set_node_tags(node, table);
        Ok(())
    }

    // ----- build phase -----------------------------------------------------

    /// Topmost relations first: local relations arrive child-first and are
    /// built parents-first, so by the time a relation's own table is built,
    /// every membership it will ever have is registered.
    fn build_relations(&mut self) -> TileResult<()> {
        let relations: Vec<ElemId> = self.relations.iter().rev().copied().collect();
        for rel in relations {
            if !self.model.element(rel).is_built() {
                let body = self.take_pending(rel)?;
                self.build_relation(rel, &body)?;
            }
            self.build_parent_rel_table(rel)?;
        }
        Ok(())
    }

    fn build_ways(&mut self) -> TileResult<()> {
        let ways: Vec<ElemId> = self.ways.iter().rev().copied().collect();
        for way in ways {
            if !self.model.element(way).is_built() {
                let body = self.take_pending(way)?;
                build_way(
                    &mut self.model,
                    way,
                    &body,
                    &self.coords,
                    &self.foreign_nodes,
                    self.context.strings.as_ref(),
                    &self.context.areas,
                    self.context.settings.include_waynode_ids,
                )?;
            }
            self.build_parent_rel_table(way)?;
        }
        Ok(())
    }

    fn build_nodes(&mut self) -> TileResult<()> {
        let nodes = std::mem::take(&mut self.nodes);
        for node in nodes {
            let memberships =
                std::mem::take(&mut self.model.element_mut(node).feature_mut().memberships);
            if memberships.is_empty() {
                continue;
            }
            let rels = build_rel_table(&mut self.model, &memberships);
            let node_handle = self.model.element(node).handle;
            let rels_handle = self.model.element(rels).handle;
            self.model
                .stub_mut(node)
                .set_node_rels(node_handle, rels_handle);
            self.model.element_mut(node).size = 24;
        }
        Ok(())
    }

    fn take_pending(&mut self, feature: ElemId) -> TileResult<Vec<u8>> {
        self.pending_bodies.remove(&feature).ok_or_else(|| {
            TileError::unresolved(format!(
                "{} has no staged proto body",
                self.model.stub(feature).typed_id()
            ))
        })
    }

    /// Builds and attaches the parent-relation table of a 2D feature.
    fn build_parent_rel_table(&mut self, feature: ElemId) -> TileResult<()> {
        let memberships =
            std::mem::take(&mut self.model.element_mut(feature).feature_mut().memberships);
        if memberships.is_empty() {
            return Ok(());
        }
        let rels = build_rel_table(&mut self.model, &memberships);
        let body = self.model.element(feature).feature().body.ok_or_else(|| {
            TileError::unresolved(format!(
                "{} has no body for its relation table",
                self.model.stub(feature).typed_id()
            ))
        })?;
        // The pointer slot sits just ahead of the body's anchor
        let body_elem = self.model.element(body);
        debug_assert!(body_elem.anchor >= 4);
        let slot_handle = body_elem.handle - 4;
        let anchor = body_elem.anchor as usize;
        let rels_handle = self.model.element(rels).handle;
        let payload = self.model.payload_mut(body);
        write_i32(payload, anchor - 4, rels_handle - slot_handle);
        self.model
            .stub_mut(feature)
            .set_flag(feature_flags::RELATION_MEMBER, true);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn build_relation(&mut self, rel: ElemId, proto_body: &[u8]) -> TileResult<()> {
        let rel_id = self.model.stub(rel).id();
        let rel_typed = TypedFeatureId::new(FeatureType::Relation, rel_id);
        let mut r = StreamReader::new(proto_body, "proto-GOL");
        let member_count = r.usize()?;
        if member_count == 0 {
            return Err(TileError::malformed(format!(
                "relation/{rel_id} has no members"
            )));
        }

        let mut bounds = Bbox::default();
        let mut has_outer = false;
        let mut builder = RelationBodyBuilder::new(member_count);
        for _ in 0..member_count {
            let typed_member = TypedFeatureId::from_bits(r.u64()?).ok_or_else(|| {
                TileError::malformed(format!("relation/{rel_id}: invalid member type"))
            })?;
            let role = match read_role(&mut r)? {
                ProtoStr::Global(code) => {
                    if Some(code) == self.outer_code {
                        has_outer = true;
                    }
                    Role::Global(code)
                }
                ProtoStr::Local(s) => {
                    let string = self.model.add_string(s.as_bytes());
                    Role::Local(self.model.element(string).handle)
                }
            };

            if let Some(local) = self.model.get_feature(typed_member) {
                // Register the membership before building the member, so
                // space for its relation-table pointer is reserved
                sorted_insert(
                    &mut self.model.element_mut(local).feature_mut().memberships,
                    Membership::local(rel_id, rel),
                );
                builder.add_local(&self.model, local, role);
                self.add_to_bounds(local, &mut bounds)?;
            } else if typed_member.is_node() {
                if let Some(foreign) = self.foreign_nodes.get(&typed_member.id()).copied() {
                    builder.add_foreign(foreign.reference, ForeignFeatureRef::default(), role);
                    bounds.expand_to_include(foreign.xy);
                } else {
                    let node = self.promote_anonymous_member_node(typed_member.id())?;
                    sorted_insert(
                        &mut self.model.element_mut(node).feature_mut().memberships,
                        Membership::local(rel_id, rel),
                    );
                    builder.add_local(&self.model, node, role);
                    bounds.expand_to_include(self.model.stub(node).xy());
                }
            } else if let Some(foreign) = self.foreign_features.get(&typed_member).copied() {
                builder.add_foreign(foreign.ref1, foreign.ref2, role);
                bounds.expand_to_include_bbox(&foreign.bounds);
            } else {
                return Err(TileError::MissingMember {
                    relation: rel_typed,
                    member: typed_member,
                });
            }
        }

        let body = self.model.element(rel).feature().body.ok_or_else(|| {
            TileError::unresolved(format!("relation/{rel_id} has no body element"))
        })?;
        let has_parents = !self.model.element(rel).feature().memberships.is_empty();
        builder.build(&mut self.model, body, has_parents);

        if bounds.is_empty() {
            return Err(TileError::LayoutInvariant(format!(
                "relation/{rel_id} has empty bounds"
            )));
        }
        set_feature_bounds(&mut self.model, rel, &bounds);

        let tags_at = proto_body.len() - r.remaining();
        let mut tag_model = parse_tags(&proto_body[tags_at..], self.context.strings.as_ref())?;
        let table = build_tag_table(
            &mut self.model,
            &mut tag_model,
            if has_outer {
                Some(&self.context.areas)
            } else {
                None
            },
        );
        let is_area =
            has_outer && self.model.element(table).has_flag(elem_flags::RELATION_AREA_TAGS);
        {
            let rel_handle = self.model.element(rel).handle;
            let tags_handle = self.model.element(table).handle;
            let has_locals = self.model.element(table).anchor != 0;
            let mut stub = self.model.stub_mut(rel);
            stub.set_tags(rel_handle, tags_handle, has_locals);
            stub.set_flag(feature_flags::AREA, is_area);
        }
        self.model.add_user(table);
        self.model
            .element_mut(rel)
            .set_flag(elem_flags::BUILT, true);
        Ok(())
    }

    /// Expands `bounds` by the given member, building it first if needed.
    fn add_to_bounds(&mut self, feature: ElemId, bounds: &mut Bbox) -> TileResult<()> {
        match self.model.stub(feature).feature_type() {
            FeatureType::Node => {
                bounds.expand_to_include(self.model.stub(feature).xy());
            }
            FeatureType::Way => {
                if !self.model.element(feature).is_built() {
                    let body = self.take_pending(feature)?;
                    build_way(
                        &mut self.model,
                        feature,
                        &body,
                        &self.coords,
                        &self.foreign_nodes,
                        self.context.strings.as_ref(),
                        &self.context.areas,
                        self.context.settings.include_waynode_ids,
                    )?;
                }
                bounds.expand_to_include_bbox(&self.model.stub(feature).bbox());
            }
            FeatureType::Relation => {
                if !self.model.element(feature).is_built() {
                    let body = self.take_pending(feature)?;
                    self.build_relation(feature, &body)?;
                }
                bounds.expand_to_include_bbox(&self.model.stub(feature).bbox());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryStore;
    use crate::model::element::ElementKind;
    use crate::model::tables::{MemberTableIter, RelTableIter, TableRef};
    use crate::model::tagtable::GlobalTagIter;
    use crate::reader::read_tile;
    use crate::testutil::{compile_fixture, test_context, test_tile};
    use crate::types::{Tex, Tip, START_TIP};
    use crate::writer::validate_blob;

    fn origin() -> Coord {
        test_tile().bounds().bottom_left()
    }

    #[test]
    fn one_tagged_node() {
        let context = test_context();
        let o = origin();
        let xy = Coord::new(o.x + 1000, o.y + 2000);
        let blob = compile_fixture(&context, |w| {
            w.node(1, xy, &[("place", "city")]);
        })
        .unwrap();
        validate_blob(&blob).unwrap();

        let model = read_tile(test_tile(), blob).unwrap();
        let node = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 1))
            .expect("node indexed");
        assert_eq!(model.stub(node).xy(), xy);
        assert!(model.export_table().is_none());

        let handle = model.element(node).handle;
        let tags = model
            .expect_tag_table(model.stub(node).tags_handle(handle))
            .unwrap();
        let place = context.strings.global_code("place").unwrap();
        let city = context.strings.global_code("city").unwrap();
        let elem = model.element(tags);
        let mut iter = GlobalTagIter::new(model.payload(tags), elem.anchor as usize, elem.handle);
        let tag = iter.try_next().unwrap().unwrap();
        assert_eq!(tag.key, place);
        assert_eq!(
            tag.value,
            crate::model::tagtable::RawTagValue::Narrow(city)
        );
        assert!(tag.last);
    }

    #[test]
    fn closed_ring_way_that_is_not_an_area() {
        let context = test_context();
        let o = origin();
        let blob = compile_fixture(&context, |w| {
            w.node(10, Coord::new(o.x + 100, o.y + 100), &[]);
            w.node(11, Coord::new(o.x + 200, o.y + 100), &[]);
            w.node(12, Coord::new(o.x + 200, o.y + 200), &[]);
            w.way(2, &[10, 11, 12, 10], true, &[("highway", "footway")]);
        })
        .unwrap();

        let model = read_tile(test_tile(), blob).unwrap();
        let way = model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .expect("way indexed");
        let stub = model.stub(way);
        assert!(!stub.is_area());
        assert!(!stub.has_flag(feature_flags::WAYNODE));
        assert_eq!(stub.bbox(), Bbox::new(o.x + 100, o.y + 100, o.x + 200, o.y + 200));

        // All nodes are anonymous: no node table, and the closing ring
        // repeats the first coordinate, giving 4 + 1 stored pairs
        let body = model.element(way).feature().body.unwrap();
        assert_eq!(model.element(body).anchor, 0);
        assert_eq!(model.payload(body)[0], 5);
    }

    #[test]
    fn relation_with_local_and_foreign_member() {
        let context = test_context();
        let o = origin();
        let foreign_way = TypedFeatureId::new(FeatureType::Way, 99);
        let foreign_ref = ForeignFeatureRef::new(Tip(5), Tex(7));
        let blob = compile_fixture(&context, |w| {
            w.node(10, Coord::new(o.x + 100, o.y + 100), &[]);
            w.node(11, Coord::new(o.x + 200, o.y + 100), &[]);
            w.node(12, Coord::new(o.x + 200, o.y + 200), &[]);
            w.foreign_feature(
                foreign_way,
                Some(&Bbox::new(o.x + 300, o.y + 300, o.x + 400, o.y + 400)),
                foreign_ref,
            );
            w.way(2, &[10, 11, 12, 10], true, &[("natural", "wood")]);
            w.relation(
                3,
                &[
                    (TypedFeatureId::new(FeatureType::Way, 2), "outer"),
                    (foreign_way, "outer"),
                ],
                &[("type", "multipolygon"), ("natural", "wood")],
            );
        })
        .unwrap();

        let model = read_tile(test_tile(), blob).unwrap();
        let rel = model
            .get_feature(TypedFeatureId::new(FeatureType::Relation, 3))
            .expect("relation indexed");
        assert!(model.stub(rel).is_area());
        // Bounds include the foreign member's bbox
        assert_eq!(model.stub(rel).bbox().max_x, o.x + 400);

        let body = model.element(rel).feature().body.unwrap();
        let body_elem = model.element(body);
        let mut iter = MemberTableIter::new(
            model.payload(body),
            body_elem.anchor as usize,
            body_elem.handle,
        );
        let first = iter.try_next().unwrap().unwrap();
        let way = model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        assert_eq!(first.reference, TableRef::Local(model.element(way).handle));
        let second = iter.try_next().unwrap().unwrap();
        assert_eq!(
            second.reference,
            TableRef::Foreign {
                tex_delta: 7,
                tip_delta: Some(5 - START_TIP.0 as i32),
            }
        );
        assert!(second.last);
        // Both members share the "outer" role: only the first entry carries
        // a role change
        assert!(first.role.is_some());
        assert!(second.role.is_none());

        // The local way's parent-relation table points back at the relation
        let way_rels = model.parent_rels(way).unwrap().expect("way is a member");
        let rels_elem = model.element(way_rels);
        let mut iter = RelTableIter::new(model.payload(way_rels), rels_elem.handle);
        let entry = iter.try_next().unwrap().unwrap();
        assert_eq!(entry.reference, TableRef::Local(model.element(rel).handle));
        assert!(entry.last);
    }

    #[test]
    fn identical_tag_tuples_share_one_table() {
        let context = test_context();
        let o = origin();
        let blob = compile_fixture(&context, |w| {
            w.node(1, Coord::new(o.x + 50, o.y + 50), &[("place", "city")]);
            w.node(2, Coord::new(o.x + 500, o.y + 500), &[("place", "city")]);
        })
        .unwrap();

        let model = read_tile(test_tile(), blob).unwrap();
        let tables: Vec<_> = model
            .elements()
            .filter(|(_, e)| e.kind == ElementKind::TagTable)
            .collect();
        assert_eq!(tables.len(), 1);
        let a = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 1))
            .unwrap();
        let b = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 2))
            .unwrap();
        assert_eq!(
            model.stub(a).tags_handle(model.element(a).handle),
            model.stub(b).tags_handle(model.element(b).handle)
        );
    }

    #[test]
    fn exported_features_are_bound() {
        let context = test_context();
        let o = origin();
        let blob = compile_fixture(&context, |w| {
            w.export_table(&[TypedFeatureId::new(FeatureType::Node, 1)]);
            w.node(1, Coord::new(o.x + 50, o.y + 50), &[("place", "city")]);
        })
        .unwrap();
        let model = read_tile(test_tile(), blob).unwrap();
        let exports = model.export_table().expect("export table present");
        assert_eq!(model.element(exports).size, 8); // count word + 1 entry
    }

    #[test]
    fn orphan_node_gets_the_reserved_tags() {
        let context = test_context();
        let o = origin();
        let blob = compile_fixture(&context, |w| {
            w.node(7, Coord::new(o.x + 10, o.y + 10), &[]);
            // An orphan must still be addressable as a member; promote it
            w.membership(900, 2, TypedFeatureId::new(FeatureType::Node, 7));
            w.special_node(7, proto::special_node_flags::ORPHAN);
        })
        .unwrap();

        let model = read_tile(test_tile(), blob).unwrap();
        let node = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 7))
            .expect("orphan kept as a feature");
        let stub = model.stub(node);
        assert!(stub.has_flag(feature_flags::EXCEPTION_NODE));
        assert!(!stub.has_flag(feature_flags::SHARED_LOCATION));
        // Exactly one synthesized local tag: a 4-byte key pointer plus the
        // narrow global-string value "yes"
        let tags = model
            .expect_tag_table(stub.tags_handle(model.element(node).handle))
            .unwrap();
        assert_eq!(model.element(tags).anchor, 6);
    }

    #[test]
    fn engine_commits_all_tiles() {
        let context = test_context();
        let o = origin();
        let mut writer = proto::ProtoWriter::new(context.strings.as_ref());
        writer.node(1, Coord::new(o.x + 50, o.y + 50), &[("place", "city")]);
        let pile_one = writer.into_bytes();
        let piles = vec![pile_one, Vec::new()];

        let mut store = MemoryStore::default();
        Compiler::new(context)
            .threads(2)
            .compile(
                |pile| Ok(piles[pile as usize - 1].clone()),
                &mut store,
            )
            .unwrap();
        assert!(store.is_committed());
        assert_eq!(store.blobs.len(), 2);
        for tip in [Tip(1), Tip(2)] {
            validate_blob(store.blob_of_tip(tip).unwrap()).unwrap();
        }
    }
}
