//! Turns a staged [`TagModel`] into a deduplicated tag-table element.

use crate::area::AreaClassifier;
use crate::compiler::writers::{StrRef, TagTableWriter};
use crate::model::element::{elem_flags, ElemId};
use crate::model::TileModel;
use crate::tag::{TagKey, TagModel, TagValue};

enum StagedValue {
    Number { flags: u32, raw: u32 },
    Str(StrRef),
}

/// Builds (or finds) the tag-table element for the staged tags. When `area`
/// is given, the table's area flags are classified and cached on first use.
///
/// All strings are interned before the table allocation starts, so a
/// duplicate table can always be rolled back safely.
pub fn build_tag_table(
    model: &mut TileModel,
    tags: &mut TagModel,
    area: Option<&AreaClassifier>,
) -> ElemId {
    tags.normalize();

    let mut staged_locals = Vec::with_capacity(tags.locals().len());
    for tag in tags.locals() {
        let TagKey::Local(key) = &tag.key else {
            unreachable!("local section holds local keys only");
        };
        let key_id = model.add_string(key.as_bytes());
        // Local keys are reached through 4-byte-aligned pointers
        model.element_mut(key_id).alignment = crate::model::element::Alignment::DWord;
        let key_ref = StrRef {
            handle: model.element(key_id).handle,
            hash: model.element(key_id).shared().hash,
        };
        staged_locals.push((key_ref, stage_value(model, &tag.value)));
    }
    let mut staged_globals = Vec::with_capacity(tags.globals().len());
    for tag in tags.globals() {
        let TagKey::Global(code) = &tag.key else {
            unreachable!("global section holds global keys only");
        };
        staged_globals.push((u32::from(*code), stage_value(model, &tag.value)));
    }

    let anchor = tags.local_size();
    let size = anchor + tags.global_size();
    let table = model.begin_tag_table(size, anchor);
    let handle = model.element(table).handle;
    let mut needs_fixup = !staged_locals.is_empty();

    let payload = model.payload_mut(table);
    let mut writer = TagTableWriter::new(payload, handle, anchor);
    for (key, value) in &staged_locals {
        match value {
            StagedValue::Number { flags, raw } => writer.local_tag_value(*flags, *key, *raw),
            StagedValue::Str(value) => writer.local_tag_string(*key, *value),
        }
    }
    writer.end_local_tags();
    for (code, value) in &staged_globals {
        match value {
            StagedValue::Number { flags, raw } => writer.global_tag_value(*flags, *code, *raw),
            StagedValue::Str(value) => {
                writer.global_tag_string(*code, *value);
                needs_fixup = true;
            }
        }
    }
    writer.end_global_tags();
    let hash = writer.hash();

    let table = model.complete_tag_table(table, hash, needs_fixup);

    if let Some(classifier) = area {
        if !model.element(table).is_built() {
            let area_tags = classifier.is_area(tags);
            let elem = model.element_mut(table);
            elem.set_flag(elem_flags::WAY_AREA_TAGS, area_tags.for_way);
            elem.set_flag(elem_flags::RELATION_AREA_TAGS, area_tags.for_relation);
            elem.set_flag(elem_flags::BUILT, true);
        }
    }

    tags.clear();
    table
}

fn stage_value(model: &mut TileModel, value: &TagValue) -> StagedValue {
    match value {
        TagValue::NarrowNumber(raw) => StagedValue::Number {
            flags: 0,
            raw: u32::from(*raw),
        },
        TagValue::GlobalString(code) => StagedValue::Number {
            flags: 1,
            raw: u32::from(*code),
        },
        TagValue::WideNumber(raw) => StagedValue::Number {
            flags: 2,
            raw: *raw,
        },
        TagValue::LocalString(s) => {
            let id = model.add_string(s.as_bytes());
            StagedValue::Str(StrRef {
                handle: model.element(id).handle,
                hash: model.element(id).shared().hash,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Tile;

    fn model() -> TileModel {
        TileModel::new(Tile::new(10, 100, 200))
    }

    fn simple_tags() -> TagModel {
        let mut tags = TagModel::new();
        tags.add_global(7, TagValue::GlobalString(12));
        tags.add_local("name:xx", TagValue::LocalString("Brunnen".into()));
        tags
    }

    #[test]
    fn identical_tables_deduplicate() {
        let mut model = model();
        let a = build_tag_table(&mut model, &mut simple_tags(), None);
        let elements_before = model.element_count();
        let b = build_tag_table(&mut model, &mut simple_tags(), None);
        assert_eq!(a, b);
        assert_eq!(model.element_count(), elements_before);
    }

    #[test]
    fn different_tables_do_not_deduplicate() {
        let mut model = model();
        let a = build_tag_table(&mut model, &mut simple_tags(), None);
        let mut other = TagModel::new();
        other.add_global(7, TagValue::GlobalString(13));
        let b = build_tag_table(&mut model, &mut other, None);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_tags_build_the_end_marker_only() {
        let mut model = model();
        let table = build_tag_table(&mut model, &mut TagModel::new(), None);
        let elem = model.element(table);
        assert_eq!(elem.size, 4);
        assert_eq!(elem.anchor, 0);
        assert!(!elem.needs_fixup());
        let payload = model.payload(table);
        assert_eq!(payload, &[0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn local_tags_set_anchor_and_fixup() {
        let mut model = model();
        let table = build_tag_table(&mut model, &mut simple_tags(), None);
        let elem = model.element(table);
        // one local tag with a wide string value: 4 (key) + 4 (value)
        assert_eq!(elem.anchor, 8);
        assert!(elem.needs_fixup());
    }
}
