//! Decides whether a closed way or a relation with outer members forms an
//! area, based on its tags.
//!
//! Rules are keyed by global key code. A key either always marks an area
//! ("any value"), or only for / except for certain global-string values.

use std::collections::HashMap;

use crate::catalog::StringCatalog;
use crate::tag::{TagModel, TagValue};

#[derive(Debug, Clone)]
enum ValueRule {
    Any,
    OnlyValues(Vec<u16>),
    ExceptValues(Vec<u16>),
}

#[derive(Debug, Clone)]
struct AreaRule {
    for_ways: bool,
    for_relations: bool,
    values: ValueRule,
}

/// Result of classifying one tag table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaTags {
    pub for_way: bool,
    pub for_relation: bool,
}

/// Rule-driven area classifier shared read-only by all workers.
#[derive(Debug, Default)]
pub struct AreaClassifier {
    rules: HashMap<u16, AreaRule>,
    /// Code of "no", which negates any area rule when present as the value.
    no_code: Option<u16>,
}

impl AreaClassifier {
    pub fn new(strings: &dyn StringCatalog) -> Self {
        Self {
            rules: HashMap::new(),
            no_code: strings.global_code("no"),
        }
    }

    /// The conventional default rule set: `area` itself plus the common
    /// polygon keys, with `highway`-style exceptions left to the caller.
    pub fn with_default_rules(strings: &dyn StringCatalog) -> Self {
        let mut classifier = Self::new(strings);
        for key in [
            "building", "landuse", "natural", "leisure", "amenity", "boundary", "place",
        ] {
            classifier.add_rule(strings, key, true, true, &[], &[]);
        }
        classifier.add_rule(strings, "area", true, false, &[], &[]);
        classifier
    }

    /// Registers a rule for `key`. Non-empty `only` restricts the rule to
    /// those values; non-empty `except` inverts that. Values that are not in
    /// the global string catalog cannot match and are dropped.
    pub fn add_rule(
        &mut self,
        strings: &dyn StringCatalog,
        key: &str,
        for_ways: bool,
        for_relations: bool,
        only: &[&str],
        except: &[&str],
    ) {
        let Some(key_code) = strings.global_code(key) else {
            return;
        };
        let to_codes = |values: &[&str]| {
            values
                .iter()
                .filter_map(|v| strings.global_code(v))
                .collect::<Vec<_>>()
        };
        let values = if !only.is_empty() {
            ValueRule::OnlyValues(to_codes(only))
        } else if !except.is_empty() {
            ValueRule::ExceptValues(to_codes(except))
        } else {
            ValueRule::Any
        };
        self.rules.insert(
            key_code,
            AreaRule {
                for_ways,
                for_relations,
                values,
            },
        );
    }

    /// Classifies a normalized tag model.
    pub fn is_area(&self, tags: &TagModel) -> AreaTags {
        let mut result = AreaTags::default();
        for tag in tags.globals() {
            let crate::tag::TagKey::Global(code) = &tag.key else {
                continue;
            };
            let Some(rule) = self.rules.get(code) else {
                continue;
            };
            let value_code = match &tag.value {
                TagValue::GlobalString(v) => Some(*v),
                _ => None,
            };
            // "key=no" never marks an area
            if value_code.is_some() && value_code == self.no_code {
                continue;
            }
            let matches = match (&rule.values, value_code) {
                (ValueRule::Any, _) => true,
                (ValueRule::OnlyValues(codes), Some(v)) => codes.contains(&v),
                (ValueRule::OnlyValues(_), None) => false,
                (ValueRule::ExceptValues(codes), Some(v)) => !codes.contains(&v),
                (ValueRule::ExceptValues(_), None) => true,
            };
            if matches {
                result.for_way |= rule.for_ways;
                result.for_relation |= rule.for_relations;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryStringCatalog;

    fn catalog() -> MemoryStringCatalog {
        MemoryStringCatalog::new(["building", "highway", "no", "yes", "footway", "area"])
    }

    #[test]
    fn building_is_an_area() {
        let strings = catalog();
        let classifier = AreaClassifier::with_default_rules(&strings);
        let mut tags = TagModel::new();
        tags.add_global(
            strings.global_code("building").unwrap(),
            TagValue::GlobalString(strings.global_code("yes").unwrap()),
        );
        tags.normalize();
        let area = classifier.is_area(&tags);
        assert!(area.for_way && area.for_relation);
    }

    #[test]
    fn key_no_is_not_an_area() {
        let strings = catalog();
        let classifier = AreaClassifier::with_default_rules(&strings);
        let mut tags = TagModel::new();
        tags.add_global(
            strings.global_code("building").unwrap(),
            TagValue::GlobalString(strings.global_code("no").unwrap()),
        );
        tags.normalize();
        assert_eq!(classifier.is_area(&tags), AreaTags::default());
    }

    #[test]
    fn highway_is_not_an_area_by_default() {
        let strings = catalog();
        let classifier = AreaClassifier::with_default_rules(&strings);
        let mut tags = TagModel::new();
        tags.add_global(
            strings.global_code("highway").unwrap(),
            TagValue::GlobalString(strings.global_code("footway").unwrap()),
        );
        tags.normalize();
        assert_eq!(classifier.is_area(&tags), AreaTags::default());
    }
}
