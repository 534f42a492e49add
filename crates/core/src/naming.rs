//! Naming helpers used when a declaration omits a target type or a collection name.

use convert_case::{Case, Casing};

/// Inflection and casing rules.
pub trait NameResolver: Send + Sync {
    fn pluralize(&self, word: &str) -> String;
    fn singularize(&self, word: &str) -> String;
    /// `child_ones` -> `ChildOnes`.
    fn camelize(&self, word: &str) -> String;
    /// `ChildOne` -> `child_one`.
    fn underscore(&self, word: &str) -> String;

    /// Default collection name for an entity type (`ChildOne` -> `child_ones`).
    fn collection_name(&self, type_name: &str) -> String {
        self.pluralize(&self.underscore(type_name))
    }
}

/// English suffix rules; irregular plurals are not covered.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNameResolver;

const SIBILANT_ENDINGS: [&str; 5] = ["s", "x", "z", "ch", "sh"];

fn ends_with_consonant_y(word: &str) -> bool {
    let mut chars = word.chars().rev();
    matches!(
        (chars.next(), chars.next()),
        (Some('y'), Some(c)) if !"aeiou".contains(c.to_ascii_lowercase())
    )
}

impl NameResolver for DefaultNameResolver {
    fn pluralize(&self, word: &str) -> String {
        if word.is_empty() {
            return String::new();
        }
        if ends_with_consonant_y(word) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
        if SIBILANT_ENDINGS.iter().any(|end| word.ends_with(end)) {
            return format!("{word}es");
        }
        format!("{word}s")
    }

    fn singularize(&self, word: &str) -> String {
        if let Some(stem) = word.strip_suffix("ies") {
            if !stem.is_empty() {
                return format!("{stem}y");
            }
        }
        if let Some(stem) = word.strip_suffix("es") {
            if SIBILANT_ENDINGS.iter().any(|end| stem.ends_with(end)) {
                return stem.to_string();
            }
        }
        match word.strip_suffix('s') {
            Some(stem) if !stem.is_empty() && !stem.ends_with('s') => stem.to_string(),
            _ => word.to_string(),
        }
    }

    fn camelize(&self, word: &str) -> String {
        word.to_case(Case::Pascal)
    }

    fn underscore(&self, word: &str) -> String {
        word.to_case(Case::Snake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pluralizes_common_suffixes() {
        let n = DefaultNameResolver;
        assert_eq!(n.pluralize("employee"), "employees");
        assert_eq!(n.pluralize("category"), "categories");
        assert_eq!(n.pluralize("box"), "boxes");
        assert_eq!(n.pluralize("day"), "days");
    }

    #[test]
    fn singularize_reverses_pluralize() {
        let n = DefaultNameResolver;
        for word in ["employee", "category", "box", "day", "branch"] {
            assert_eq!(n.singularize(&n.pluralize(word)), word);
        }
        assert_eq!(n.singularize("address"), "address");
    }

    #[test]
    fn casing_round_trips_type_names() {
        let n = DefaultNameResolver;
        assert_eq!(n.camelize("child_one"), "ChildOne");
        assert_eq!(n.underscore("ChildOne"), "child_one");
        assert_eq!(n.collection_name("ChildOne"), "child_ones");
    }
}
