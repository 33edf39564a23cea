mod file;

pub use file::{CatalogError, CatalogFile, Clock, SystemClock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// One product in the catalog.
///
/// `sku` is kept in the form it was first seen in; identity across merges is
/// [`normalize_sku`] of it.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub sku: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl CatalogRecord {
    pub fn new(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into().trim().to_string(),
            images: Vec::new(),
            name: None,
        }
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for url in images {
            self.push_image(url);
        }
        self
    }

    pub fn key(&self) -> String {
        normalize_sku(&self.sku)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.images.iter().any(|existing| existing == url)
    }

    /// Appends `url` unless it is empty or already present. Returns whether
    /// the record changed.
    pub fn push_image(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        let url = url.trim();
        if url.is_empty() || self.contains(url) {
            return false;
        }
        self.images.push(url.to_string());
        true
    }

    /// Replaces the image list, dropping blanks and repeats.
    pub fn set_images<I, S>(&mut self, images: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images.clear();
        for url in images {
            self.push_image(url);
        }
    }
}

/// Canonical merge identity of a SKU: uppercase, with every run of `_`, `-`
/// or whitespace folded into a single `-`.
pub fn normalize_sku(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.trim().chars() {
        if ch == '_' || ch == '-' || ch.is_whitespace() {
            pending_separator = !key.is_empty();
            continue;
        }
        if pending_separator {
            key.push('-');
            pending_separator = false;
        }
        key.extend(ch.to_uppercase());
    }
    key
}

/// Ordered mapping from normalized key to record.
#[derive(Debug, Clone, Default)]
pub struct CatalogStore {
    records: IndexMap<String, CatalogRecord>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from raw records. Records sharing a normalized key are
    /// folded into the first one; records without a SKU are dropped.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = CatalogRecord>,
    {
        let mut store = Self::new();
        for record in records {
            let key = record.key();
            if key.is_empty() {
                continue;
            }
            let target = store
                .records
                .entry(key)
                .or_insert_with(|| CatalogRecord::new(record.sku.clone()));
            if target.name.is_none() {
                target.name = record.name.filter(|name| !name.trim().is_empty());
            }
            for url in record.images {
                target.push_image(url);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sku: &str) -> Option<&CatalogRecord> {
        self.records.get(&normalize_sku(sku))
    }

    pub fn get_mut(&mut self, sku: &str) -> Option<&mut CatalogRecord> {
        self.records.get_mut(&normalize_sku(sku))
    }

    /// Returns the record for `sku`, creating an empty one at the end of the
    /// store if needed.
    pub fn entry(&mut self, sku: &str) -> &mut CatalogRecord {
        self.records
            .entry(normalize_sku(sku))
            .or_insert_with(|| CatalogRecord::new(sku))
    }

    pub fn contains_key(&self, sku: &str) -> bool {
        self.records.contains_key(&normalize_sku(sku))
    }

    /// Removes a record, keeping the order of the others.
    pub fn remove(&mut self, sku: &str) -> Option<CatalogRecord> {
        self.records.shift_remove(&normalize_sku(sku))
    }

    pub fn records(&self) -> impl Iterator<Item = &CatalogRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut CatalogRecord> {
        self.records.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn into_records(self) -> Vec<CatalogRecord> {
        self.records.into_values().collect()
    }

    pub fn total_images(&self) -> usize {
        self.records.values().map(|record| record.images.len()).sum()
    }
}

// Order is part of the catalog's meaning, so equality is positional.
impl PartialEq for CatalogStore {
    fn eq(&self, other: &Self) -> bool {
        self.records.len() == other.records.len()
            && self.records.iter().eq(other.records.iter())
    }
}

impl Eq for CatalogStore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_separators_and_case() {
        assert_eq!(normalize_sku("abc_12"), "ABC-12");
        assert_eq!(normalize_sku("ABC-12"), "ABC-12");
        assert_eq!(normalize_sku(" abc 12 "), "ABC-12");
        assert_eq!(normalize_sku("abc__-12"), "ABC-12");
        assert_eq!(normalize_sku("_abc-12-"), "ABC-12");
        assert_eq!(normalize_sku("   "), "");
    }

    #[test]
    fn entry_resolves_equivalent_skus_to_one_record() {
        let mut store = CatalogStore::new();
        store.entry("abc_12").push_image("https://a.example/1.jpg");
        store.entry("ABC-12").push_image("https://a.example/2.jpg");
        assert_eq!(store.len(), 1);
        let record = store.get("abc 12").expect("record");
        assert_eq!(record.sku, "abc_12");
        assert_eq!(record.images.len(), 2);
    }

    #[test]
    fn from_records_folds_duplicates_and_images() {
        let store = CatalogStore::from_records(vec![
            CatalogRecord::new("x-1").with_images(["u1", "u2", "u1"]),
            CatalogRecord::new("").with_images(["ignored"]),
            CatalogRecord::new("X_1").with_images(["u3", "u2"]),
        ]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("x-1").unwrap().images, vec!["u1", "u2", "u3"]);
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = CatalogStore::from_records(vec![CatalogRecord::new("a"), CatalogRecord::new("b")]);
        let b = CatalogStore::from_records(vec![CatalogRecord::new("b"), CatalogRecord::new("a")]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut store = CatalogStore::from_records(vec![
            CatalogRecord::new("a"),
            CatalogRecord::new("b"),
            CatalogRecord::new("c"),
        ]);
        assert!(store.remove("B").is_some());
        let keys: Vec<&str> = store.keys().collect();
        assert_eq!(keys, vec!["A", "C"]);
    }
}
