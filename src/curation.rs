use crate::catalog::{CatalogError, CatalogFile, CatalogRecord, CatalogStore, normalize_sku};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::PathBuf,
};
use tracing::info;

/// A reviewer's decision for one SKU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Keep(Vec<String>),
    Drop,
}

impl From<Option<Vec<String>>> for Selection {
    fn from(value: Option<Vec<String>>) -> Self {
        match value {
            Some(images) if !images.is_empty() => Selection::Keep(images),
            _ => Selection::Drop,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurationOutcome {
    pub changed: bool,
    pub dropped: usize,
    pub replaced: usize,
    pub backup: Option<PathBuf>,
}

/// Applies `selections` to a copy of `store`. SKUs without a selection are
/// left as they are; keeping no images drops the SKU. Selection keys may use
/// any SKU spelling.
pub fn apply_selections(
    store: &CatalogStore,
    selections: &HashMap<String, Selection>,
) -> CatalogStore {
    let by_key: HashMap<String, &Selection> = selections
        .iter()
        .map(|(sku, selection)| (normalize_sku(sku), selection))
        .collect();
    let mut next = CatalogStore::new();
    for record in store.records() {
        match by_key.get(&record.key()) {
            Some(Selection::Drop) => {}
            Some(Selection::Keep(images)) if images.is_empty() => {}
            Some(Selection::Keep(images)) => {
                let mut kept = record.clone();
                kept.set_images(images.iter().map(String::as_str));
                *next.entry(&record.sku) = kept;
            }
            None => *next.entry(&record.sku) = record.clone(),
        }
    }
    next
}

/// Reads the catalog, applies `selections` and persists the result. Nothing
/// is written, backup included, when the selections change nothing.
pub fn curate(
    file: &CatalogFile,
    selections: &HashMap<String, Selection>,
) -> Result<CurationOutcome, CatalogError> {
    let current = file.read()?;
    let next = apply_selections(&current, selections);
    if next == current {
        return Ok(CurationOutcome::default());
    }
    let dropped = current.len() - next.len();
    let replaced = next
        .records()
        .filter(|record| current.get(&record.sku) != Some(record))
        .count();
    let backup = file.persist(&next)?;
    info!(
        target = "catalog.store",
        dropped,
        replaced,
        backup = ?backup,
        "curated catalog written"
    );
    Ok(CurationOutcome {
        changed: true,
        dropped,
        replaced,
        backup,
    })
}

/// Records for `skus` in store order, without repeats.
pub fn review_entries(store: &CatalogStore, skus: &[String]) -> Vec<CatalogRecord> {
    let wanted: HashSet<String> = skus.iter().map(|sku| normalize_sku(sku)).collect();
    store
        .records()
        .filter(|record| wanted.contains(&record.key()))
        .cloned()
        .collect()
}

/// Turns picked positions into a selection. Picks keep the stored order
/// whatever order they arrive in; nothing picked drops the record and
/// picking everything means no change.
pub fn selection_from_indexes(record: &CatalogRecord, indexes: &[usize]) -> Option<Selection> {
    let picked: Vec<String> = indexes
        .iter()
        .copied()
        .collect::<BTreeSet<usize>>()
        .into_iter()
        .filter_map(|idx| record.images.get(idx).cloned())
        .collect();
    if picked.is_empty() {
        return Some(Selection::Drop);
    }
    if picked == record.images {
        return None;
    }
    Some(Selection::Keep(picked))
}
