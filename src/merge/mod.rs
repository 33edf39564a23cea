mod ordering;
mod rows;
mod rules;

pub use ordering::{numeric_suffix, sort_within_record};
pub use rows::{
    Collected, ParsedRows, RowError, ScrapeError, ScrapeRow, SourceBatch, parse_source_json,
    parse_tsv, parse_tsv_line,
};
pub use rules::{MergeRules, SourceRule};

use crate::catalog::{CatalogRecord, CatalogStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Counters for one merge pass. Nothing in a merge is fatal; every skipped
/// input shows up here instead.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub rows_seen: usize,
    pub added: usize,
    pub duplicates: usize,
    pub banned: usize,
    pub malformed_rows: usize,
    pub scrape_errors: usize,
    pub new_records: usize,
}

impl MergeReport {
    pub fn absorb(&mut self, other: &MergeReport) {
        self.rows_seen += other.rows_seen;
        self.added += other.added;
        self.duplicates += other.duplicates;
        self.banned += other.banned;
        self.malformed_rows += other.malformed_rows;
        self.scrape_errors += other.scrape_errors;
        self.new_records += other.new_records;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RefineReport {
    pub dropped: usize,
    pub reordered: usize,
}

/// Folds collector output into a [`CatalogStore`].
///
/// Merging only ever adds: a record keeps every image it already had unless
/// the banned list or a consistency rule removes it.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    rules: Arc<MergeRules>,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(MergeRules::default())
    }
}

impl MergeEngine {
    pub fn new(rules: MergeRules) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }

    pub fn rules(&self) -> &MergeRules {
        &self.rules
    }

    pub fn ingest(&self, store: &mut CatalogStore, rows: &[ScrapeRow]) -> MergeReport {
        let mut report = MergeReport::default();
        for row in rows {
            report.rows_seen += 1;
            let sku = row.sku.trim();
            let url = row.url.trim();
            if sku.is_empty() || url.is_empty() {
                report.malformed_rows += 1;
                continue;
            }
            self.ingest_url(store, sku, url, row.name.as_deref(), &mut report);
        }
        report
    }

    /// Merges one collector result. A [`ScrapeError`] counts as zero images
    /// for that SKU and source.
    pub fn ingest_collected(
        &self,
        store: &mut CatalogStore,
        source_label: &str,
        sku: &str,
        collected: &Result<Collected, ScrapeError>,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let sku = sku.trim();
        match collected {
            Err(err) => {
                debug!(
                    target = "catalog.merge",
                    source = source_label,
                    sku,
                    error = %err,
                    "collector produced no images"
                );
                report.scrape_errors += 1;
            }
            Ok(_) if sku.is_empty() => report.malformed_rows += 1,
            Ok(found) => {
                for url in &found.images {
                    report.rows_seen += 1;
                    let url = url.trim();
                    if url.is_empty() {
                        report.malformed_rows += 1;
                        continue;
                    }
                    self.ingest_url(store, sku, url, found.name.as_deref(), &mut report);
                }
            }
        }
        report
    }

    fn ingest_url(
        &self,
        store: &mut CatalogStore,
        sku: &str,
        url: &str,
        name: Option<&str>,
        report: &mut MergeReport,
    ) {
        if self.rules.is_banned(url) {
            report.banned += 1;
            return;
        }
        if !store.contains_key(sku) {
            report.new_records += 1;
        }
        let record = store.entry(sku);
        if record.name.is_none()
            && let Some(name) = name.map(str::trim).filter(|name| !name.is_empty())
        {
            record.name = Some(name.to_string());
        }
        if record.push_image(url) {
            report.added += 1;
        } else {
            report.duplicates += 1;
        }
    }

    /// Removes banned URLs that are already in the store.
    pub fn scrub_banned(&self, store: &mut CatalogStore) -> usize {
        let mut removed = 0;
        for record in store.records_mut() {
            let before = record.images.len();
            record.images.retain(|url| !self.rules.is_banned(url));
            removed += before - record.images.len();
        }
        removed
    }

    /// Drops URLs served by `rule.host` that do not mention their record's
    /// SKU. Returns the number of URLs removed.
    pub fn filter_source_consistency(&self, store: &mut CatalogStore, rule: &SourceRule) -> usize {
        if !rule.require_sku_in_url {
            return 0;
        }
        let mut removed = 0;
        for record in store.records_mut() {
            let sku = record.sku.clone();
            let before = record.images.len();
            record
                .images
                .retain(|url| !rule.matches(url) || url_contains_sku(url, &sku));
            removed += before - record.images.len();
        }
        removed
    }

    pub fn sort_within_record(&self, record: &mut CatalogRecord) -> bool {
        sort_within_record(record, &self.rules)
    }

    /// Consistency filtering for every configured source followed by the
    /// per-record sort.
    pub fn refine(&self, store: &mut CatalogStore) -> RefineReport {
        let mut report = RefineReport::default();
        for rule in &self.rules.consistency_sources {
            report.dropped += self.filter_source_consistency(store, rule);
        }
        for record in store.records_mut() {
            if sort_within_record(record, &self.rules) {
                report.reordered += 1;
            }
        }
        report
    }
}

/// Whether `url` mentions `sku` with `-`, `_` or space between its parts,
/// ignoring case.
pub fn url_contains_sku(url: &str, sku: &str) -> bool {
    let sku = sku.trim().to_lowercase();
    if url.is_empty() || sku.is_empty() {
        return false;
    }
    let lower = url.to_lowercase();
    ['-', '_', ' '].iter().any(|separator| {
        let variant: String = sku
            .chars()
            .map(|ch| {
                if matches!(ch, '-' | '_' | ' ') {
                    *separator
                } else {
                    ch
                }
            })
            .collect();
        lower.contains(&variant)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: &str = "https://media.foot-store.com/catalog/product";

    fn row(sku: &str, url: &str) -> ScrapeRow {
        ScrapeRow::new(sku, "test", url)
    }

    fn seeded() -> CatalogStore {
        CatalogStore::from_records(vec![
            CatalogRecord::new("ABC-12").with_images(["https://static.nike.com/1.jpg"]),
        ])
    }

    #[test]
    fn ingest_is_idempotent() {
        let engine = MergeEngine::default();
        let rows = vec![
            row("abc_12", "https://static.nike.com/2.jpg"),
            row("XYZ-9", "https://images.puma.com/a.jpg"),
            row("xyz 9", "https://images.puma.com/b.jpg"),
        ];
        let mut once = seeded();
        engine.ingest(&mut once, &rows);
        let mut twice = once.clone();
        let report = engine.ingest(&mut twice, &rows);
        assert_eq!(once, twice);
        assert_eq!(report.added, 0);
        assert_eq!(report.duplicates, 3);
    }

    #[test]
    fn ingest_preserves_existing_images() {
        let engine = MergeEngine::default();
        let mut store = seeded();
        let report = engine.ingest(&mut store, &[row("OTHER-1", "https://x.example/a.jpg")]);
        assert_eq!(report.new_records, 1);
        assert_eq!(
            store.get("ABC-12").unwrap().images,
            vec!["https://static.nike.com/1.jpg"]
        );
        engine.ingest(&mut store, &[]);
        assert_eq!(store.get("ABC-12").unwrap().images.len(), 1);
    }

    #[test]
    fn equivalent_skus_merge_into_one_record() {
        let engine = MergeEngine::default();
        let mut store = CatalogStore::new();
        engine.ingest(
            &mut store,
            &[row("abc_12", "https://a/1.jpg"), row("ABC-12", "https://a/2.jpg")],
        );
        assert_eq!(store.len(), 1);
        let record = store.get("ABC-12").unwrap();
        assert_eq!(record.sku, "abc_12");
        assert_eq!(record.images, vec!["https://a/1.jpg", "https://a/2.jpg"]);
    }

    #[test]
    fn banned_urls_never_enter_the_store() {
        let engine = MergeEngine::default();
        let banned = "https://media.foot-store.com/lazyload/websites/1/fs.jpg";
        let mut store = CatalogStore::from_records(vec![
            CatalogRecord::new("A").with_images([banned, "https://a/ok.jpg"]),
        ]);
        let report = engine.ingest(&mut store, &[row("B", banned), row("A", banned)]);
        assert_eq!(report.banned, 2);
        assert!(!store.contains_key("B"));
        assert_eq!(engine.scrub_banned(&mut store), 1);
        assert_eq!(store.get("A").unwrap().images, vec!["https://a/ok.jpg"]);
    }

    #[test]
    fn malformed_rows_are_counted_not_fatal() {
        let engine = MergeEngine::default();
        let mut store = CatalogStore::new();
        let report = engine.ingest(
            &mut store,
            &[row("", "https://a/1.jpg"), row("A", " "), row("A", "https://a/2.jpg")],
        );
        assert_eq!(report.malformed_rows, 2);
        assert_eq!(report.added, 1);
    }

    #[test]
    fn consistency_filter_drops_foreign_foot_store_urls() {
        let engine = MergeEngine::default();
        let mut store = CatalogStore::from_records(vec![CatalogRecord::new("107916-03").with_images([
            format!("{FS}/99999_1.jpg"),
            format!("{FS}/107916-03_1.jpg"),
            format!("{FS}/PUMA_107916_03_2.jpg"),
            "https://static.nike.com/99999_1.jpg".to_string(),
        ])]);
        let rule = SourceRule::new("media.foot-store.com");
        assert_eq!(engine.filter_source_consistency(&mut store, &rule), 1);
        assert_eq!(
            store.get("107916-03").unwrap().images,
            vec![
                format!("{FS}/107916-03_1.jpg"),
                format!("{FS}/PUMA_107916_03_2.jpg"),
                "https://static.nike.com/99999_1.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn scrape_errors_contribute_no_images() {
        let engine = MergeEngine::default();
        let mut store = seeded();
        let report = engine.ingest_collected(
            &mut store,
            "puma",
            "ABC-12",
            &Err(ScrapeError::Reported("gallery missing".into())),
        );
        assert_eq!(report.scrape_errors, 1);
        assert_eq!(store.get("ABC-12").unwrap().images.len(), 1);

        let found = Collected {
            name: Some("Future Ultimate".into()),
            images: vec!["https://images.puma.com/z.jpg".into()],
        };
        engine.ingest_collected(&mut store, "puma", "abc 12", &Ok(found));
        let record = store.get("ABC-12").unwrap();
        assert_eq!(record.images.len(), 2);
        assert_eq!(record.name.as_deref(), Some("Future Ultimate"));
    }

    #[test]
    fn refine_filters_then_sorts() {
        let engine = MergeEngine::default();
        let mut store = CatalogStore::from_records(vec![CatalogRecord::new("107916-03").with_images([
            "https://cdn.unknown.example/u.jpg".to_string(),
            format!("{FS}/107916-03_2.jpg"),
            format!("{FS}/55555_1.jpg"),
            format!("{FS}/107916-03_1.jpg"),
        ])]);
        let report = engine.refine(&mut store);
        assert_eq!(report, RefineReport { dropped: 1, reordered: 1 });
        assert_eq!(
            store.get("107916-03").unwrap().images,
            vec![
                format!("{FS}/107916-03_1.jpg"),
                format!("{FS}/107916-03_2.jpg"),
                "https://cdn.unknown.example/u.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn sku_variants_match_in_urls() {
        assert!(url_contains_sku("https://x/ABC_12.jpg", "abc-12"));
        assert!(!url_contains_sku("https://x/abc%20-12.jpg", "abc 12"));
        assert!(url_contains_sku("https://x/abc 12.jpg", "ABC_12"));
        assert!(!url_contains_sku("https://x/abc12.jpg", "abc-12"));
        assert!(!url_contains_sku("https://x/a.jpg", ""));
    }
}
