use super::rules::MergeRules;
use crate::catalog::CatalogRecord;
use once_cell::sync::Lazy;
use regex::Regex;

static UNDERSCORE_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_([0-9]+)").expect("static regex"));

/// Reorders `record.images` in place. Returns whether the order changed.
///
/// Images are ranked by trusted-source priority (stable, so discovery order
/// breaks ties). URLs of a numeric-suffix source are then reordered among
/// the slots they already occupy, ascending by suffix, with unnumbered URLs
/// after the numbered ones.
pub fn sort_within_record(record: &mut CatalogRecord, rules: &MergeRules) -> bool {
    let before = record.images.clone();
    record
        .images
        .sort_by_cached_key(|url| rules.brand_rank(url));
    order_by_numeric_suffix(&mut record.images, &record.sku, rules);
    record.images != before
}

fn order_by_numeric_suffix(images: &mut [String], sku: &str, rules: &MergeRules) {
    let slots: Vec<usize> = images
        .iter()
        .enumerate()
        .filter(|(_, url)| {
            rules
                .source_rule_for(url)
                .is_some_and(|source| source.numeric_suffix_order)
        })
        .map(|(idx, _)| idx)
        .collect();
    if slots.len() < 2 {
        return;
    }
    let anchored = sku_anchored_pattern(sku);
    let mut keyed: Vec<(Option<u64>, usize, String)> = slots
        .iter()
        .map(|&idx| {
            let url = &images[idx];
            (extract_suffix(url, anchored.as_ref()), idx, url.clone())
        })
        .collect();
    keyed.sort_by(|a, b| {
        a.0.is_none()
            .cmp(&b.0.is_none())
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });
    for (slot, (_, _, url)) in slots.into_iter().zip(keyed) {
        images[slot] = url;
    }
}

/// `SKU_<digits>` with any of `-`, `_` or space accepted between the SKU's
/// parts, case-insensitive.
fn sku_anchored_pattern(sku: &str) -> Option<Regex> {
    let sku = sku.trim();
    if sku.is_empty() {
        return None;
    }
    let mut pattern = String::from("(?i)");
    for ch in sku.chars() {
        if matches!(ch, '-' | '_' | ' ') {
            pattern.push_str("[-_ ]");
        } else {
            pattern.push_str(&regex::escape(&ch.to_string()));
        }
    }
    pattern.push_str(r"_([0-9]+)");
    Regex::new(&pattern).ok()
}

/// Numeric suffix of a URL: the SKU-anchored form first, then the last
/// `_<digits>` group anywhere in the URL.
pub fn numeric_suffix(url: &str, sku: &str) -> Option<u64> {
    extract_suffix(url, sku_anchored_pattern(sku).as_ref())
}

fn extract_suffix(url: &str, anchored: Option<&Regex>) -> Option<u64> {
    if let Some(captures) = anchored.and_then(|re| re.captures(url)) {
        return captures.get(1).and_then(|m| m.as_str().parse().ok());
    }
    UNDERSCORE_DIGITS
        .captures_iter(url)
        .last()
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
