use serde::Deserialize;
use thiserror::Error;

/// One `(sku, url)` observation from a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRow {
    pub sku: String,
    pub source_label: String,
    pub url: String,
    pub name: Option<String>,
}

impl ScrapeRow {
    pub fn new(
        sku: impl Into<String>,
        source_label: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            sku: sku.into(),
            source_label: source_label.into(),
            url: url.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("expected 3 tab-separated fields, found {0}")]
    FieldCount(usize),
    #[error("row has an empty sku")]
    EmptySku,
    #[error("row has an empty url")]
    EmptyUrl,
}

/// What a collector found for one SKU on one source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collected {
    pub name: Option<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    #[error("collector reported failure: {0}")]
    Reported(String),
    #[error("collector output unreadable: {0}")]
    Malformed(String),
}

/// Per-source collector output: one result per SKU.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source_label: String,
    pub entries: Vec<(String, Result<Collected, ScrapeError>)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedRows {
    pub rows: Vec<ScrapeRow>,
    pub skipped: usize,
}

/// Parses a `sku<TAB>name<TAB>url` line.
pub fn parse_tsv_line(line: &str, source_label: &str) -> Result<ScrapeRow, RowError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    if fields.len() != 3 {
        return Err(RowError::FieldCount(fields.len()));
    }
    let sku = fields[0].trim();
    let name = fields[1].trim();
    let url = fields[2].trim();
    if sku.is_empty() {
        return Err(RowError::EmptySku);
    }
    if url.is_empty() {
        return Err(RowError::EmptyUrl);
    }
    Ok(ScrapeRow {
        sku: sku.to_string(),
        source_label: source_label.to_string(),
        url: url.to_string(),
        name: (!name.is_empty()).then(|| name.to_string()),
    })
}

/// Parses a whole TSV dump. Blank lines are ignored; malformed lines are
/// counted in `skipped`.
pub fn parse_tsv(text: &str, source_label: &str) -> ParsedRows {
    let mut parsed = ParsedRows::default();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match parse_tsv_line(line, source_label) {
            Ok(row) => parsed.rows.push(row),
            Err(_) => parsed.skipped += 1,
        }
    }
    parsed
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    #[serde(default)]
    sku: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parses per-source JSON: `[{"sku", "name"?, "images": [...]}` or
/// `{"sku", "error"}]`. Entries without a SKU are dropped.
pub fn parse_source_json(text: &str, source_label: &str) -> Result<SourceBatch, ScrapeError> {
    let raw: Vec<SourceEntry> =
        serde_json::from_str(text).map_err(|err| ScrapeError::Malformed(err.to_string()))?;
    let entries = raw
        .into_iter()
        .filter(|entry| !entry.sku.trim().is_empty())
        .map(|entry| {
            let sku = entry.sku.trim().to_string();
            let outcome = match entry.error {
                Some(message) => Err(ScrapeError::Reported(message)),
                None => Ok(Collected {
                    name: entry.name.filter(|name| !name.trim().is_empty()),
                    images: entry.images,
                }),
            };
            (sku, outcome)
        })
        .collect();
    Ok(SourceBatch {
        source_label: source_label.to_string(),
        entries,
    })
}
