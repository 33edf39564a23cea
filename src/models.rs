use crate::{
    catalog::{CatalogRecord, CatalogStore},
    curation::{CurationOutcome, Selection, selection_from_indexes},
    pipeline::RunOptions,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Either one string (possibly comma or newline separated) or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SkuInput {
    Single(String),
    Multiple(Vec<String>),
}

impl SkuInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            SkuInput::Single(raw) => vec![raw],
            SkuInput::Multiple(list) => list,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub skus: SkuInput,
    #[serde(flatten)]
    pub options: RunOptions,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: String,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Kept images for one SKU, as URLs or as positions in the stored list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Pick {
    Urls(Vec<String>),
    Indexes(Vec<usize>),
}

/// SKU to kept images; `null` or an empty list drops the SKU.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SelectionsRequest(pub HashMap<String, Option<Pick>>);

impl SelectionsRequest {
    /// Index picks are resolved against `store`; picks naming an unknown SKU
    /// or keeping every image in order are dropped from the result.
    pub fn resolve(self, store: &CatalogStore) -> HashMap<String, Selection> {
        self.0
            .into_iter()
            .filter_map(|(sku, pick)| {
                let selection = match pick {
                    None => Selection::Drop,
                    Some(Pick::Urls(urls)) if urls.is_empty() => Selection::Drop,
                    Some(Pick::Urls(urls)) => Selection::Keep(urls),
                    Some(Pick::Indexes(indexes)) => {
                        selection_from_indexes(store.get(&sku)?, &indexes)?
                    }
                };
                Some((sku, selection))
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct SelectionsResponse {
    #[serde(flatten)]
    pub outcome: CurationOutcome,
    pub skus: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogQuery {
    /// Comma separated SKUs; the whole catalog when absent.
    #[serde(default)]
    pub skus: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub records: Vec<CatalogRecord>,
    pub total_images: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadBatchRequest {
    /// Restricts the batch to these SKUs; the whole catalog when absent.
    #[serde(default)]
    pub skus: Option<SkuInput>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub results: IndexMap<String, Vec<String>>,
}
