use super::{
    PipelineRunner, RunOptions,
    collector::{CollectorExit, StageFailure},
};
use crate::{
    catalog::{CatalogError, CatalogStore, normalize_sku},
    curation::{Selection, curate, review_entries},
    merge::{
        Collected, MergeReport, ScrapeError, ScrapeRow, parse_source_json, parse_tsv,
    },
};
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    time::Instant,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) enum Flow<T> {
    Continue(T),
    Cancelled,
}

macro_rules! proceed {
    ($flow:expr) => {
        match $flow {
            Flow::Continue(value) => value,
            Flow::Cancelled => return Ok(Flow::Cancelled),
        }
    };
}

/// Writes the SKU list the collector reads, one per line.
pub(super) async fn prepare(skus_path: &Path, skus: &[String]) -> io::Result<()> {
    if let Some(parent) = skus_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = skus.join("\n");
    body.push('\n');
    tokio::fs::write(skus_path, body).await
}

pub(super) async fn run_stages(
    runner: &PipelineRunner,
    skus: &[String],
    options: RunOptions,
    cancel: &CancellationToken,
) -> Result<Flow<()>, StageFailure> {
    if cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }
    proceed!(timed("collect", collect(runner, cancel)).await?);

    if cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }
    // Held from the catalog load until the refined catalog is saved.
    let writer = runner.lock_catalog().await;
    let store = proceed!(timed("merge", merge(runner, skus, cancel)).await?);
    if cancel.is_cancelled() {
        drop(writer);
        publish(runner, skus, &store).await;
        return Ok(Flow::Cancelled);
    }

    let store = timed("refine", refine(runner, store)).await?;
    drop(writer);
    publish(runner, skus, &store).await;
    if !options.upload || cancel.is_cancelled() {
        return Ok(if cancel.is_cancelled() {
            Flow::Cancelled
        } else {
            Flow::Continue(())
        });
    }

    let store = if options.require_review {
        proceed!(await_curation(runner, skus, cancel).await?)
    } else {
        store
    };
    if cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    timed("upload", upload(runner, skus, &store, cancel)).await?;
    if cancel.is_cancelled() {
        return Ok(Flow::Cancelled);
    }
    Ok(Flow::Continue(()))
}

async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> Result<T, StageFailure>
where
    Fut: Future<Output = Result<T, StageFailure>>,
{
    let started = Instant::now();
    let outcome = fut.await;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(stage, elapsed_ms);
    debug!(
        target = "catalog.pipeline",
        stage,
        elapsed_ms = elapsed_ms as u64,
        ok = outcome.is_ok(),
        "stage complete"
    );
    outcome
}

async fn collect(
    runner: &PipelineRunner,
    cancel: &CancellationToken,
) -> Result<Flow<()>, StageFailure> {
    runner.append_log("Starting collectors...").await;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let collector = runner.collector();
    let work_dir = runner.settings().work_dir.clone();
    let token = cancel.clone();
    let mut handle = tokio::spawn(async move { collector.run(&work_dir, tx, token).await });

    let joined = loop {
        tokio::select! {
            biased;
            Some(line) = rx.recv() => runner.append_log(line).await,
            joined = &mut handle => break joined,
        }
    };
    while let Ok(line) = rx.try_recv() {
        runner.append_log(line).await;
    }

    match joined {
        Err(err) => Err(StageFailure::stage("collect", err.to_string())),
        Ok(Ok(CollectorExit::Completed)) => {
            runner.append_log("Collectors completed successfully.").await;
            Ok(Flow::Continue(()))
        }
        Ok(Ok(CollectorExit::Cancelled)) => Ok(Flow::Cancelled),
        Ok(Err(failure)) => Err(failure),
    }
}

struct CollectorOutput {
    rows: IndexMap<String, Vec<ScrapeRow>>,
    collected: IndexMap<String, Vec<(String, String, Result<Collected, ScrapeError>)>>,
    malformed_rows: usize,
}

async fn read_collector_output(
    runner: &PipelineRunner,
    tsv_path: &Path,
    sources_dir: &Path,
) -> Result<CollectorOutput, StageFailure> {
    let mut output = CollectorOutput {
        rows: IndexMap::new(),
        collected: IndexMap::new(),
        malformed_rows: 0,
    };

    match tokio::fs::read(tsv_path).await {
        Ok(bytes) => {
            let parsed = parse_tsv(&String::from_utf8_lossy(&bytes), "product_images");
            output.malformed_rows = parsed.skipped;
            for row in parsed.rows {
                output
                    .rows
                    .entry(normalize_sku(&row.sku))
                    .or_default()
                    .push(row);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            runner
                .append_log(format!("No collector rows found at {}.", tsv_path.display()))
                .await;
        }
        Err(err) => return Err(StageFailure::stage("merge", err.to_string())),
    }

    for path in source_files(sources_dir).await? {
        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| StageFailure::stage("merge", err.to_string()));
        let batch = text.and_then(|text| {
            parse_source_json(&text, &label)
                .map_err(|err| StageFailure::stage("merge", err.to_string()))
        });
        match batch {
            Ok(batch) => {
                for (sku, result) in batch.entries {
                    output
                        .collected
                        .entry(normalize_sku(&sku))
                        .or_default()
                        .push((batch.source_label.clone(), sku, result));
                }
            }
            Err(err) => {
                warn!(target = "catalog.merge", source = %label, error = %err, "source output skipped");
                runner
                    .append_log(format!("Skipping source {label}: {err}"))
                    .await;
            }
        }
    }
    Ok(output)
}

async fn source_files(dir: &Path) -> Result<Vec<PathBuf>, StageFailure> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StageFailure::stage("merge", err.to_string())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StageFailure::stage("merge", err.to_string()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Folds collector output into the catalog SKU by SKU. On cancellation the
/// SKUs merged so far are scrubbed, persisted and published. The caller holds
/// the catalog writer.
async fn merge(
    runner: &PipelineRunner,
    skus: &[String],
    cancel: &CancellationToken,
) -> Result<Flow<CatalogStore>, StageFailure> {
    runner.append_log("Merging collector output into the catalog...").await;
    let settings = runner.settings();
    let catalog = runner.catalog().clone();
    let mut store = blocking("merge", move || Ok(catalog.load())).await?;
    let mut output =
        read_collector_output(runner, &settings.tsv_path(), &settings.sources_dir()).await?;
    let engine = runner.merge_engine();
    let mut report = MergeReport {
        malformed_rows: output.malformed_rows,
        ..MergeReport::default()
    };

    for (idx, sku) in skus.iter().enumerate() {
        if cancel.is_cancelled() {
            runner
                .append_log(format!(
                    "Merge stopped after {idx} of {} SKU(s).",
                    skus.len()
                ))
                .await;
            let scrubbed = engine.scrub_banned(&mut store);
            if scrubbed > 0 {
                runner
                    .append_log(format!("Removed {scrubbed} banned image(s)."))
                    .await;
            }
            let store = persist(runner, "merge", store).await?;
            publish(runner, &skus[..idx], &store).await;
            return Ok(Flow::Cancelled);
        }
        let key = normalize_sku(sku);
        if let Some(rows) = output.rows.shift_remove(&key) {
            report.absorb(&engine.ingest(&mut store, &rows));
        }
        if let Some(entries) = output.collected.shift_remove(&key) {
            for (label, raw_sku, result) in &entries {
                report.absorb(&engine.ingest_collected(&mut store, label, raw_sku, result));
            }
        }
        runner.set_progress(idx + 1).await;
        tokio::task::yield_now().await;
    }

    // Rows for SKUs outside this run still belong in the catalog.
    for rows in output.rows.values() {
        report.absorb(&engine.ingest(&mut store, rows));
    }
    for entries in output.collected.values() {
        for (label, raw_sku, result) in entries {
            report.absorb(&engine.ingest_collected(&mut store, label, raw_sku, result));
        }
    }
    let scrubbed = engine.scrub_banned(&mut store);
    crate::metrics::merge_rows(report.added, report.malformed_rows + report.banned);

    runner
        .append_log(format!(
            "Merged {} row(s): {} new image(s), {} duplicate(s), {} banned, {} malformed, {} collector error(s), {} new SKU(s).",
            report.rows_seen,
            report.added,
            report.duplicates,
            report.banned + scrubbed,
            report.malformed_rows,
            report.scrape_errors,
            report.new_records,
        ))
        .await;
    info!(target = "catalog.merge", report = ?report, scrubbed, "merge complete");
    let store = persist(runner, "merge", store).await?;
    Ok(Flow::Continue(store))
}

async fn refine(
    runner: &PipelineRunner,
    mut store: CatalogStore,
) -> Result<CatalogStore, StageFailure> {
    let report = runner.merge_engine().refine(&mut store);
    runner
        .append_log(format!(
            "Refined catalog: {} foreign image(s) dropped, {} SKU(s) reordered.",
            report.dropped, report.reordered
        ))
        .await;
    if report.dropped == 0 && report.reordered == 0 {
        return Ok(store);
    }
    persist(runner, "refine", store).await
}

/// Publishes the run's records and a short per-SKU summary.
async fn publish(runner: &PipelineRunner, skus: &[String], store: &CatalogStore) {
    let records = review_entries(store, skus);
    let limit = runner.settings().summary_limit;
    runner.append_log("--- Results summary ---").await;
    for record in records.iter().take(limit) {
        runner
            .append_log(format!("{}: {} image(s)", record.sku, record.images.len()))
            .await;
    }
    if records.len() > limit {
        runner
            .append_log(format!("... and {} more SKU(s)", records.len() - limit))
            .await;
    }
    let missing = skus.len().saturating_sub(records.len());
    if missing > 0 {
        runner
            .append_log(format!("{missing} SKU(s) produced no images."))
            .await;
    }
    runner.publish_results(records).await;
}

async fn await_curation(
    runner: &PipelineRunner,
    skus: &[String],
    cancel: &CancellationToken,
) -> Result<Flow<CatalogStore>, StageFailure> {
    let (tx, rx) = oneshot::channel::<HashMap<String, Selection>>();
    runner.open_curation_gate(tx).await;
    runner
        .append_log(format!(
            "Awaiting curation for {} SKU(s); submit selections to continue.",
            skus.len()
        ))
        .await;

    let selections = tokio::select! {
        received = rx => received.map_err(|_| StageFailure::stage("await_curation", "curation gate closed"))?,
        _ = cancel.cancelled() => {
            runner.close_curation_gate().await;
            return Ok(Flow::Cancelled);
        }
    };

    let _writer = runner.lock_catalog().await;
    let catalog = runner.catalog().clone();
    let (outcome, store) = blocking("await_curation", move || {
        let outcome = curate(&catalog, &selections)?;
        Ok((outcome, catalog.read()?))
    })
    .await?;
    let message = if outcome.changed {
        format!(
            "Curation applied: {} SKU(s) dropped, {} SKU(s) edited.",
            outcome.dropped, outcome.replaced
        )
    } else {
        "Curation left the catalog unchanged.".to_string()
    };
    runner.append_log(message).await;
    if let Some(backup) = outcome.backup {
        runner
            .append_log(format!("Backed up previous catalog to {}.", backup.display()))
            .await;
    }
    Ok(Flow::Continue(store))
}

async fn upload(
    runner: &PipelineRunner,
    skus: &[String],
    store: &CatalogStore,
    cancel: &CancellationToken,
) -> Result<(), StageFailure> {
    let Some(engine) = runner.uploader() else {
        runner
            .append_log("Uploads are not configured; skipping upload stage.")
            .await;
        return Ok(());
    };
    let records = review_entries(store, skus);
    let plan = engine.plan(&records);
    runner
        .append_log(format!(
            "Uploading {} image(s) for {} SKU(s) ({} over the per-SKU cap, {} SKU(s) ignored).",
            plan.jobs.len(),
            records.len() - plan.ignored,
            plan.truncated,
            plan.ignored
        ))
        .await;

    let results = engine.run(plan.jobs, Some(cancel)).await;
    let succeeded = results.iter().filter(|result| result.is_success()).count();
    let failed = results.len() - succeeded;
    runner
        .append_log(format!(
            "Upload finished: {succeeded} succeeded, {failed} failed."
        ))
        .await;
    let limit = runner.settings().summary_limit;
    for result in results.iter().filter(|result| !result.is_success()).take(limit) {
        if let crate::upload::UploadOutcome::Failure { reason } = &result.outcome {
            runner
                .append_log(format!(
                    "Upload failed for {} #{}: {reason}",
                    result.job.sku, result.job.index
                ))
                .await;
        }
    }
    Ok(())
}

async fn persist(
    runner: &PipelineRunner,
    stage: &'static str,
    store: CatalogStore,
) -> Result<CatalogStore, StageFailure> {
    let catalog = runner.catalog().clone();
    let (store, backup) = blocking(stage, move || {
        let backup = catalog.persist(&store)?;
        Ok((store, backup))
    })
    .await?;
    runner
        .append_log(format!(
            "Catalog saved with {} SKU(s) and {} image(s).",
            store.len(),
            store.total_images()
        ))
        .await;
    if let Some(backup) = backup {
        debug!(target = "catalog.store", backup = %backup.display(), "catalog backed up");
    }
    Ok(store)
}

async fn blocking<T, F>(stage: &'static str, work: F) -> Result<T, StageFailure>
where
    F: FnOnce() -> Result<T, CatalogError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StageFailure::stage(stage, err.to_string()))?
        .map_err(|err| StageFailure::stage(stage, err.to_string()))
}
