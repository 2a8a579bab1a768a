//! Streaming read/write pipeline.
//!
//! The read stage pulls rows from the source iterator into fixed-size
//! batches and sends them over a bounded channel; the write stage projects
//! each row, accumulates records, and flushes them to the destination
//! behind a token-bucket limiter. Both stages run in one `JoinSet`: the
//! first failure cancels and aborts the other.

use std::sync::Arc;
use std::time::Duration;

use outflow_types::error::ConnectorError;
use outflow_types::model::{FieldMapping, Object, SyncMode};
use outflow_types::schema::{Record, Row};
use outflow_types::state::RunId;
use outflow_warehouse::{
    unsupported, BatchEnvelope, LoadMode, StagingOptions, WarehouseClient,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cursor;
use crate::errors::SyncError;
use crate::projector::{self, FieldsById};
use crate::rate_limiter::{RateLimitConfig, TokenBucketRateLimiter};
use crate::staging::CsvLayout;

/// Batching, backpressure, and rate-limit settings for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub read_batch_size: usize,
    pub write_batch_size: usize,
    /// Batches buffered between the stages; at least 1.
    pub channel_capacity: usize,
    pub rate_limit: RateLimitConfig,
    /// How long a run stays owned without a heartbeat before another
    /// execution may take it over.
    pub run_lease: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            read_batch_size: 1_000,
            write_batch_size: 1_000,
            channel_capacity: 4,
            rate_limit: RateLimitConfig::unlimited(),
            run_lease: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Read stage
// ---------------------------------------------------------------------------

/// A rendered source query plus the column the cursor is taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    pub query: String,
    /// Set for incremental modes only.
    pub cursor_field: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutput {
    pub rows_read: u64,
    pub batches: u64,
    /// Position after the last row read; `None` leaves the stored cursor as is.
    pub cursor: Option<String>,
}

/// Stream the query result into `tx` in batches of `batch_size` rows.
///
/// # Errors
///
/// Returns the client's error, [`SyncError::Cancelled`] when `cancel`
/// fires, or a schema error when the cursor column is missing.
pub async fn read(
    client: &dyn WarehouseClient,
    plan: &ReadPlan,
    batch_size: usize,
    tx: mpsc::Sender<Vec<Row>>,
    cancel: &CancellationToken,
) -> Result<ReadOutput, SyncError> {
    let batch_size = batch_size.max(1);
    let mut rows = client.get_query_iterator(&plan.query).await?;
    let mut output = ReadOutput::default();
    let mut batch = Vec::with_capacity(batch_size);
    let mut last_row: Option<Row> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let Some(row) = rows.next_row().await? else {
            break;
        };
        batch.push(row);
        output.rows_read += 1;

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            last_row = full.last().cloned();
            send_batch(&tx, full, cancel).await?;
            output.batches += 1;
        }
    }

    if !batch.is_empty() {
        last_row = batch.last().cloned();
        send_batch(&tx, batch, cancel).await?;
        output.batches += 1;
    }

    if let Some(field) = &plan.cursor_field {
        output.cursor = cursor::next_cursor(rows.schema(), field, last_row.as_ref())?;
    }
    tracing::debug!(
        rows_read = output.rows_read,
        batches = output.batches,
        "Read stage finished"
    );
    Ok(output)
}

async fn send_batch(
    tx: &mpsc::Sender<Vec<Row>>,
    batch: Vec<Row>,
    cancel: &CancellationToken,
) -> Result<(), SyncError> {
    // A closed channel means the write stage already stopped with its own error.
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SyncError::Cancelled),
        sent = tx.send(batch) => sent.map_err(|_| SyncError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Write stage
// ---------------------------------------------------------------------------

/// Everything the write stage needs to know about the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub run_id: RunId,
    pub object: Object,
    pub mappings: Vec<FieldMapping>,
    pub end_customer_id: i64,
    pub sync_mode: SyncMode,
    pub staging_bucket: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutput {
    pub rows_written: u64,
    pub flushes: u64,
}

enum Flusher {
    Staged {
        bucket: String,
        layout: CsvLayout,
        truncate_pending: bool,
    },
    Direct,
}

impl Flusher {
    fn for_destination(client: &dyn WarehouseClient, plan: &WritePlan) -> Result<Self, SyncError> {
        if client.staging().is_some() {
            let bucket = plan.staging_bucket.clone().ok_or_else(|| {
                ConnectorError::config(
                    "STAGING_BUCKET_MISSING",
                    format!(
                        "{} destinations need a staging bucket",
                        client.connection_type()
                    ),
                )
            })?;
            return Ok(Self::Staged {
                bucket,
                layout: CsvLayout::for_object(&plan.object),
                truncate_pending: plan.sync_mode == SyncMode::FullOverwrite,
            });
        }
        if client.direct_writer().is_some() {
            return Ok(Self::Direct);
        }
        Err(unsupported(client.connection_type(), "writes").into())
    }
}

struct Writer<'a> {
    client: &'a dyn WarehouseClient,
    plan: &'a WritePlan,
    flusher: Flusher,
    limiter: &'a TokenBucketRateLimiter,
    output: WriteOutput,
}

impl Writer<'_> {
    async fn flush(&mut self, records: &[Record]) -> Result<(), SyncError> {
        self.limiter.acquire().await;
        let plan = self.plan;
        match &mut self.flusher {
            Flusher::Direct => {
                let writer = self
                    .client
                    .direct_writer()
                    .ok_or_else(|| unsupported(self.client.connection_type(), "direct writes"))?;
                writer
                    .send_batch(&BatchEnvelope {
                        object_name: &plan.object.name,
                        end_customer_id: plan.end_customer_id,
                        data: records,
                    })
                    .await?;
            }
            Flusher::Staged {
                bucket,
                layout,
                truncate_pending,
            } => {
                let staging = self
                    .client
                    .staging()
                    .ok_or_else(|| unsupported(self.client.connection_type(), "staging"))?;
                let opts = StagingOptions {
                    bucket: bucket.clone(),
                    object_key: format!(
                        "outflow/{}/{}/run-{}-{:05}.csv",
                        plan.object.namespace,
                        plan.object.table_name,
                        plan.run_id,
                        self.output.flushes
                    ),
                    columns: layout.column_names(),
                    load_mode: if *truncate_pending {
                        LoadMode::Truncate
                    } else {
                        LoadMode::Append
                    },
                };
                let csv = layout.encode(records, plan.end_customer_id)?;
                staging.stage_data(csv, &opts).await?;
                let loaded = staging
                    .load_from_staging(&plan.object.namespace, &plan.object.table_name, &opts)
                    .await;
                if let Err(e) = staging.clean_up_staging_data(&opts).await {
                    tracing::warn!(
                        object_key = %opts.object_key,
                        error = %e,
                        "Failed to clean up staged file"
                    );
                }
                loaded?;
                *truncate_pending = false;
            }
        }

        self.output.flushes += 1;
        self.output.rows_written += records.len() as u64;
        tracing::debug!(
            rows = records.len(),
            rows_written = self.output.rows_written,
            "Flushed batch"
        );
        Ok(())
    }
}

/// Consume batches until the channel closes, projecting and flushing.
///
/// In `FullOverwrite` only the first flush truncates; an overwrite that read
/// no rows still loads an empty file so the destination ends up empty.
///
/// # Errors
///
/// Returns the first projection or destination error, or
/// [`SyncError::Cancelled`] when `cancel` fires.
pub async fn write(
    client: &dyn WarehouseClient,
    plan: &WritePlan,
    mut rx: mpsc::Receiver<Vec<Row>>,
    limiter: &TokenBucketRateLimiter,
    cancel: &CancellationToken,
) -> Result<WriteOutput, SyncError> {
    let batch_size = plan.batch_size.max(1);
    let fields: FieldsById<'_> = projector::fields_by_id(&plan.object);
    let mut writer = Writer {
        client,
        plan,
        flusher: Flusher::for_destination(client, plan)?,
        limiter,
        output: WriteOutput::default(),
    };
    let mut pending: Vec<Record> = Vec::with_capacity(batch_size);

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::Cancelled),
            batch = rx.recv() => batch,
        };
        let Some(rows) = batch else {
            break;
        };
        for row in &rows {
            pending.push(projector::project(row, &plan.mappings, &fields)?);
            if pending.len() >= batch_size {
                writer.flush(&pending).await?;
                pending.clear();
            }
        }
    }

    // A closed channel after a cancelled read must not commit a partial batch.
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let overwrite_unflushed = matches!(
        writer.flusher,
        Flusher::Staged {
            truncate_pending: true,
            ..
        }
    );
    if !pending.is_empty() || overwrite_unflushed {
        writer.flush(&pending).await?;
    }
    Ok(writer.output)
}

// ---------------------------------------------------------------------------
// Both stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutput {
    pub rows_read: u64,
    pub rows_written: u64,
    pub cursor: Option<String>,
}

enum StageOutput {
    Read(ReadOutput),
    Write(WriteOutput),
}

/// Run the read and write stages concurrently.
///
/// # Errors
///
/// Returns the first stage error. Panics in a stage surface as
/// [`SyncError::Infrastructure`].
pub async fn run_pipeline(
    source: Arc<dyn WarehouseClient>,
    destination: Arc<dyn WarehouseClient>,
    read_plan: ReadPlan,
    write_plan: WritePlan,
    options: &PipelineOptions,
    cancel: &CancellationToken,
) -> Result<PipelineOutput, SyncError> {
    let (tx, rx) = mpsc::channel::<Vec<Row>>(options.channel_capacity.max(1));
    let stages = cancel.child_token();
    let limiter = Arc::new(TokenBucketRateLimiter::new(options.rate_limit.clone()));
    let mut join_set: JoinSet<Result<StageOutput, SyncError>> = JoinSet::new();

    {
        let stages = stages.clone();
        let batch_size = options.read_batch_size;
        join_set.spawn(async move {
            let result = read(source.as_ref(), &read_plan, batch_size, tx, &stages).await;
            if result.is_err() {
                stages.cancel();
            }
            result.map(StageOutput::Read)
        });
    }
    {
        let stages = stages.clone();
        join_set.spawn(async move {
            let result = write(destination.as_ref(), &write_plan, rx, &limiter, &stages).await;
            if result.is_err() {
                stages.cancel();
            }
            result.map(StageOutput::Write)
        });
    }

    let mut output = PipelineOutput::default();
    let mut first_error: Option<SyncError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(StageOutput::Read(r))) => {
                output.rows_read = r.rows_read;
                output.cursor = r.cursor;
            }
            Ok(Ok(StageOutput::Write(w))) => output.rows_written = w.rows_written,
            Ok(Err(error)) => {
                // A sibling's Cancelled is a consequence of the first error.
                let replace = match (&first_error, &error) {
                    (None, _) => true,
                    (Some(SyncError::Cancelled), e) => !matches!(e, SyncError::Cancelled),
                    _ => false,
                };
                if replace {
                    if !matches!(error, SyncError::Cancelled) {
                        tracing::error!(error = %error, "Pipeline stage failed");
                    }
                    first_error = Some(error);
                    stages.cancel();
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {}
            Err(join_err) => {
                stages.cancel();
                join_set.abort_all();
                return Err(SyncError::Infrastructure(anyhow::anyhow!(
                    "pipeline stage panicked: {join_err}"
                )));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(output),
    }
}
