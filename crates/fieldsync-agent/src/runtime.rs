//! Agent runtime orchestration.
//!
//! Each pass imports every envelope waiting in the inbox, then exports the
//! ledger changes observed since the last export to the outbox. Imported
//! files are moved to `processed/` or, if they do not decode, to `failed/`.

use crate::config::{AgentConfig, StoreKind};
use crate::persistence::SqliteStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fieldsync_core::{
    AggregateRegistry, Cancellation, ChangeLedger, ClockStateStore, DeltaCaptureService,
    MemoryStore, RecordStore, SiteIdentity,
};
use fieldsync_proto::{TransportAdapter, TransportError, TransportResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

const PROCESSED_DIR: &str = "processed";
const FAILED_DIR: &str = "failed";

/// Tally of one inbox scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Envelopes imported
    pub imported: Vec<TransportResult>,
    /// Files moved to `failed/`
    pub rejected: usize,
    /// The scan stopped on cancellation
    pub cancelled: bool,
}

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    service: Arc<DeltaCaptureService>,
    adapter: TransportAdapter,
    sqlite: Option<Arc<SqliteStore>>,
    watermark: DateTime<Utc>,
}

impl Agent {
    /// Create a new agent, opening its store and exchange directories.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let site = SiteIdentity::new(config.site_id.as_str(), config.device_id.clone());
        let registry = AggregateRegistry::with_defaults();

        let (service, sqlite) = match config.persistence.store {
            StoreKind::Sqlite => {
                let store = Arc::new(
                    SqliteStore::open(&config.persistence.db_path)
                        .context("Failed to open SQLite database")?,
                );
                let service = build_service(site, store.clone(), registry);
                (service, Some(store))
            }
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                (build_service(site, store, registry), None)
            }
        };
        let service = Arc::new(service);

        let mut watermark = config
            .exchange
            .export_since
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some(store) = &sqlite {
            if let Some(saved) = store
                .load_watermark()
                .await
                .context("Failed to load export watermark")?
            {
                watermark = saved;
            }

            let (ledger_rows, clock_rows) = store.counts().await?;
            if clock_rows == 0 && ledger_rows > 0 {
                tracing::warn!(ledger_rows, "Clock index empty, rebuilding from ledger");
                service
                    .rebuild_clock_index()
                    .await
                    .context("Failed to rebuild clock index")?;
            }
        }

        for dir in [
            config.exchange.inbox_dir.clone(),
            config.exchange.inbox_dir.join(PROCESSED_DIR),
            config.exchange.inbox_dir.join(FAILED_DIR),
            config.exchange.outbox_dir.clone(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let adapter = TransportAdapter::new(service.clone(), config.exchange.wire_format);

        tracing::info!(
            site = %config.site_id,
            store = ?config.persistence.store,
            format = %config.exchange.wire_format,
            watermark = %watermark,
            "Agent initialized"
        );

        Ok(Self {
            config,
            service,
            adapter,
            sqlite,
            watermark,
        })
    }

    /// The capture/apply service.
    #[must_use]
    pub fn service(&self) -> &Arc<DeltaCaptureService> {
        &self.service
    }

    /// The current export watermark.
    #[must_use]
    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    /// Export changes since the watermark into a new outbox file.
    ///
    /// Returns the file written, or `None` if there was nothing to export.
    /// The watermark advances to the start of this export, so a change
    /// landing mid-export is exported again next time.
    ///
    /// # Errors
    ///
    /// Returns error if capture, encoding, or the file write fails.
    pub async fn export_once(&mut self) -> Result<Option<PathBuf>> {
        let started = Utc::now();
        let envelope = self
            .adapter
            .export_envelope(self.watermark)
            .await
            .context("Failed to capture local changes")?;

        let written = if envelope.deltas.is_empty() {
            tracing::debug!(since = %self.watermark, "Nothing to export");
            None
        } else {
            let format = self.adapter.format();
            let payload = envelope.encode(format)?;
            let name = format!(
                "{}-{}.{}",
                self.config.site_id,
                started.format("%Y%m%dT%H%M%S%6fZ"),
                format.extension()
            );
            let path = self.config.exchange.outbox_dir.join(name);
            write_atomically(&path, &payload).await?;
            tracing::info!(
                path = %path.display(),
                deltas = envelope.deltas.len(),
                "Exported envelope"
            );
            Some(path)
        };

        self.watermark = started;
        if let Some(store) = &self.sqlite {
            store
                .save_watermark(started)
                .await
                .context("Failed to persist export watermark")?;
        }
        Ok(written)
    }

    /// Import every envelope in the inbox, oldest file name first.
    ///
    /// # Errors
    ///
    /// Returns error if the inbox cannot be read or a triage write fails.
    /// The file being imported is then left in place for the next pass.
    pub async fn import_once(&self, cancel: &Cancellation) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        for path in inbox_files(&self.config.exchange.inbox_dir).await? {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let payload = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;

            match self.adapter.import_until(&payload, cancel).await {
                Ok(result) if result.cancelled => {
                    tracing::info!(
                        path = %path.display(),
                        status = %result.status,
                        "Import interrupted"
                    );
                    summary.imported.push(result);
                    summary.cancelled = true;
                    break;
                }
                Ok(result) => {
                    tracing::info!(
                        path = %path.display(),
                        status = %result.status,
                        "Imported envelope"
                    );
                    move_into(&path, PROCESSED_DIR).await?;
                    summary.imported.push(result);
                }
                Err(TransportError::Envelope(err)) => {
                    tracing::warn!(path = %path.display(), error = %err, "Rejected envelope");
                    move_into(&path, FAILED_DIR).await?;
                    summary.rejected += 1;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to import {}", path.display()));
                }
            }
        }

        Ok(summary)
    }

    /// Run sync passes until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if a sync pass fails.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            interval_secs = self.config.exchange.interval.as_secs(),
            inbox = %self.config.exchange.inbox_dir.display(),
            outbox = %self.config.exchange.outbox_dir.display(),
            "Agent running, press Ctrl+C to stop"
        );

        let (_shutdown_tx, mut shutdown_rx) = shutdown_on(tokio::signal::ctrl_c());
        let cancel = Cancellation::from_watch(shutdown_rx.clone());

        let mut ticker = tokio::time::interval(self.config.exchange.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.import_once(&cancel).await?;
                    if summary.cancelled {
                        break;
                    }
                    self.export_once().await?;
                }

                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        let triage = self.service.triage_summary().await?;
        tracing::info!(
            triage_total = triage.total,
            triage_warning = triage.warning,
            "Agent stopped"
        );
        Ok(())
    }
}

fn build_service<S>(
    site: SiteIdentity,
    store: Arc<S>,
    registry: AggregateRegistry,
) -> DeltaCaptureService
where
    S: ChangeLedger + ClockStateStore + RecordStore + 'static,
{
    DeltaCaptureService::new(site, store.clone(), store.clone(), store, registry)
}

/// Shutdown channel flipped to `true` once `signal` completes.
///
/// The sender is returned so the channel stays open if the signal cannot be
/// listened for; the agent then runs until killed.
fn shutdown_on<F>(signal: F) -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>)
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let notifier = tx.clone();
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                notifier.send_replace(true);
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        }
    });
    (tx, rx)
}

async fn inbox_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read inbox {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_envelope = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "json" | "cbor"));
        if is_envelope && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn move_into(path: &Path, subdir: &str) -> Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let target = parent.join(subdir).join(name);
    tokio::fs::rename(path, &target)
        .await
        .with_context(|| format!("Failed to move {} to {}", path.display(), target.display()))
}

async fn write_atomically(path: &Path, payload: &[u8]) -> Result<()> {
    let partial = path.with_extension("partial");
    tokio::fs::write(&partial, payload)
        .await
        .with_context(|| format!("Failed to write {}", partial.display()))?;
    tokio::fs::rename(&partial, path)
        .await
        .with_context(|| format!("Failed to finalize {}", path.display()))
}
