//! Infrastructure wiring: stores, router, consumers, query service.
//!
//! Backends are chosen at startup: `DATABASE_URL` set wires Postgres, absent
//! wires in-memory (dev). Dependencies are passed explicitly — no global
//! registry.

use std::sync::{Arc, Mutex};

use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::{info, warn};

use billflow_core::{Clock, SystemClock};
use billflow_infra::adapters::{
    BlobStore, HttpOcrService, InMemoryBlobStore, Notifier, OcrService, RecordingNotifier,
    SmtpNotifier,
};
use billflow_infra::config::Config;
use billflow_infra::consumer::{ConsumerHandle, LogConsumer};
use billflow_infra::event_log::{EventLog, InMemoryEventLog, PostgresEventLog};
use billflow_infra::projections::{
    BILL_FILES, BILL_SUMMARY, BillFilesProjection, BillSummaryProjection,
};
use billflow_infra::query::QueryService;
use billflow_infra::reactive::{NOTIFIER, NotificationHandler, OCR_ORCHESTRATOR, OcrOrchestrator};
use billflow_infra::read_model::{InMemoryReadModelStore, PostgresReadModelStore, ReadModelStore};
use billflow_infra::router::CommandRouter;

pub struct AppServices {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub blob: Arc<dyn BlobStore>,
    pub router: Arc<CommandRouter<Arc<dyn EventLog>>>,
    pub query: QueryService<Arc<dyn ReadModelStore>, Arc<dyn BlobStore>>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl AppServices {
    /// Stop all consumer threads. Called on graceful shutdown paths; letting
    /// the process exit without it is also fine (daemon threads).
    pub fn shutdown_consumers(&self) {
        let handles = match self.consumers.lock() {
            Ok(mut guard) => guard.drain(..).collect::<Vec<_>>(),
            Err(_) => return,
        };
        for handle in handles {
            handle.shutdown();
        }
    }
}

pub async fn build_services(config: Config) -> anyhow::Result<AppServices> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new(
        config.blob.public_base_url.clone(),
        clock.clone(),
    ));

    let (log, store): (Arc<dyn EventLog>, Arc<dyn ReadModelStore>) = match &config.database_url {
        Some(url) => {
            info!("wiring postgres event log and read models");
            let pool = PgPoolOptions::new().max_connections(16).connect(url).await?;
            let log = PostgresEventLog::new(pool.clone(), Handle::current());
            log.ensure_schema().await?;
            let store = PostgresReadModelStore::new(pool, Handle::current());
            store.ensure_schema().await?;
            (Arc::new(log), Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; wiring in-memory stores");
            (
                Arc::new(InMemoryEventLog::new()),
                Arc::new(InMemoryReadModelStore::new()),
            )
        }
    };

    let router = Arc::new(CommandRouter::new(
        log.clone(),
        config.router.clone(),
        config.file_policy.clone(),
    ));

    let mut consumers = Vec::new();

    consumers.push(LogConsumer::spawn(
        log.clone(),
        store.clone(),
        BillSummaryProjection::new(store.clone()),
        config.consumer(BILL_SUMMARY),
    ));
    consumers.push(LogConsumer::spawn(
        log.clone(),
        store.clone(),
        BillFilesProjection::new(),
        config.consumer(BILL_FILES),
    ));

    match &config.ocr.endpoint {
        Some(endpoint) => {
            let ocr: Arc<dyn OcrService> =
                Arc::new(HttpOcrService::new(endpoint, config.ocr.timeout).map_err(
                    |e| anyhow::anyhow!("ocr client construction failed: {e}"),
                )?);
            consumers.push(LogConsumer::spawn(
                log.clone(),
                store.clone(),
                OcrOrchestrator::new(
                    log.clone(),
                    router.clone(),
                    blob.clone(),
                    ocr,
                    clock.clone(),
                    config.ocr.max_attempts,
                ),
                config.consumer(OCR_ORCHESTRATOR),
            ));
        }
        None => {
            warn!("OCR_ENDPOINT not set; ocr orchestration disabled, bills stay unprocessed");
        }
    }

    let notifier: Arc<dyn Notifier> = match &config.smtp.host {
        Some(host) => Arc::new(
            SmtpNotifier::new(host, config.smtp.port, &config.smtp.from, config.smtp.timeout)
                .map_err(|e| anyhow::anyhow!("smtp transport construction failed: {e}"))?,
        ),
        None => {
            warn!("SMTP_HOST not set; notifications are recorded in memory only");
            Arc::new(RecordingNotifier::new())
        }
    };
    consumers.push(LogConsumer::spawn(
        log.clone(),
        store.clone(),
        NotificationHandler::new(notifier, config.smtp.recipients.clone()),
        config.consumer(NOTIFIER),
    ));

    let query = QueryService::new(store, blob.clone(), config.blob.presign_ttl);

    Ok(AppServices {
        config,
        clock,
        blob,
        router,
        query,
        consumers: Mutex::new(consumers),
    })
}
