//! Wires the sled-backed store and the local adapters together
use super::adapters::{ChainedLedger, FsBlobStore, OutboxNotifier};
use super::config::Config;
use super::service::RequestService;
use super::store::SledRowStore;
use super::workflow::CompletionWorkflow;
use anyhow::Context;
use std::sync::Arc;

pub struct Konek {
    pub requests: RequestService,
    pub workflow: CompletionWorkflow,
    pub ledger: ChainedLedger,
    pub outbox: OutboxNotifier,
    db: Arc<sled::Db>,
}

impl Konek {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        let db = sled::open(config.database_path())
            .with_context(|| format!("opening {}", config.database_path().display()))?;
        let db = Arc::new(db);

        let store = SledRowStore::new(db.clone())?;
        let ledger = ChainedLedger::new(&db)?;
        let outbox = OutboxNotifier::new(db.clone())?;
        let blobs = FsBlobStore::new(&config.blobs.root, config.blobs.public_base_url.clone());

        let requests = RequestService::new(Arc::new(store));
        let workflow = CompletionWorkflow::new(
            requests.clone(),
            Arc::new(blobs),
            Arc::new(ledger.clone()),
            Arc::new(outbox.clone()),
            config.workflow(),
        );
        tracing::info!(path = %config.database_path().display(), "konek opened");

        Ok(Self {
            requests,
            workflow,
            ledger,
            outbox,
            db,
        })
    }

    /// Flushes sled to disk.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
