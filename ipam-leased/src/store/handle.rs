use std::thread;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use shared::types::{AddressRecord, ServiceBinding};
use super::{AddressDb, AddressFilter, AddressStore, NewAddressRecord};

/// Commands sent to the store thread
pub enum StoreCommand {
    FindOne(AddressFilter, oneshot::Sender<Result<Option<AddressRecord>>>),
    FindMany(AddressFilter, oneshot::Sender<Result<Vec<AddressRecord>>>),
    Insert(NewAddressRecord, oneshot::Sender<Result<Option<AddressRecord>>>),
    ReplaceServices {
        id: i64,
        expected_revision: i64,
        services: Vec<ServiceBinding>,
        reply: oneshot::Sender<Result<bool>>,
    },
    ReplaceSecretAndServices {
        id: i64,
        expected_revision: i64,
        secret: String,
        services: Vec<ServiceBinding>,
        reply: oneshot::Sender<Result<bool>>,
    },
    PullExpired(DateTime<Utc>, oneshot::Sender<Result<u64>>),
    FindOrphans(oneshot::Sender<Result<Vec<AddressRecord>>>),
    DeleteOrphan {
        id: i64,
        expected_revision: i64,
        reply: oneshot::Sender<Result<bool>>,
    },
    FindUnstamped(oneshot::Sender<Result<Vec<AddressRecord>>>),
    MarkStamped(i64, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the thread that owns the SQLite connection. Commands are
/// executed one at a time, so each is atomic with respect to the others.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread with the given database
    pub fn spawn(db: AddressDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::FindOne(filter, reply) => {
                        let _ = reply.send(db.find_one(&filter));
                    }
                    StoreCommand::FindMany(filter, reply) => {
                        let _ = reply.send(db.find_many(&filter));
                    }
                    StoreCommand::Insert(record, reply) => {
                        let _ = reply.send(db.insert(&record));
                    }
                    StoreCommand::ReplaceServices { id, expected_revision, services, reply } => {
                        let _ = reply.send(db.replace_services(id, expected_revision, &services));
                    }
                    StoreCommand::ReplaceSecretAndServices { id, expected_revision, secret, services, reply } => {
                        let result = db.replace_secret_and_services(id, expected_revision, &secret, &services);
                        let _ = reply.send(result);
                    }
                    StoreCommand::PullExpired(now, reply) => {
                        let _ = reply.send(db.pull_expired_services(now));
                    }
                    StoreCommand::FindOrphans(reply) => {
                        let _ = reply.send(db.find_orphans());
                    }
                    StoreCommand::DeleteOrphan { id, expected_revision, reply } => {
                        let _ = reply.send(db.delete_orphan(id, expected_revision));
                    }
                    StoreCommand::FindUnstamped(reply) => {
                        let _ = reply.send(db.find_unstamped());
                    }
                    StoreCommand::MarkStamped(id, reply) => {
                        let _ = reply.send(db.mark_stamped(id));
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl AddressStore for StoreHandle {
    async fn find_one(&self, filter: AddressFilter) -> Result<Option<AddressRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::FindOne(filter, reply)).await?;
        rx.await?
    }

    async fn find_many(&self, filter: AddressFilter) -> Result<Vec<AddressRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::FindMany(filter, reply)).await?;
        rx.await?
    }

    async fn insert_one(&self, record: NewAddressRecord) -> Result<Option<AddressRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Insert(record, reply)).await?;
        rx.await?
    }

    async fn replace_services(
        &self,
        id: i64,
        expected_revision: i64,
        services: Vec<ServiceBinding>,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::ReplaceServices {
            id,
            expected_revision,
            services,
            reply,
        }).await?;
        rx.await?
    }

    async fn replace_secret_and_services(
        &self,
        id: i64,
        expected_revision: i64,
        secret: String,
        services: Vec<ServiceBinding>,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::ReplaceSecretAndServices {
            id,
            expected_revision,
            secret,
            services,
            reply,
        }).await?;
        rx.await?
    }

    async fn pull_expired_services(&self, now: DateTime<Utc>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::PullExpired(now, reply)).await?;
        rx.await?
    }

    async fn find_orphans(&self) -> Result<Vec<AddressRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::FindOrphans(reply)).await?;
        rx.await?
    }

    async fn delete_one(&self, id: i64, expected_revision: i64) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::DeleteOrphan {
            id,
            expected_revision,
            reply,
        }).await?;
        rx.await?
    }

    async fn find_unstamped(&self) -> Result<Vec<AddressRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::FindUnstamped(reply)).await?;
        rx.await?
    }

    async fn mark_stamped(&self, id: i64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::MarkStamped(id, reply)).await?;
        rx.await?
    }
}
