//! Producer/consumer sitemap stream (§4.8).
//!
//! A single-slot rendezvous: the producer blocks until the slot is empty,
//! the consumer blocks until it isn't. Backed directly by
//! `tokio::sync::mpsc::channel(1)` — a bounded channel of capacity one
//! already gives "push blocks until the slot is free" and "closing the
//! sender makes every future read return done" for free, which is exactly
//! the `empty`/`batch`/`closed` state machine the source describes.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ssr_kvstore::{DbClient, StoreError};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Returned when either side observes cancellation instead of a rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled;

/// One path discovered by a sitemap generator, not yet reconciled against
/// the persistence table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub path: String,
    pub fingerprint: String,
}

/// A batch of entries pushed by one generator invocation.
pub type Batch = Vec<SitemapEntry>;

/// A reconciled entry ready to render into the sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEntry {
    pub path: String,
    pub lastmod: DateTime<Utc>,
}

/// The producer half: `push` blocks until the slot is free, `close` (just
/// dropping the producer) leaves the slot permanently `closed`.
pub struct Producer {
    tx: mpsc::Sender<Batch>,
}

impl Producer {
    /// Block until the slot is empty, then publish `batch`. Fails with
    /// [`Cancelled`] if `cancel` fires first, or if the consumer has
    /// already been dropped (its next read would never observe this push).
    pub async fn push(&self, batch: Batch, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            result = self.tx.send(batch) => result.map_err(|_| Cancelled),
        }
    }
}

/// What a [`Consumer::read`] observed.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Batch(Batch),
    Done,
}

/// The consumer half.
pub struct Consumer {
    rx: mpsc::Receiver<Batch>,
}

impl Consumer {
    /// Block until the slot holds a batch or has been closed. Once closed,
    /// every subsequent call returns `Done`.
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<ReadOutcome, Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            item = self.rx.recv() => Ok(match item {
                Some(batch) => ReadOutcome::Batch(batch),
                None => ReadOutcome::Done,
            }),
        }
    }
}

/// Create a fresh single-slot rendezvous channel.
pub fn channel() -> (Producer, Consumer) {
    let (tx, rx) = mpsc::channel(1);
    (Producer { tx }, Consumer { rx })
}

/// One sitemap-path generator, handed the push function and driven to
/// completion before the next generator starts (§4.8: "driven
/// sequentially, one generator at a time").
pub trait Generator: Send {
    fn run<'a>(
        &'a mut self,
        producer: &'a Producer,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Cancelled>>;
}

/// Spawn the producer side: run every generator to completion in order,
/// then close the slot. Returns immediately with the consumer half.
pub fn spawn_stream(mut generators: Vec<Box<dyn Generator>>, cancel: CancellationToken) -> Consumer {
    let (producer, consumer) = channel();
    tokio::spawn(async move {
        for generator in generators.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            if generator.run(&producer, &cancel).await.is_err() {
                break;
            }
        }
        // Dropping `producer` here closes the slot (§4.8's `close()`).
    });
    consumer
}

/// The encoder stage (§4.8, "The encoder reads until `done`..."): drains a
/// [`Consumer`], reconciling each batch against the sitemap persistence
/// table and emitting one [`RenderedEntry`] per path.
pub async fn encode(
    mut consumer: Consumer,
    db: &dyn DbClient,
    now: DateTime<Utc>,
    cancel: CancellationToken,
) -> Result<Vec<RenderedEntry>, StoreError> {
    let mut rendered = Vec::new();

    loop {
        let outcome = consumer.read(&cancel).await;
        let batch = match outcome {
            Ok(ReadOutcome::Batch(batch)) => batch,
            Ok(ReadOutcome::Done) => break,
            Err(Cancelled) => break,
        };

        let paths: Vec<String> = batch.iter().map(|e| e.path.clone()).collect();
        let existing = db.lookup_by_paths(&paths).await?;

        for entry in batch {
            let row = existing.iter().find(|r| r.path == entry.path);
            let lastmod = match row {
                Some(row) if row.fingerprint == entry.fingerprint => row.updated_at,
                Some(_) => {
                    db.update_fingerprint(&entry.path, &entry.fingerprint, now).await?;
                    now
                }
                None => {
                    db.insert_row(&entry.path, &entry.fingerprint, now).await?;
                    now
                }
            };
            rendered.push(RenderedEntry {
                path: entry.path,
                lastmod,
            });
        }
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssr_kvstore::SitemapRow;
    use std::sync::Mutex as StdMutex;

    struct FakeDb {
        rows: StdMutex<Vec<SitemapRow>>,
    }

    impl DbClient for FakeDb {
        fn lookup_by_paths<'a>(
            &'a self,
            paths: &'a [String],
        ) -> ssr_kvstore::BoxFuture<'a, Result<Vec<SitemapRow>, StoreError>> {
            let rows = self.rows.lock().unwrap();
            let found = rows
                .iter()
                .filter(|r| paths.contains(&r.path))
                .cloned()
                .collect();
            Box::pin(async move { Ok(found) })
        }

        fn insert_row<'a>(
            &'a self,
            path: &'a str,
            fingerprint: &'a str,
            now: DateTime<Utc>,
        ) -> ssr_kvstore::BoxFuture<'a, Result<SitemapRow, StoreError>> {
            let row = SitemapRow {
                path: path.to_string(),
                fingerprint: fingerprint.to_string(),
                created_at: now,
                updated_at: now,
            };
            self.rows.lock().unwrap().push(row.clone());
            Box::pin(async move { Ok(row) })
        }

        fn update_fingerprint<'a>(
            &'a self,
            path: &'a str,
            fingerprint: &'a str,
            now: DateTime<Utc>,
        ) -> ssr_kvstore::BoxFuture<'a, Result<(), StoreError>> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.path == path) {
                row.fingerprint = fingerprint.to_string();
                row.updated_at = now;
            }
            Box::pin(async move { Ok(()) })
        }
    }

    struct OneShotGenerator(Option<Batch>);

    impl Generator for OneShotGenerator {
        fn run<'a>(
            &'a mut self,
            producer: &'a Producer,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), Cancelled>> {
            Box::pin(async move {
                if let Some(batch) = self.0.take() {
                    producer.push(batch, cancel).await?;
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn consumer_sees_done_after_producer_closes_with_no_batches() {
        let consumer = spawn_stream(vec![], CancellationToken::new());
        let mut consumer = consumer;
        let outcome = consumer.read(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Done);
        // Reading again after closed keeps returning Done.
        let outcome2 = consumer.read(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome2, ReadOutcome::Done);
    }

    #[tokio::test]
    async fn generators_run_sequentially_and_close_after_the_last() {
        let gen1 = OneShotGenerator(Some(vec![SitemapEntry {
            path: "/a".into(),
            fingerprint: "f1".into(),
        }]));
        let gen2 = OneShotGenerator(Some(vec![SitemapEntry {
            path: "/b".into(),
            fingerprint: "f2".into(),
        }]));
        let mut consumer = spawn_stream(vec![Box::new(gen1), Box::new(gen2)], CancellationToken::new());

        let mut seen = Vec::new();
        loop {
            match consumer.read(&CancellationToken::new()).await.unwrap() {
                ReadOutcome::Batch(batch) => seen.extend(batch),
                ReadOutcome::Done => break,
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].path, "/a");
        assert_eq!(seen[1].path, "/b");
    }

    #[tokio::test]
    async fn encode_inserts_new_paths_and_keeps_stored_lastmod_for_unchanged_fingerprints() {
        let now = Utc::now();
        let stored_updated_at = now - chrono::Duration::days(3);
        let db = FakeDb {
            rows: StdMutex::new(vec![SitemapRow {
                path: "/unchanged".into(),
                fingerprint: "same".into(),
                created_at: stored_updated_at,
                updated_at: stored_updated_at,
            }]),
        };

        let gen = OneShotGenerator(Some(vec![
            SitemapEntry {
                path: "/unchanged".into(),
                fingerprint: "same".into(),
            },
            SitemapEntry {
                path: "/new".into(),
                fingerprint: "abc".into(),
            },
        ]));
        let consumer = spawn_stream(vec![Box::new(gen)], CancellationToken::new());

        let rendered = encode(consumer, &db, now, CancellationToken::new()).await.unwrap();
        let unchanged = rendered.iter().find(|r| r.path == "/unchanged").unwrap();
        let new = rendered.iter().find(|r| r.path == "/new").unwrap();
        assert_eq!(unchanged.lastmod, stored_updated_at);
        assert_eq!(new.lastmod, now);
    }
}
