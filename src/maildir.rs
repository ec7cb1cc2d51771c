//! Maildir access and the `new`-directory watcher.
//!
//! Any change in `new` is only a wake-up signal: the watcher then lists
//! everything currently in `new` and hands each entry to the dispatch sink.
//! Bursts of deliveries collapse into one drain pass, and anything that
//! landed between two drains is picked up by the next one.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchSink;
use crate::error::WatchError;

/// A maildir root with `new`, `cur` and `tmp` subdirectories.
#[derive(Debug, Clone)]
pub struct Maildir {
    root: PathBuf,
}

impl Maildir {
    /// Open a maildir, creating any missing subdirectories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WatchError> {
        let root = root.into();
        for sub in ["new", "cur", "tmp"] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|source| WatchError::Maildir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    pub fn cur_dir(&self) -> PathBuf {
        self.root.join("cur")
    }

    /// List messages in `new`, in directory order.
    ///
    /// Hidden files and anything that is not a regular file are skipped.
    pub async fn list_new(&self) -> std::io::Result<Vec<MaildirEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(self.new_dir()).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(id) = name.to_str() else {
                warn!(file = ?name, "Skipping maildir entry with non UTF-8 name");
                continue;
            };
            if id.starts_with('.') || !item.file_type().await?.is_file() {
                continue;
            }
            entries.push(MaildirEntry {
                id: id.to_string(),
                path: item.path(),
                cur_dir: self.cur_dir(),
            });
        }
        Ok(entries)
    }
}

/// One message file in a maildir's `new` directory.
#[derive(Debug)]
pub struct MaildirEntry {
    id: String,
    path: PathBuf,
    cur_dir: PathBuf,
}

impl MaildirEntry {
    /// The unique file name of the message.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw message bytes.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Move the message to `cur` with the Seen flag set. Returns the new path.
    pub async fn mark_seen(self) -> std::io::Result<PathBuf> {
        let target = self.cur_dir.join(format!("{}:2,S", self.id));
        tokio::fs::rename(&self.path, &target).await?;
        Ok(target)
    }
}

/// Watches a maildir's `new` directory and drains it whenever it changes.
pub struct MaildirWatcher {
    maildir: Maildir,
    sink: Arc<dyn DispatchSink>,
}

impl MaildirWatcher {
    pub fn new(maildir: Maildir, sink: Arc<dyn DispatchSink>) -> Self {
        Self { maildir, sink }
    }

    /// Hand every message currently in `new` to the sink.
    ///
    /// A failing entry is logged and left in `new` for the next drain; the
    /// rest of the pass still runs. Returns how many entries were dispatched,
    /// or [`WatchError::Undelivered`] if any entry failed.
    pub async fn drain(&self) -> Result<usize, WatchError> {
        debug!("Processing new message queue...");
        let entries = self
            .maildir
            .list_new()
            .await
            .map_err(|source| WatchError::Maildir {
                path: self.maildir.new_dir().display().to_string(),
                source,
            })?;

        let mut dispatched = 0;
        let mut failed = 0;
        for entry in entries {
            let id = entry.id().to_string();
            debug!(%id, "Dispatching maildir message");
            match self.sink.process_from_maildir_entry(entry).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    error!(%id, "Failed to dispatch maildir message: {e}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(WatchError::Undelivered { failed, dispatched });
        }
        Ok(dispatched)
    }

    /// Watch until the process exits.
    pub async fn watch(self) -> Result<(), WatchError> {
        self.watch_until(std::future::pending::<()>()).await
    }

    /// Watch until `stop` resolves or the event source goes away.
    pub async fn watch_until<F>(self, stop: F) -> Result<(), WatchError>
    where
        F: Future<Output = ()>,
    {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "Maildir watch event error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.maildir.new_dir(), RecursiveMode::NonRecursive)?;

        info!(path = %self.maildir.new_dir().display(), "Monitoring the Maildir for new messages");

        // Deliveries made before the watch was registered.
        self.drain_logged().await;

        tokio::pin!(stop);
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        warn!("Maildir event source closed");
                        break;
                    };
                    // Deliveries usually arrive as a rename from `tmp`, so
                    // anything but a plain read counts.
                    if !matches!(event.kind, EventKind::Access(_)) {
                        // Fold a burst of deliveries into one pass.
                        while event_rx.try_recv().is_ok() {}
                        self.drain_logged().await;
                    }
                }
                _ = &mut stop => {
                    info!("Maildir watcher shutting down");
                    break;
                }
            }
        }

        drop(watcher);
        Ok(())
    }

    async fn drain_logged(&self) {
        match self.drain().await {
            Ok(0) => {}
            Ok(n) => debug!(count = n, "Drained maildir"),
            Err(e) => error!("Maildir drain failed: {e}"),
        }
    }
}
