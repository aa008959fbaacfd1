//! Single-owner write session for the metadata path map.
//!
//! While a session is open the map lives inside one background task. Producers
//! hand records over an unbounded channel and never contend on a lock; lookups
//! travel the same channel so they observe every put queued before them.
//! Stopping the session drains whatever is still queued and hands the map back.

use super::{MetadataRecord, PathMap};
use crate::error::{Result, SyncError};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Messages accepted by the owning task
#[derive(Debug)]
enum Request {
    Put(MetadataRecord),
    Get {
        path: PathBuf,
        reply: oneshot::Sender<Option<MetadataRecord>>,
    },
}

type RequestSender = mpsc::UnboundedSender<Request>;
type RequestReceiver = mpsc::UnboundedReceiver<Request>;

#[derive(Debug)]
pub(crate) struct WriteSession {
    requests: RequestSender,
    stop: Option<oneshot::Sender<()>>,
    owner: JoinHandle<PathMap>,
}

impl WriteSession {
    /// Move `map` into a new owning task. Must be called inside a tokio runtime.
    pub(crate) fn start(map: PathMap) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let owner = tokio::spawn(run_owner(map, rx, stop_rx));

        Self {
            requests,
            stop: Some(stop),
            owner,
        }
    }

    pub(crate) fn put(&self, record: MetadataRecord) -> Result<()> {
        self.requests
            .send(Request::Put(record))
            .map_err(|_| SyncError::Precondition("metadata writer has stopped".to_string()))
    }

    pub(crate) async fn get(&self, path: PathBuf) -> Result<Option<MetadataRecord>> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Get { path, reply })
            .map_err(|_| SyncError::Precondition("metadata writer has stopped".to_string()))?;
        rx.await
            .map_err(|_| SyncError::Precondition("metadata writer dropped a lookup".to_string()))
    }

    /// Signal stop, wait for the queue to drain and take the map back
    pub(crate) async fn finish(mut self) -> Result<PathMap> {
        if let Some(stop) = self.stop.take() {
            // The owner may already have exited if every sender is gone
            let _ = stop.send(());
        }
        drop(self.requests);

        self.owner.await.map_err(|e| {
            SyncError::Precondition(format!("metadata writer task failed: {}", e))
        })
    }
}

async fn run_owner(
    mut map: PathMap,
    mut rx: RequestReceiver,
    mut stop: oneshot::Receiver<()>,
) -> PathMap {
    loop {
        tokio::select! {
            biased;
            request = rx.recv() => match request {
                Some(request) => apply(&mut map, request),
                None => return map,
            },
            _ = &mut stop => break,
        }
    }

    // Anything queued before the stop signal still lands
    rx.close();
    while let Some(request) = rx.recv().await {
        apply(&mut map, request);
    }
    map
}

fn apply(map: &mut PathMap, request: Request) {
    match request {
        Request::Put(record) => {
            tracing::trace!("metadata put {}", record.path.display());
            map.insert(record.path.clone(), record);
        }
        Request::Get { path, reply } => {
            let _ = reply.send(map.get(&path).cloned());
        }
    }
}
