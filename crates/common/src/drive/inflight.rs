use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Filenames currently being fetched.
///
/// Every check-and-mark goes through one lock, so a filename is marked
///  incoming before anything else can observe it as free. While any fetch
///  is active the drive counts as busy.
#[derive(Debug)]
pub struct InFlight {
    incoming: Mutex<HashSet<String>>,
    active: watch::Sender<usize>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new(Self {
            incoming: Mutex::new(HashSet::new()),
            active,
        })
    }

    /// Mark `filename` incoming, unless it already is
    pub fn try_begin(self: &Arc<Self>, filename: &str) -> Option<TransferTicket> {
        let mut incoming = self.incoming.lock();
        if !incoming.insert(filename.to_string()) {
            return None;
        }
        self.active.send_replace(incoming.len());
        Some(TransferTicket {
            inflight: self.clone(),
            filename: filename.to_string(),
        })
    }

    pub fn is_incoming(&self, filename: &str) -> bool {
        self.incoming.lock().contains(filename)
    }

    pub fn is_busy(&self) -> bool {
        !self.incoming.lock().is_empty()
    }

    pub fn incoming(&self) -> Vec<String> {
        let mut names: Vec<String> = self.incoming.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Wait until no transfer is active. False if `timeout` ran out first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut active = self.active.subscribe();
        tokio::time::timeout(timeout, active.wait_for(|n| *n == 0))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    fn end(&self, filename: &str) {
        let mut incoming = self.incoming.lock();
        incoming.remove(filename);
        self.active.send_replace(incoming.len());
    }
}

/// Proof that a fetch owns its filename. Dropping it ends the transfer.
#[derive(Debug)]
pub struct TransferTicket {
    inflight: Arc<InFlight>,
    filename: String,
}

impl Drop for TransferTicket {
    fn drop(&mut self) {
        self.inflight.end(&self.filename);
    }
}
