//! Host permission handshake
//!
//! Before a tunnel may start, the host usually has to ask the user for VPN
//! consent. Only one such request may be outstanding at a time.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Holds at most one pending permission request
#[derive(Default)]
pub struct PermissionSlot {
    pending: Mutex<Option<oneshot::Sender<bool>>>,
}

/// Waiting side of a permission request
pub struct PermissionRequest {
    rx: oneshot::Receiver<bool>,
}

impl PermissionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request. Refused while another one is still pending.
    pub fn request(&self) -> Result<PermissionRequest> {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::PermissionDenied(
                "another permission request is pending".into(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(tx);
        debug!("[Permission] Request opened");
        Ok(PermissionRequest { rx })
    }

    /// Complete the pending request. Returns false if none was pending.
    pub fn complete(&self, granted: bool) -> bool {
        match self.pending.lock().take() {
            Some(tx) => {
                debug!("[Permission] Request completed: granted={}", granted);
                tx.send(granted).is_ok()
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl PermissionRequest {
    /// Wait for the host's answer
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::PermissionDenied("user declined".into())),
            Err(_) => Err(Error::PermissionDenied("request abandoned".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant() {
        let slot = PermissionSlot::new();
        let request = slot.request().unwrap();
        assert!(slot.is_pending());
        assert!(slot.complete(true));
        assert!(request.wait().await.is_ok());
        assert!(!slot.is_pending());
    }

    #[tokio::test]
    async fn test_second_request_refused_while_pending() {
        let slot = PermissionSlot::new();
        let first = slot.request().unwrap();
        assert!(matches!(slot.request(), Err(Error::PermissionDenied(_))));

        assert!(slot.complete(false));
        assert!(matches!(first.wait().await, Err(Error::PermissionDenied(_))));

        // Slot is free again
        assert!(slot.request().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_request_frees_slot() {
        let slot = PermissionSlot::new();
        drop(slot.request().unwrap());
        assert!(!slot.is_pending());
        assert!(slot.request().is_ok());
        assert!(!PermissionSlot::new().complete(true));
    }
}
