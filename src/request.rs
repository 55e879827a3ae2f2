//! The inbound unit of work.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// One conversion request: the raw document plus enough identity to trace it.
///
/// The payload is reference-counted so the retry loop can hand it to the
/// blocking local phase on every attempt without copying the document.
#[derive(Clone)]
pub struct WorkRequest {
    id: Uuid,
    payload: Arc<[u8]>,
    display_name: String,
    received_at: SystemTime,
}

impl WorkRequest {
    pub fn new(payload: impl Into<Vec<u8>>, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: Arc::from(payload.into()),
            display_name: display_name.into(),
            received_at: SystemTime::now(),
        }
    }

    /// Correlation identifier, unique per request (not per payload).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn shared_payload(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }

    /// Human-readable name, usually the uploaded filename.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }
}

impl fmt::Debug for WorkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRequest")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("payload_len", &self.payload.len())
            .field("received_at", &self.received_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_payloads_get_distinct_ids() {
        let a = WorkRequest::new(b"%PDF-1.7".to_vec(), "a.pdf");
        let b = WorkRequest::new(b"%PDF-1.7".to_vec(), "a.pdf");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.payload(), b.payload());
    }

    #[test]
    fn debug_omits_payload_bytes() {
        let r = WorkRequest::new(vec![0u8; 1024], "big.pdf");
        let dbg = format!("{r:?}");
        assert!(dbg.contains("payload_len: 1024"));
        assert!(dbg.contains("big.pdf"));
    }
}
