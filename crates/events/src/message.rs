use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Settles delivered messages with the transport that delivered them.
pub trait Acker: Send + Sync + core::fmt::Debug {
    /// The message was handled; the transport may forget it.
    fn ack(&self, message_id: &str);

    /// The message was not handled; the transport may redeliver it.
    fn nack(&self, message_id: &str);
}

/// A message delivered by a subscription.
///
/// Settling is idempotent: only the first `ack`/`nack` reaches the transport.
/// A message dropped without being settled is nacked.
#[derive(Debug)]
pub struct Message {
    id: String,
    data: Vec<u8>,
    delivery_attempt: u32,
    acker: Option<Arc<dyn Acker>>,
    settled: AtomicBool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        data: Vec<u8>,
        delivery_attempt: u32,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            delivery_attempt,
            acker: Some(acker),
            settled: AtomicBool::new(false),
        }
    }

    /// A message with no transport behind it (settling is a no-op).
    pub fn detached(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            data,
            delivery_attempt: 1,
            acker: None,
            settled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 1-based delivery attempt as reported by the transport.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    pub fn ack(&self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            if let Some(acker) = &self.acker {
                acker.ack(&self.id);
            }
        }
    }

    pub fn nack(&self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            if let Some(acker) = &self.acker {
                acker.nack(&self.id);
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Mark the message settled without telling the transport.
    ///
    /// For transports taking a message back after a failed hand-off, so that
    /// dropping it does not trigger a nack.
    pub fn disarm(&self) {
        self.settled.store(true, Ordering::Release);
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.nack();
    }
}
