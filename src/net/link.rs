// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Maximum size for any single handshake frame (4 KiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Byte-oriented channel to a single remote peer, supplied by the transport.
#[async_trait]
pub trait Link: Send + Sync {
    /// Transport-level label for the remote end; used to attribute failures.
    fn remote_addr(&self) -> &str;
    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError>;
    async fn recv(&self) -> Result<Vec<u8>, LinkError>;
}

/// In-process [`Link`] backed by a pair of unbounded tokio channels.
#[derive(Debug)]
pub struct MemoryLink {
    remote: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryLink {
    /// Creates two connected ends; frames sent on one arrive on the other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a = format!("mem:{}", Uuid::new_v4());
        let b = format!("mem:{}", Uuid::new_v4());
        Self::pair_with_labels(&a, &b)
    }

    /// Like [`pair`](Self::pair), naming the ends `a` and `b`. The first link
    /// reports `b` as its remote and vice versa.
    #[must_use]
    pub fn pair_with_labels(a: &str, b: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                remote: b.to_string(),
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            Self {
                remote: a.to_string(),
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn remote_addr(&self) -> &str {
        &self.remote
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.tx.send(frame).map_err(|_| LinkError::Closed)
    }

    async fn recv(&self) -> Result<Vec<u8>, LinkError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(LinkError::Closed)
    }
}
