use super::WireMessage;
use crate::error::PeerError;
use crate::piece::BlockRequest;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// FIFO of messages waiting for the connection's single writer.
///
/// Producers push from the message loop; the writer task pops. Anything still
/// queued can be withdrawn, which is how `Cancel` beats a pending `Piece`.
///
/// Blocks the remote asked of us are tracked from the moment they are
/// accepted until their `Piece` leaves the queue.
#[derive(Default)]
pub struct SendQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<WireMessage>,
    /// Requests accepted from the remote whose response is not yet sent
    uploads: Vec<BlockRequest>,
    closed: bool,
}

impl QueueState {
    fn forget_upload(&mut self, index: u32, begin: u32, length: usize) {
        if let Some(position) = self
            .uploads
            .iter()
            .position(|b| b.index == index && b.begin == begin && b.length as usize == length)
        {
            self.uploads.swap_remove(position);
        }
    }
}

fn overlaps(a: &BlockRequest, b: &BlockRequest) -> bool {
    a.index == b.index
        && (a.begin as u64) < b.begin as u64 + b.length as u64
        && (b.begin as u64) < a.begin as u64 + a.length as u64
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, message: WireMessage) {
        let mut state = self.inner.lock().await;
        if state.closed {
            return;
        }
        state.messages.push_back(message);
        drop(state);
        self.notify.notify_one();
    }

    /// Next message to send, or `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<WireMessage> {
        loop {
            {
                let mut state = self.inner.lock().await;
                if let Some(message) = state.messages.pop_front() {
                    if let WireMessage::Piece { index, begin, data } = &message {
                        state.forget_upload(*index, *begin, data.len());
                    }
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages; the writer drains what is left and exits.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_one();
    }

    /// Accept a request from the remote before its data is read.
    ///
    /// Fails if it duplicates or overlaps a request still waiting to be
    /// answered, or if `limit` responses are already pending.
    pub async fn reserve_upload(&self, block: BlockRequest, limit: usize) -> Result<(), PeerError> {
        let mut state = self.inner.lock().await;
        if state.uploads.iter().any(|pending| overlaps(pending, &block)) {
            return Err(PeerError::OverlappingRequest {
                index: block.index,
                begin: block.begin,
                length: block.length,
            });
        }
        if state.uploads.len() >= limit {
            return Err(PeerError::TooManyRequests(state.uploads.len()));
        }
        state.uploads.push(block);
        Ok(())
    }

    /// Give up a reservation whose response will never be queued.
    pub async fn release_upload(&self, block: &BlockRequest) {
        self.inner
            .lock()
            .await
            .forget_upload(block.index, block.begin, block.length as usize);
    }

    pub async fn pending_uploads(&self) -> usize {
        self.inner.lock().await.uploads.len()
    }

    /// Drop a queued `Piece` response matching `block`.
    pub async fn remove_piece(&self, block: &BlockRequest) -> bool {
        let removed = self
            .remove_first(|message| {
                matches!(message, WireMessage::Piece { index, begin, data }
                    if *index == block.index
                        && *begin == block.begin
                        && data.len() == block.length as usize)
            })
            .await;
        if removed {
            self.release_upload(block).await;
        }
        removed
    }

    /// Drop a queued `Request` for `block`.
    pub async fn remove_request(&self, block: &BlockRequest) -> bool {
        self.remove_first(|message| {
            matches!(message, WireMessage::Request { block: queued } if queued == block)
        })
        .await
    }

    /// Drop every queued `Request`, returning the blocks withdrawn.
    pub async fn drain_requests(&self) -> Vec<BlockRequest> {
        let mut state = self.inner.lock().await;
        let mut withdrawn = Vec::new();
        state.messages.retain(|message| match message {
            WireMessage::Request { block } => {
                withdrawn.push(*block);
                false
            }
            _ => true,
        });
        withdrawn
    }

    async fn remove_first<F>(&self, predicate: F) -> bool
    where
        F: Fn(&WireMessage) -> bool,
    {
        let mut state = self.inner.lock().await;
        match state.messages.iter().position(predicate) {
            Some(position) => {
                state.messages.remove(position);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn pending(&self) -> Vec<WireMessage> {
        self.inner.lock().await.messages.iter().cloned().collect()
    }
}
