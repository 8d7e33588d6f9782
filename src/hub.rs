//! Fan-out of the transcoder's output to every connected listener.
//!
//! Each pipeline start installs a fresh [`StreamBuffer`]. A subscriber reads
//! the buffer it joined until that buffer is exhausted (the old process ended
//! and its writer was dropped), then moves onto the newest buffer. Closing the
//! hub ends every subscription with EOF, so no listener waits on a buffer that
//! will never receive data again.

use bytes::Bytes;
use futures::stream::{self, Stream};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// What subscribers see when they look for a buffer
#[derive(Clone)]
enum HubState {
    /// No pipeline has produced a buffer yet
    Idle,
    Live(Arc<StreamBuffer>),
    Closed,
}

/// One pipeline generation's output
pub struct StreamBuffer {
    generation: u64,
    sender: Mutex<Option<broadcast::Sender<Bytes>>>,
}

impl StreamBuffer {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Receiver for new chunks, or None once the writer is gone
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn is_finished(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn finish(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }
}

/// Write side of a buffer, held by the output pump
///
/// Dropping the writer finishes the buffer; attached subscribers drain what is
/// queued and then bridge to the next buffer.
pub struct BufferWriter {
    buffer: Arc<StreamBuffer>,
    sender: broadcast::Sender<Bytes>,
}

impl BufferWriter {
    /// Queue a chunk for every attached subscriber, returning how many there are
    pub fn send(&self, chunk: Bytes) -> usize {
        // no receivers is normal when nobody is listening
        self.sender.send(chunk).unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.buffer.generation
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.buffer.finish();
    }
}

struct HubInner {
    state: watch::Sender<HubState>,
    listeners: AtomicUsize,
    capacity: usize,
}

/// Shared handle to the hub; clones refer to the same listeners
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `capacity` is the number of chunks a subscriber may fall behind
    pub fn new(capacity: usize) -> Self {
        let (state, _) = watch::channel(HubState::Idle);
        Self {
            inner: Arc::new(HubInner {
                state,
                listeners: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Attach a listener to the newest buffer
    ///
    /// The listener sees every chunk written after this call. Before the
    /// first pipeline start it waits for a buffer to appear.
    pub fn subscribe(&self) -> Subscription {
        self.inner.listeners.fetch_add(1, Ordering::SeqCst);
        let mut subscription = Subscription {
            hub: Arc::clone(&self.inner),
            state: self.inner.state.subscribe(),
            receiver: None,
            generation: None,
        };
        subscription.attach();
        subscription
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.load(Ordering::SeqCst)
    }

    pub fn current_buffer(&self) -> Option<Arc<StreamBuffer>> {
        match &*self.inner.state.borrow() {
            HubState::Live(buffer) => Some(Arc::clone(buffer)),
            HubState::Idle | HubState::Closed => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.inner.state.borrow(), HubState::Closed)
    }

    /// Make a new buffer current and hand back its writer
    ///
    /// Only the pipeline supervisor calls this. Has no effect on a closed hub
    /// other than returning a writer nobody reads.
    pub fn install_buffer(&self, generation: u64) -> BufferWriter {
        let (sender, _) = broadcast::channel(self.inner.capacity);
        let buffer = Arc::new(StreamBuffer {
            generation,
            sender: Mutex::new(Some(sender.clone())),
        });
        self.inner.state.send_if_modified(|state| {
            if matches!(state, HubState::Closed) {
                return false;
            }
            *state = HubState::Live(Arc::clone(&buffer));
            true
        });
        BufferWriter { buffer, sender }
    }

    /// End every subscription; later subscribers get EOF immediately
    pub fn close(&self) {
        if let HubState::Live(buffer) = &*self.inner.state.borrow() {
            buffer.finish();
        }
        self.inner.state.send_replace(HubState::Closed);
    }
}

/// A listener's handle on the hub
pub struct Subscription {
    hub: Arc<HubInner>,
    state: watch::Receiver<HubState>,
    receiver: Option<broadcast::Receiver<Bytes>>,
    /// Generation of the last buffer this subscription attached to or skipped
    generation: Option<u64>,
}

enum Attach {
    Attached,
    Wait,
    Closed,
}

enum Next {
    Chunk(Bytes),
    Lagged(u64),
    Drained,
    StateChanged(bool),
}

impl Subscription {
    /// Generation of the buffer currently being read
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    fn attach(&mut self) -> Attach {
        let state = self.state.borrow_and_update().clone();
        match state {
            HubState::Closed => Attach::Closed,
            HubState::Idle => Attach::Wait,
            HubState::Live(buffer) => {
                if self.generation == Some(buffer.generation) {
                    // already drained this one
                    return Attach::Wait;
                }
                self.generation = Some(buffer.generation);
                match buffer.subscribe() {
                    Some(receiver) => {
                        self.receiver = Some(receiver);
                        Attach::Attached
                    }
                    None => Attach::Wait,
                }
            }
        }
    }

    /// Next chunk of audio, or None when the hub has closed
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if let Some(receiver) = self.receiver.as_mut() {
                let next = tokio::select! {
                    result = receiver.recv() => match result {
                        Ok(chunk) => Next::Chunk(chunk),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => Next::Lagged(skipped),
                        Err(broadcast::error::RecvError::Closed) => Next::Drained,
                    },
                    changed = self.state.changed() => Next::StateChanged(changed.is_ok()),
                };
                match next {
                    Next::Chunk(chunk) => return Some(chunk),
                    Next::Lagged(skipped) => {
                        debug!("Listener fell behind, skipped {} chunks", skipped);
                    }
                    Next::Drained => self.receiver = None,
                    Next::StateChanged(alive) => {
                        // a newer buffer does not interrupt this one; only closing does
                        if !alive || matches!(&*self.state.borrow(), HubState::Closed) {
                            self.receiver = None;
                            return None;
                        }
                    }
                }
                continue;
            }

            match self.attach() {
                Attach::Attached => continue,
                Attach::Closed => return None,
                Attach::Wait => {
                    if self.state.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Convert into a byte stream for an HTTP response body
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next_chunk()
                .await
                .map(|chunk| (Ok(chunk), subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}
