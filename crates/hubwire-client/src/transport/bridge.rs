//! Bridges the event-driven websocket to the hub's pull-style `receive`.
//!
//! The websocket layer pushes data whenever it arrives; the hub wants to
//! pull exactly one message per `receive` call. The bridge decouples the
//! two with a bounded message queue, a one-slot pending-receive callback,
//! and a dedicated delivery task woken by a counting semaphore.
//!
//! Delivered callbacks never run on the delivery task itself: the hub's
//! message pump re-enters `receive` from inside the callback, and user
//! handlers can do the same, so inline dispatch would stack recursion on
//! the reader path. Each delivery runs on a freshly spawned task, bounded
//! by a small executor semaphore.
//!
//! Lock ordering, everywhere: **queue lock, then pending-receive lock**.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};

use hubwire_protocol::{TransferFormat, RECORD_SEPARATOR_CHAR};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::websocket::{EventHandler, WebsocketClient, WebsocketEvent};
use crate::transport::{ReceiveCallback, Transport};

/// Concurrent callback-dispatch bound.
const EXECUTOR_CONCURRENCY: usize = 2;

/// Back-off while waiting for a dispatch slot.
const EXECUTOR_RETRY: Duration = Duration::from_millis(10);

/// Reassembly buffers above this capacity shrink once mostly drained.
const REASSEMBLY_SHRINK_CAPACITY: usize = 4096;
const REASSEMBLY_RESIDUAL_MAX: usize = 512;

struct BridgeState {
    capacity: usize,
    /// Complete messages awaiting delivery. Locked before `pending`.
    queue: Mutex<VecDeque<String>>,
    /// The one-slot pending-receive callback.
    pending: Mutex<Option<ReceiveCallback>>,
    /// One permit per enqueued message (plus wake-ups when `receive` is
    /// armed with messages already queued). Closed to shut the delivery
    /// task down.
    delivery: Arc<Semaphore>,
    executors: Arc<Semaphore>,
    /// Byte accumulator for frames split across websocket reads.
    reassembler: Mutex<String>,
    stopping: AtomicBool,
}

impl BridgeState {
    /// Queue one complete message, dropping the oldest on overflow, and
    /// wake the delivery task.
    fn enqueue(&self, message: String) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                tracing::warn!(
                    capacity = self.capacity,
                    "message queue full, dropping oldest message"
                );
                queue.pop_front();
            }
            queue.push_back(message);
        }
        self.delivery.add_permits(1);
    }

    /// Take the pending-receive callback, if any. Takes both locks in
    /// order even though only `pending` is read, so this cannot interleave
    /// with a delivery that has popped a message but not yet taken the
    /// callback.
    fn take_pending(&self) -> Option<ReceiveCallback> {
        let _queue = self.queue.lock();
        self.pending.lock().take()
    }

    fn handle_event(&self, event: WebsocketEvent) {
        match event {
            WebsocketEvent::Data(text) => {
                let frames = {
                    let mut buffer = self.reassembler.lock();
                    buffer.push_str(&text);

                    let mut frames = Vec::new();
                    while let Some(pos) = buffer.find(RECORD_SEPARATOR_CHAR) {
                        let frame = buffer[..pos].to_owned();
                        buffer.drain(..=pos);
                        if !frame.is_empty() {
                            frames.push(frame);
                        }
                    }

                    if buffer.capacity() > REASSEMBLY_SHRINK_CAPACITY
                        && buffer.len() < REASSEMBLY_RESIDUAL_MAX
                    {
                        buffer.shrink_to_fit();
                    }
                    frames
                };

                for frame in frames {
                    self.enqueue(frame);
                }
            }
            WebsocketEvent::Closed(error) => {
                if self.stopping.load(Ordering::Acquire) {
                    // stop() owns the cleanup.
                    return;
                }
                tracing::debug!(error = %error, "websocket closed");
                if let Some(callback) = self.take_pending() {
                    callback(Err(error));
                }
            }
        }
    }
}

/// The pull-style transport over an event-driven [`WebsocketClient`].
///
/// One instance serves one connection attempt: `start` once, `stop` once.
pub struct WebsocketTransport {
    state: Arc<BridgeState>,
    client: Arc<dyn WebsocketClient>,
}

impl WebsocketTransport {
    pub fn new(client: Arc<dyn WebsocketClient>, config: &ClientConfig) -> Self {
        Self {
            state: Arc::new(BridgeState {
                capacity: config.message_queue_capacity,
                queue: Mutex::new(VecDeque::new()),
                pending: Mutex::new(None),
                delivery: Arc::new(Semaphore::new(0)),
                executors: Arc::new(Semaphore::new(EXECUTOR_CONCURRENCY)),
                reassembler: Mutex::new(String::new()),
                stopping: AtomicBool::new(false),
            }),
            client,
        }
    }
}

impl Drop for WebsocketTransport {
    fn drop(&mut self) {
        // Lets the delivery task exit even if stop was never called.
        self.state.delivery.close();
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn start(&self, url: &str) -> Result<()> {
        tokio::spawn(run_delivery(self.state.clone()));

        // The event handler outlives this transport inside the websocket's
        // reader task; a weak reference keeps it from extending our
        // lifetime.
        let weak: Weak<BridgeState> = Arc::downgrade(&self.state);
        let handler: EventHandler = Arc::new(move |event| {
            if let Some(state) = weak.upgrade() {
                state.handle_event(event);
            }
        });

        match self.client.start(url, handler).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.delivery.close();
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.state.stopping.store(true, Ordering::Release);
        self.state.delivery.close();

        // Resolve a waiting receive and drain unread messages, locks in
        // order.
        let callback = {
            let mut queue = self.state.queue.lock();
            queue.clear();
            self.state.pending.lock().take()
        };
        if let Some(callback) = callback {
            callback(Err(Error::Transport("websocket transport stopped".into())));
        }

        self.client.stop().await
    }

    async fn send(&self, payload: String, format: TransferFormat) -> Result<()> {
        self.client.send(payload, format).await
    }

    fn receive(&self, callback: ReceiveCallback) {
        if self.state.stopping.load(Ordering::Acquire) {
            callback(Err(Error::Transport("websocket transport stopped".into())));
            return;
        }

        let has_message = {
            let queue = self.state.queue.lock();
            let mut pending = self.state.pending.lock();
            debug_assert!(
                pending.is_none(),
                "pending receive installed before the previous one fired"
            );
            *pending = Some(callback);
            !queue.is_empty()
        };

        // Messages were already queued when the callback arrived; wake the
        // delivery task so it pairs them up.
        if has_message {
            self.state.delivery.add_permits(1);
        }
    }
}

/// The delivery loop: pair queued messages with the pending receive and
/// dispatch each pairing on a fresh executor task.
async fn run_delivery(state: Arc<BridgeState>) {
    loop {
        match state.delivery.acquire().await {
            Ok(permit) => permit.forget(),
            // Closed: the transport is stopping or gone.
            Err(_) => return,
        }

        loop {
            // Claim a dispatch slot before popping, so a message is never
            // held outside the queue without somewhere to run.
            let executor = loop {
                match state.executors.clone().try_acquire_owned() {
                    Ok(permit) => break permit,
                    Err(TryAcquireError::Closed) => return,
                    Err(TryAcquireError::NoPermits) => {
                        if state.stopping.load(Ordering::Acquire) {
                            return;
                        }
                        tokio::time::sleep(EXECUTOR_RETRY).await;
                    }
                }
            };

            let delivery = {
                let mut queue = state.queue.lock();
                let mut pending = state.pending.lock();
                if queue.is_empty() || pending.is_none() {
                    None
                } else {
                    Some((
                        queue.pop_front().expect("queue checked non-empty"),
                        pending.take().expect("pending checked present"),
                    ))
                }
            };

            match delivery {
                Some((message, callback)) => {
                    tokio::spawn(async move {
                        callback(Ok(message));
                        drop(executor);
                    });
                }
                None => {
                    drop(executor);
                    break;
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
