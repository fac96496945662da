use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use boardsync_core::{Decoded, StreamDecoder, StreamEvent};

use crate::config::ClientConfig;
use crate::controller::{ConnectionState, Next, ReconnectController};
use crate::error::{ClientError, CloseReason};
use crate::listeners::{Handlers, Listeners};
use crate::transport::{ByteStream, HttpTransport, StreamTransport};

const CONNECTED_EVENT: &str = "connected";

/// A reconnecting stream client.
///
/// Register listeners, then call [`connect`](Self::connect). A background task
/// opens the stream, decodes frames as they arrive and dispatches them, and
/// reopens after failures with a fixed delay until the attempt budget runs out.
/// [`close`](Self::close) stops everything and reports only `on_close`.
pub struct StreamClient {
    shared: Arc<Shared>,
    transport: Arc<dyn StreamTransport>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    /// Held while firing a callback and while closing, so no callback can run
    /// after `on_close`. Reentrant because callbacks may call `close`.
    gate: ReentrantMutex<()>,
    controller: Mutex<ReconnectController>,
    listeners: Mutex<Listeners>,
    handlers: Mutex<Handlers>,
    client_id: Mutex<Option<String>>,
}

impl StreamClient {
    /// Client over HTTP, using `config.method` and `config.body`.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(Arc::new(transport), &config))
    }

    pub fn with_transport(transport: Arc<dyn StreamTransport>, config: &ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                gate: ReentrantMutex::new(()),
                controller: Mutex::new(ReconnectController::new(
                    config.reconnect_interval,
                    config.max_reconnect_attempts,
                )),
                listeners: Mutex::new(Listeners::default()),
                handlers: Mutex::new(Handlers::default()),
                client_id: Mutex::new(None),
            }),
            transport,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn add_event_listener(
        &self,
        event_type: impl Into<String>,
        listener: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) {
        self.shared.listeners.lock().add(event_type, Arc::new(listener));
    }

    /// Called for every dispatched event, whatever its type.
    pub fn on_message(&self, listener: impl Fn(&StreamEvent) + Send + Sync + 'static) {
        self.shared.listeners.lock().add_message(Arc::new(listener));
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().open.push(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&ClientError) + Send + Sync + 'static) {
        self.shared.handlers.lock().error.push(Arc::new(handler));
    }

    pub fn on_close(&self, handler: impl Fn(CloseReason) + Send + Sync + 'static) {
        self.shared.handlers.lock().close.push(Arc::new(handler));
    }

    pub fn on_reconnect(&self, handler: impl Fn(u32, u32) + Send + Sync + 'static) {
        self.shared.handlers.lock().reconnect.push(Arc::new(handler));
    }

    /// Start the background task. Idempotent; a no-op once closed.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.shared.controller.lock().is_closed() {
            return;
        }
        *task = Some(tokio::spawn(run(
            self.shared.clone(),
            self.transport.clone(),
            self.cancel.clone(),
        )));
    }

    /// Close deliberately: abort the in-flight request or read, cancel a
    /// pending retry, and fire `on_close(Deliberate)`.
    pub fn close(&self) {
        self.cancel.cancel();
        self.shared.close(CloseReason::Deliberate);
    }

    pub fn ready_state(&self) -> ConnectionState {
        self.shared.controller.lock().state()
    }

    /// Connection id announced by the server in the `connected` frame.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.lock().clone()
    }

    /// Resolves once the client reaches its terminal state.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    /// Run `f` under the gate unless the client is already closed.
    fn unless_closed(&self, f: impl FnOnce()) -> bool {
        let _gate = self.gate.lock();
        let closed = self.controller.lock().is_closed();
        if !closed {
            f();
        }
        !closed
    }

    /// Move to `Closed(reason)` and fire `on_close` once.
    fn close(&self, reason: CloseReason) -> bool {
        let _gate = self.gate.lock();
        let transitioned = self.controller.lock().close(reason);
        if transitioned {
            info!(?reason, "stream client closed");
            self.fire_close(reason);
        }
        transitioned
    }

    fn dispatch(&self, event: &StreamEvent) {
        if event.event_type == CONNECTED_EVENT {
            if let Some(id) = serde_json::from_str::<serde_json::Value>(&event.data)
                .ok()
                .and_then(|v| v.get("clientId").and_then(|id| id.as_str()).map(str::to_owned))
            {
                *self.client_id.lock() = Some(id);
            }
        }
        let targets = self.listeners.lock().targets(&event.event_type);
        for listener in targets {
            listener(event);
        }
    }

    fn fire_open(&self) {
        let handlers = self.handlers.lock().open.clone();
        for h in handlers {
            h();
        }
    }

    fn fire_error(&self, error: &ClientError) {
        let handlers = self.handlers.lock().error.clone();
        for h in handlers {
            h(error);
        }
    }

    fn fire_close(&self, reason: CloseReason) {
        let handlers = self.handlers.lock().close.clone();
        for h in handlers {
            h(reason);
        }
    }

    fn fire_reconnect(&self, attempt: u32, max: u32) {
        let handlers = self.handlers.lock().reconnect.clone();
        for h in handlers {
            h(attempt, max);
        }
    }
}

async fn run(shared: Arc<Shared>, transport: Arc<dyn StreamTransport>, cancel: CancellationToken) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = transport.open() => result,
        };

        match opened {
            Ok(stream) => {
                if !shared.controller.lock().on_open() {
                    return;
                }
                info!("stream open");
                shared.unless_closed(|| shared.fire_open());
                let result = read(&shared, stream, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                match result {
                    Ok(()) => debug!("stream ended"),
                    Err(e) => {
                        warn!(error = %e, "stream read failed");
                        shared.unless_closed(|| shared.fire_error(&e));
                    }
                }
            }
            Err(e) if !e.is_retryable() => {
                warn!(error = %e, "stream refused");
                shared.unless_closed(|| shared.fire_error(&e));
                shared.close(CloseReason::AdmissionRejected);
                cancel.cancel();
                return;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(error = %e, "stream open failed");
                shared.unless_closed(|| shared.fire_error(&e));
            }
        }

        let (next, max) = {
            let mut controller = shared.controller.lock();
            (controller.on_failure(), controller.max_attempts())
        };
        match next {
            Next::Retry { attempt, delay } => {
                debug!(attempt, max, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                shared.unless_closed(|| shared.fire_reconnect(attempt, max));
                if !sleep_or_cancel(delay, &cancel).await {
                    return;
                }
            }
            Next::Exhausted => {
                warn!(max, "reconnect attempts exhausted");
                {
                    let _gate = shared.gate.lock();
                    shared.fire_close(CloseReason::AttemptsExhausted);
                }
                cancel.cancel();
                return;
            }
            Next::Stopped => return,
        }
    }
}

/// False if cancelled before the delay elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Decode and dispatch until the stream ends, errors or the client closes.
async fn read(shared: &Shared, mut stream: ByteStream, cancel: &CancellationToken) -> Result<(), ClientError> {
    let mut decoder = StreamDecoder::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            if !decoder.pending().is_empty() {
                debug!("stream ended inside a frame");
            }
            return Ok(());
        };
        for decoded in decoder.feed(&chunk?) {
            match decoded {
                Decoded::Retry(ms) => shared.controller.lock().set_retry(ms),
                Decoded::Event(event) => {
                    if !shared.unless_closed(|| shared.dispatch(&event)) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;

    enum Script {
        Fail(ClientError),
        /// Yield these chunks, then end.
        Chunks(Vec<&'static str>),
        /// Yield these chunks, then stay open.
        Hold(Vec<&'static str>),
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Script>>,
        opens: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                opens: AtomicUsize::new(0),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    fn chunks(parts: Vec<&'static str>) -> impl futures::Stream<Item = Result<Bytes, ClientError>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))))
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open(&self) -> Result<ByteStream, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(Script::Chunks(parts)) => Ok(Box::pin(chunks(parts))),
                Some(Script::Hold(parts)) => Ok(Box::pin(chunks(parts).chain(futures::stream::pending()))),
                Some(Script::Fail(e)) => Err(e),
                None => Err(ClientError::Transport("connection refused".into())),
            }
        }
    }

    fn config(max: u32) -> ClientConfig {
        ClientConfig::new("http://test/api/sse").max_reconnect_attempts(max)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn recorded<T: Send + 'static>() -> Arc<Mutex<Vec<T>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_frames_split_across_chunks() {
        let transport = ScriptedTransport::new(vec![Script::Hold(vec![
            "event: card_cr",
            "eated\ndata: {\"id\"",
            ":1}\n\n: heartbeat\n\n",
        ])]);
        let client = StreamClient::with_transport(transport.clone(), &config(3));
        let events = recorded();
        let sink = events.clone();
        client.add_event_listener("card_created", move |e: &StreamEvent| sink.lock().push(e.clone()));
        let opened = Arc::new(AtomicUsize::new(0));
        let o = opened.clone();
        client.on_open(move || {
            o.fetch_add(1, Ordering::SeqCst);
        });

        client.connect();
        settle().await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "card_created");
        assert_eq!(events[0].data, "{\"id\":1}");
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(client.ready_state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn captures_client_id_from_connected_frame() {
        let transport = ScriptedTransport::new(vec![Script::Hold(vec![
            "event: connected\ndata: {\"clientId\":\"conn_abc\",\"timestamp\":1}\nretry: 3000\n\n",
        ])]);
        let client = StreamClient::with_transport(transport, &config(3));
        client.connect();
        settle().await;
        assert_eq!(client.client_id().as_deref(), Some("conn_abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_sets_reconnect_delay() {
        let transport = ScriptedTransport::new(vec![
            Script::Chunks(vec!["retry: 5000\n\n"]),
            Script::Hold(vec![]),
        ]);
        let client = StreamClient::with_transport(transport.clone(), &config(3));
        client.connect();
        settle().await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(client.ready_state(), ConnectionState::Connecting { attempt: 1 });

        tokio::time::advance(Duration::from_millis(3000)).await;
        settle().await;
        assert_eq!(transport.opens(), 1, "default delay no longer applies");

        tokio::time::advance(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(client.ready_state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_exhaust_attempts() {
        let transport = ScriptedTransport::new(vec![]);
        let client = StreamClient::with_transport(transport.clone(), &config(3));
        let reconnects = recorded();
        let r = reconnects.clone();
        client.on_reconnect(move |attempt, max| r.lock().push((attempt, max)));
        let closes = recorded();
        let c = closes.clone();
        client.on_close(move |reason| c.lock().push(reason));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        client.on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        client.connect();
        tokio::time::timeout(Duration::from_secs(60), client.closed())
            .await
            .expect("client reaches a terminal state");

        assert_eq!(*reconnects.lock(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(*closes.lock(), vec![CloseReason::AttemptsExhausted]);
        assert_eq!(transport.opens(), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 4);
        assert_eq!(
            client.ready_state(),
            ConnectionState::Closed(CloseReason::AttemptsExhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_retry() {
        let transport = ScriptedTransport::new(vec![]);
        let client = StreamClient::with_transport(transport.clone(), &config(5));
        let reconnects = recorded();
        let r = reconnects.clone();
        client.on_reconnect(move |attempt, _| r.lock().push(attempt));
        let closes = recorded();
        let c = closes.clone();
        client.on_close(move |reason| c.lock().push(reason));

        client.connect();
        settle().await;
        assert_eq!(*reconnects.lock(), vec![1]);

        client.close();
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(*reconnects.lock(), vec![1]);
        assert_eq!(*closes.lock(), vec![CloseReason::Deliberate]);

        client.close();
        assert_eq!(closes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_open_reports_only_close() {
        let transport = ScriptedTransport::new(vec![Script::Hold(vec![])]);
        let client = StreamClient::with_transport(transport.clone(), &config(5));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        client.on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let reconnects = Arc::new(AtomicUsize::new(0));
        let r = reconnects.clone();
        client.on_reconnect(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        client.connect();
        settle().await;
        assert_eq!(client.ready_state(), ConnectionState::Open);

        client.close();
        settle().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(transport.opens(), 1);
        assert_eq!(client.ready_state(), ConnectionState::Closed(CloseReason::Deliberate));
    }

    #[tokio::test(start_paused = true)]
    async fn close_from_listener_stops_dispatch() {
        let transport = ScriptedTransport::new(vec![Script::Hold(vec![
            "data: first\n\ndata: second\n\n",
        ])]);
        let client = Arc::new(StreamClient::with_transport(transport, &config(5)));
        let log = recorded();
        let weak = Arc::downgrade(&client);
        let l = log.clone();
        client.on_message(move |e: &StreamEvent| {
            l.lock().push(e.data.clone());
            if let Some(client) = weak.upgrade() {
                client.close();
            }
        });
        let l = log.clone();
        client.on_close(move |reason| l.lock().push(format!("close:{reason:?}")));

        client.connect();
        settle().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(*log.lock(), vec!["first".to_string(), "close:Deliberate".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_callback_fires_after_close_from_another_thread() {
        for _ in 0..20 {
            let transport = ScriptedTransport::new(vec![]);
            let client = StreamClient::with_transport(
                transport,
                &config(u32::MAX).reconnect_interval(Duration::from_millis(1)),
            );
            let log = recorded();
            let l = log.clone();
            client.on_error(move |_| l.lock().push("error"));
            let l = log.clone();
            client.on_reconnect(move |_, _| l.lock().push("reconnect"));
            let l = log.clone();
            client.on_close(move |_| l.lock().push("close"));

            client.connect();
            tokio::time::sleep(Duration::from_millis(5)).await;
            client.close();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let log = log.lock();
            assert_eq!(log.last(), Some(&"close"));
            assert_eq!(log.iter().filter(|e| **e == "close").count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admission_rejection_is_terminal() {
        let transport = ScriptedTransport::new(vec![Script::Fail(ClientError::AdmissionRejected {
            retry_after: Some(Duration::from_secs(3)),
        })]);
        let client = StreamClient::with_transport(transport.clone(), &config(5));
        let closes = recorded();
        let c = closes.clone();
        client.on_close(move |reason| c.lock().push(reason));

        client.connect();
        tokio::time::timeout(Duration::from_secs(60), client.closed())
            .await
            .unwrap();

        assert_eq!(*closes.lock(), vec![CloseReason::AdmissionRejected]);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempts() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(ClientError::Status { status: 502 }),
            Script::Fail(ClientError::MissingBody),
            Script::Chunks(vec!["data: hi\n\n"]),
            Script::Hold(vec![]),
        ]);
        let client = StreamClient::with_transport(transport.clone(), &config(5));
        let reconnects = recorded();
        let r = reconnects.clone();
        client.on_reconnect(move |attempt, _| r.lock().push(attempt));
        let messages = recorded();
        let m = messages.clone();
        client.add_event_listener("message", move |e: &StreamEvent| m.lock().push(e.data.clone()));

        client.connect();
        for _ in 0..3 {
            settle().await;
            tokio::time::advance(Duration::from_millis(3000)).await;
        }
        settle().await;

        assert_eq!(transport.opens(), 4);
        assert_eq!(*reconnects.lock(), vec![1, 2, 1]);
        assert_eq!(*messages.lock(), vec!["hi".to_string()]);
        assert_eq!(client.ready_state(), ConnectionState::Open);
    }
}
