#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wirepool::service::ConnectionConfig;
use wirepool::{ConnectionHandler, FramedConnection, HandlerFuture};

pub const WAIT: Duration = Duration::from_secs(5);

/// Handler that reports every frame over a channel and counts closes.
pub struct RecordingHandler {
    messages: mpsc::UnboundedSender<Bytes>,
    closes: Arc<AtomicUsize>,
}

pub struct Recording {
    pub messages: mpsc::UnboundedReceiver<Bytes>,
    pub closes: Arc<AtomicUsize>,
}

impl Recording {
    pub async fn next(&mut self) -> Bytes {
        tokio::time::timeout(WAIT, self.messages.recv())
            .await
            .expect("no frame in time")
            .expect("handler dropped")
    }

    /// True when nothing arrives within `within`.
    pub async fn stays_silent(&mut self, within: Duration) -> bool {
        !matches!(
            tokio::time::timeout(within, self.messages.recv()).await,
            Ok(Some(_))
        )
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub fn recording() -> (Arc<RecordingHandler>, Recording) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(RecordingHandler {
            messages: tx,
            closes: closes.clone(),
        }),
        Recording {
            messages: rx,
            closes,
        },
    )
}

impl ConnectionHandler for RecordingHandler {
    fn on_message<'a>(&'a self, _conn: &'a FramedConnection, payload: Bytes) -> HandlerFuture<'a> {
        Box::pin(async move {
            let _ = self.messages.send(payload);
        })
    }

    fn on_close<'a>(&'a self, _conn: &'a FramedConnection) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// A dialed client connection and the server connection that accepted it.
pub async fn connected_pair(
    client_handler: Arc<dyn ConnectionHandler>,
    server_handler: Arc<dyn ConnectionHandler>,
    server_config: &ConnectionConfig,
) -> (FramedConnection, FramedConnection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let client_config = ConnectionConfig::default();
    let (client, accepted) = tokio::join!(
        FramedConnection::dial(&address, &client_config, client_handler),
        listener.accept()
    );
    let (stream, _) = accepted.unwrap();
    let server = FramedConnection::accept(stream, server_config, server_handler).unwrap();
    (client.unwrap(), server)
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
