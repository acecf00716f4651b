//! Local WebSocket sink that records every text message it receives.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct FakeSink {
    pub url: String,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeSink {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let messages = messages.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let messages = messages.clone();
                    let connections = connections.clone();
                    tokio::spawn(async move {
                        let Ok(mut ws) = accept_async(stream).await else {
                            return;
                        };
                        connections.fetch_add(1, Ordering::SeqCst);
                        while let Some(Ok(msg)) = ws.next().await {
                            match msg {
                                Message::Text(text) => messages.lock().push(text),
                                Message::Close(_) => break,
                                _ => {}
                            }
                        }
                    });
                }
            });
        }

        Self {
            url: format!("ws://{}/coin_market_history/", addr),
            messages,
            connections,
        }
    }

    /// Wait (up to 5s) until at least `n` messages arrived, then return all of them.
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        for _ in 0..500 {
            if self.messages.lock().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.messages.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// A ws:// URL nothing is listening on.
pub async fn unused_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/", addr)
}

/// A sink that completes the WebSocket handshake and then hangs up.
pub async fn hangup_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                drop(ws);
            }
        }
    });
    format!("ws://{}/", addr)
}
