//! In-process books server for integration tests.
//!
//! Binds `127.0.0.1:0`, upgrades every accepted socket and hands the server
//! side of each connection to the test.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{borrow::Cow, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};

use book_mirror::MirrorConfig;

pub const STEP: Duration = Duration::from_secs(5);

pub struct MockExchange {
    pub url: String,
    conns: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl MockExchange {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        let _ = tx.send(ws);
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/ws/books/stream"),
            conns,
        }
    }

    /// Default timings pointed at this server
    pub fn config(&self) -> MirrorConfig {
        MirrorConfig {
            ws_url: self.url.clone(),
            ..MirrorConfig::default()
        }
    }

    pub async fn accept(&mut self) -> ServerConn {
        let ws = timeout(STEP, self.conns.recv())
            .await
            .expect("no connection in time")
            .expect("listener gone");
        ServerConn { ws }
    }

    /// True if a client connects within `window`
    pub async fn connects_within(&mut self, window: Duration) -> bool {
        matches!(timeout(window, self.conns.recv()).await, Ok(Some(_)))
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next text frame from the client, as JSON
    pub async fn recv_intent(&mut self) -> Value {
        loop {
            let msg = timeout(STEP, self.ws.next())
                .await
                .expect("no intent in time")
                .expect("client went away")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("intent is JSON");
            }
        }
    }

    /// Next frame of any kind, or None once the socket is done
    pub async fn recv_raw(&mut self) -> Option<Message> {
        match timeout(STEP, self.ws.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: impl Into<String>) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn close(mut self, code: CloseCode) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed("server"),
        };
        let _ = self.ws.close(Some(frame)).await;
        // Drain until the client answers the handshake or goes away
        while let Ok(Some(Ok(_))) = timeout(Duration::from_secs(1), self.ws.next()).await {}
    }
}

pub fn asset_ids(intent: &Value) -> Vec<String> {
    let mut ids: Vec<String> = intent["assets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| match a {
            Value::String(id) => id.clone(),
            other => other["asset_id"].as_str().unwrap().to_string(),
        })
        .collect();
    ids.sort();
    ids
}

pub fn book_payload(asset_id: &str, msg_count: u64) -> Value {
    json!({
        "asset_id": asset_id,
        "ready": true,
        "msg_count": msg_count,
        "bids": [
            {"price": 0.48, "size": 100.0, "cum": 100.0},
            {"price": 0.47, "size": 40.0, "cum": 140.0}
        ],
        "asks": [
            {"price": 0.52, "size": 60.0, "cum": 60.0}
        ],
        "tick_size": 0.01
    })
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(STEP, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
