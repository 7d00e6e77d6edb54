use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::protocol::Session;
use crate::ws::{ConnectionSender, Liveness};

/// How long the writer may keep flushing queued frames after the reader stops.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Run one device connection until it closes.
///
/// The socket is split in two: a writer task drains the connection's mpsc
/// channel into the sink, and the loop below feeds inbound frames to the
/// [`Session`]. The mpsc sender is what the registry stores, so pushes from
/// the update endpoint land on the writer task of the right device.
///
/// The loop ends on a close frame, a transport error, end of stream, or when
/// the keepalive gives up on the device. All of these unregister the device.
pub async fn run_connection(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Unregisters the connection when dropped, whichever way this function returns
    let mut session = Session::new(tx.clone(), &state);

    tracing::info!(peer = %peer, "Device connection opened");

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let mut keepalive_handle = tokio::spawn(keepalive_task(tx.clone(), pong_rx, state.liveness));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(peer = %peer, "Received message: {}", text.as_str());
                    if let Err(e) = session.handle_text(text.as_str()).await {
                        tracing::warn!(peer = %peer, error = %e, "Ignoring device message");
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = session.handle_binary(&data).await {
                        tracing::warn!(peer = %peer, error = %e, "Ignoring device message");
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = pong_tx.send(());
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(
                        peer = %peer,
                        mac_address = ?session.mac_address(),
                        reason = ?frame,
                        "Device initiated close"
                    );
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        peer = %peer,
                        mac_address = ?session.mac_address(),
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    tracing::info!(peer = %peer, "WebSocket stream ended");
                    break;
                }
            },
            // The keepalive only returns once the device is considered gone
            _ = &mut keepalive_handle => {
                tracing::warn!(
                    peer = %peer,
                    mac_address = ?session.mac_address(),
                    "Device stopped answering pings, dropping connection"
                );
                break;
            }
        }
    }

    keepalive_handle.abort();
    session.close();

    // Once every sender is gone the writer flushes what is queued (a close
    // frame after a pong timeout) and exits on its own
    drop(session);
    drop(tx);
    if timeout(WRITER_DRAIN, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    tracing::info!(peer = %peer, "Device connection closed");
}

/// Ping the device every `ping_interval` and return when it misses a pong.
///
/// Also returns if the writer is gone. Never returns when the keepalive is off.
async fn keepalive_task(
    tx: ConnectionSender,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    liveness: Liveness,
) {
    if liveness.ping_interval.is_zero() {
        std::future::pending::<()>().await;
    }

    let mut ping_timer = interval(liveness.ping_interval);
    // First tick fires immediately
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        // Pongs that arrived late belong to earlier pings
        while pong_rx.try_recv().is_ok() {}

        if tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
            return;
        }

        match timeout(liveness.pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(_) => {
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: "Pong timeout".into(),
                })));
                return;
            }
        }
    }
}

/// Forward queued frames to the socket until the channel closes or a send fails.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
