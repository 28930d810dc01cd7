//! Per-connection WebSocket loop.
//!
//! Inbound frames are either the literal control word `close` or a payload
//! sealed with the channel negotiated at handshake time. Outbound frames are
//! plain JSON queued through the connection's [`ConnectionHandle`].

use std::sync::Arc;

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket, close_code},
    futures::{SinkExt, StreamExt},
    naclgate_auth::{AuthFailure, Channel},
    serde_json::Value,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    observable::Observable,
    registry::{ConnectionHandle, ConnectionRegistry, InboundMessage, Outbound},
};

/// Control word a client sends to end its session.
pub const CLOSE_WORD: &str = "close";

pub const SHUTDOWN_REASON: &str = "Server shutdown";

/// A frame that could not be turned into data. The connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum MalformedPayload {
    #[error("binary frame is not UTF-8")]
    NotUtf8,
    #[error(transparent)]
    Unreadable(#[from] AuthFailure),
}

#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Close,
    Data(Value),
}

pub(crate) fn parse_frame(channel: &Channel, text: &str) -> Result<Frame, MalformedPayload> {
    if text.trim() == CLOSE_WORD {
        return Ok(Frame::Close);
    }
    Ok(Frame::Data(channel.open_json(text)?))
}

/// Drive one upgraded socket until either side closes or the server shuts down.
pub(crate) async fn handle_connection(
    socket: WebSocket,
    conn: ConnectionHandle,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    registry: Arc<ConnectionRegistry>,
    data: Arc<Observable<Option<InboundMessage>>>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    registry.register(conn.clone()).await;
    let write_loop = tokio::spawn(write_loop(ws_tx, outbound));

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                conn.close(close_code::AWAY, SHUTDOWN_REASON);
                break;
            }
            msg = ws_rx.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(conn_id = %conn.id(), error = %MalformedPayload::NotUtf8, "malformed payload");
                    continue;
                },
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(conn_id = %conn.id(), ?frame, "client closed connection");
                break;
            },
            // Ping/pong are answered by the transport.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "connection error");
                break;
            },
            None => break,
        };

        match parse_frame(conn.channel(), &text) {
            Ok(Frame::Close) => {
                conn.close(close_code::NORMAL, "");
                break;
            },
            Ok(Frame::Data(payload)) => {
                debug!(conn_id = %conn.id(), "inbound message");
                data.set(Some(InboundMessage {
                    payload,
                    connection: conn.clone(),
                }));
            },
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "malformed payload");
            },
        }
    }

    registry.remove(conn.id()).await;
    // Ends the write loop even while other clones of the handle are alive.
    conn.close(close_code::NORMAL, "");
    if let Err(e) = write_loop.await {
        debug!(conn_id = %conn.id(), error = %e, "write loop aborted");
    }
    info!(conn_id = %conn.id(), "connection closed");
}

async fn write_loop<S>(mut ws_tx: S, mut outbound: mpsc::UnboundedReceiver<Outbound>)
where
    S: SinkExt<Message> + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let (msg, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if ws_tx.send(msg).await.is_err() || last {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use {super::*, naclgate_auth::ServerKeys};

    fn pair() -> (Channel, Channel) {
        let server = ServerKeys::generate();
        let client = ServerKeys::generate();
        (
            Channel::new(server.secret(), client.public_key()),
            Channel::new(client.secret(), server.public_key()),
        )
    }

    #[test]
    fn close_word_is_recognised() {
        let (server, _) = pair();
        assert_eq!(parse_frame(&server, "close").unwrap(), Frame::Close);
        assert_eq!(parse_frame(&server, " close\n").unwrap(), Frame::Close);
    }

    #[test]
    fn sealed_json_becomes_data() {
        let (server, client) = pair();
        let sealed = client.seal_json(&serde_json::json!({"messageOne": "testOne"})).unwrap();
        assert_eq!(
            parse_frame(&server, &sealed).unwrap(),
            Frame::Data(serde_json::json!({"messageOne": "testOne"}))
        );
    }

    #[test]
    fn plain_json_is_malformed() {
        let (server, _) = pair();
        assert!(matches!(
            parse_frame(&server, r#"{"messageOne":"testOne"}"#),
            Err(MalformedPayload::Unreadable(_))
        ));
    }

    #[test]
    fn sealed_non_json_is_malformed() {
        let (server, client) = pair();
        let sealed = client.seal(b"not json").unwrap();
        assert!(parse_frame(&server, &sealed).is_err());
    }
}
