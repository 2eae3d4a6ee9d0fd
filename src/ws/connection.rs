//! [`Connector`] backed by `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::error::WsError;
use super::traits::{Connector, Frame, HandshakeRequest, RawEvent, RawEvents, RawSocket};
use crate::Result;
use crate::protocol::close_code;

/// How long a locally initiated close waits for the peer's close reply.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Command {
    Send(Frame),
    Close { code: u16, reason: Option<String> },
}

/// Opens connections with `tokio-tungstenite`, one background task per connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn create_connection(&self, request: &HandshakeRequest) -> Result<(Arc<dyn RawSocket>, RawEvents)> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        let protocol = HeaderValue::from_str(&request.protocol)
            .map_err(|e| WsError::Handshake(format!("invalid protocol header: {e}")))?;
        ws_request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_connection(
            ws_request,
            command_rx,
            events_tx,
            Arc::clone(&buffered),
        ));

        let socket = TungsteniteSocket {
            command_tx,
            buffered,
        };
        Ok((Arc::new(socket), events_rx))
    }
}

struct TungsteniteSocket {
    command_tx: mpsc::UnboundedSender<Command>,
    buffered: Arc<AtomicUsize>,
}

impl RawSocket for TungsteniteSocket {
    fn send(&self, frame: Frame) -> Result<()> {
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if self.command_tx.send(Command::Send(frame)).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(WsError::ConnectionClosed.into());
        }
        Ok(())
    }

    fn close(&self, code: u16, reason: Option<&str>) {
        _ = self.command_tx.send(Command::Close {
            code,
            reason: reason.map(str::to_owned),
        });
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

fn abnormal_close(events: &mpsc::UnboundedSender<RawEvent>, message: String) {
    _ = events.send(RawEvent::Error(message.clone()));
    _ = events.send(RawEvent::Close {
        code: Some(close_code::ABNORMAL),
        reason: message,
    });
}

async fn run_connection(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RawEvent>,
    buffered: Arc<AtomicUsize>,
) {
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Unable to connect: {e:?}");
            abnormal_close(&events, e.to_string());
            return;
        }
    };
    _ = events.send(RawEvent::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");
                        _ = events.send(RawEvent::Message(Frame::Text(text.as_str().to_owned())));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        _ = events.send(RawEvent::Message(Frame::Binary(bytes.to_vec())));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        _ = events.send(RawEvent::Close { code, reason });
                        // Flushes the close reply tungstenite queued for the peer.
                        _ = write.close().await;
                        return;
                    }
                    Some(Ok(_)) => {
                        // Control frames are answered by tungstenite itself.
                    }
                    Some(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("WebSocket read failed: {e:?}");
                        abnormal_close(&events, e.to_string());
                        return;
                    }
                    None => {
                        abnormal_close(&events, WsError::ConnectionClosed.to_string());
                        return;
                    }
                }
            }

            command = commands.recv() => {
                match command {
                    Some(Command::Send(frame)) => {
                        let len = frame.len();
                        let message = match frame {
                            Frame::Text(text) => Message::Text(text.into()),
                            Frame::Binary(bytes) => Message::Binary(bytes.into()),
                        };
                        let result = write.send(message).await;
                        let remaining = buffered.fetch_sub(len, Ordering::SeqCst).saturating_sub(len);
                        if let Err(e) = result {
                            abnormal_close(&events, e.to_string());
                            return;
                        }
                        _ = events.send(RawEvent::Drain(remaining));
                    }
                    Some(Command::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.unwrap_or_default().into(),
                        };
                        if write.send(Message::Close(Some(frame))).await.is_ok() {
                            _ = timeout(CLOSE_GRACE, async {
                                while let Some(Ok(_)) = read.next().await {}
                            })
                            .await;
                        }
                        return;
                    }
                    None => {
                        // Every handle to the socket is gone.
                        _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}
