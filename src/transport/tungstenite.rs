//! Production [`Transport`] over `tokio-tungstenite`.

use super::{BoxedSocket, SocketEvent, SocketSink, SocketStream, Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with `tokio_tungstenite::connect_async` and splits the socket
/// into the sink/stream halves the engine works with.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<BoxedSocket, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsEvents { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

fn socket_err(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Socket(e.to_string())
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(text)).await.map_err(socket_err)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(socket_err)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(socket_err)
    }
}

struct WsEvents {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketStream for WsEvents {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(SocketEvent::Message(text)),
                Ok(Message::Binary(bytes)) => {
                    // Some gateways push text payloads as binary frames.
                    return Some(SocketEvent::Message(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    ));
                }
                Ok(Message::Pong(_)) => return Some(SocketEvent::Pong),
                // tungstenite answers pings on flush; nothing to surface.
                Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    return Some(SocketEvent::Closed { code, reason });
                }
                Err(e) => return Some(SocketEvent::Error(socket_err(e))),
            }
        }
    }
}
