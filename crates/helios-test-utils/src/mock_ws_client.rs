use futures_util::{SinkExt, StreamExt};
use helios_protocol::{EventMessage, Frame, Response};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A typed client over one WebSocket.
///
/// Reading the stream answers server pings automatically (tungstenite
/// replies on poll); a test that wants to simulate a dead peer simply never
/// calls a `recv_*` method.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect with a session token on the upgrade URL.
    pub async fn connect_with_token(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let separator = if url.contains('?') { '&' } else { '?' };
        let url = format!("{url}{separator}session_token={token}");
        Self::connect(&url).await
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let json = serde_json::to_string(frame)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send raw text, bypassing the codec (for parse-mode tests).
    pub async fn send_raw(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next typed frame; control frames are skipped.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Frame = serde_json::from_str(&text)?;
                    return Ok(frame);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Skip frames until an event with this exact topic arrives.
    pub async fn recv_event(
        &mut self,
        topic: &str,
    ) -> Result<EventMessage, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            if let Frame::Event(event) = self.recv_frame().await? {
                if event.topic == topic {
                    return Ok(event);
                }
            }
        }
    }

    /// Skip frames until the response correlated to `request_id` arrives.
    pub async fn recv_response(
        &mut self,
        request_id: &str,
    ) -> Result<Response, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            if let Frame::Response(response) = self.recv_frame().await? {
                if response.request_id == request_id {
                    return Ok(response);
                }
            }
        }
    }

    /// Read until the server closes the socket, returning the close frame's
    /// code and reason when present.
    pub async fn recv_close(&mut self) -> Result<Option<(u16, String)>, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| (f.code.into(), f.reason.to_string())));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
