//! WebSocket session with the Gemini Live API.
//!
//! One session per streaming loop instance: opened once by the connector,
//! closed on loop teardown. The send and receive halves of the socket live
//! behind separate async mutexes so the capture tasks and the reception task
//! never contend on each other.

use super::messages::{
    Content, ContextWindowCompression, GenerationConfig, MediaBlob, Part, PrebuiltVoiceConfig,
    RealtimeInputMessage, ServerMessage, SessionResumption, Setup, SetupMessage, SlidingWindow,
    SpeechConfig, VoiceConfig,
};
use super::{ConnectParams, SessionEvent, UpstreamConnector, UpstreamSession, UpstreamError, LIVE_API_URL};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn setup_message(params: &ConnectParams) -> SetupMessage {
    SetupMessage {
        setup: Setup {
            model: params.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: params.response_modalities.clone(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: params.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: params.system_instruction.clone(),
                }],
            },
            session_resumption: SessionResumption {
                handle: params.resumption_handle.clone(),
            },
            context_window_compression: ContextWindowCompression {
                sliding_window: SlidingWindow {},
            },
        },
    }
}

/// Extract the events this application reacts to from one server message.
fn events_from(msg: ServerMessage) -> Vec<SessionEvent> {
    let mut events = Vec::new();

    if let Some(update) = msg.session_resumption_update {
        if update.resumable.unwrap_or(false) {
            if let Some(handle) = update.new_handle.filter(|h| !h.is_empty()) {
                events.push(SessionEvent::Resumption(handle));
            }
        }
    }

    if let Some(content) = msg.server_content {
        if content.interrupted.unwrap_or(false) {
            events.push(SessionEvent::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match STANDARD.decode(blob.data.as_bytes()) {
                        Ok(bytes) if !bytes.is_empty() => events.push(SessionEvent::Audio(bytes)),
                        Ok(_) => {}
                        Err(e) => warn!("Discarding undecodable inline payload: {}", e),
                    }
                }
            }
        }
        if content.turn_complete.unwrap_or(false) {
            events.push(SessionEvent::TurnComplete);
        }
    }

    events
}

/// An open Gemini Live session.
pub struct GeminiLiveSession {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
    /// Parsed events not yet handed out. A sync mutex, never held across an
    /// await point: `next_event` must stay cancellation-safe because the
    /// reception task polls it under a timeout.
    pending: StdMutex<VecDeque<SessionEvent>>,
    audio_mime: String,
}

impl GeminiLiveSession {
    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), UpstreamError> {
        let text = serde_json::to_string(message)
            .map_err(|e| UpstreamError::Send(e.to_string()))?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| UpstreamError::Send(e.to_string()))
    }

    fn ingest(&self, raw: &[u8]) {
        match serde_json::from_slice::<ServerMessage>(raw) {
            Ok(msg) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.extend(events_from(msg));
                }
            }
            Err(e) => warn!("Ignoring unparseable server message: {}", e),
        }
    }
}

#[async_trait]
impl UpstreamSession for GeminiLiveSession {
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), UpstreamError> {
        let message = RealtimeInputMessage::audio(MediaBlob {
            mime_type: self.audio_mime.clone(),
            data: STANDARD.encode(pcm),
        });
        self.send_json(&message).await
    }

    async fn send_video(&self, jpeg: &[u8]) -> Result<(), UpstreamError> {
        let message = RealtimeInputMessage::video(MediaBlob {
            mime_type: "image/jpeg".to_string(),
            data: STANDARD.encode(jpeg),
        });
        self.send_json(&message).await
    }

    async fn next_event(&self) -> Result<Option<SessionEvent>, UpstreamError> {
        loop {
            if let Ok(mut pending) = self.pending.lock() {
                if let Some(event) = pending.pop_front() {
                    return Ok(Some(event));
                }
            }

            let inbound = { self.reader.lock().await.next().await };
            match inbound {
                None => return Ok(None),
                Some(Err(e)) => return Err(UpstreamError::Receive(e.to_string())),
                Some(Ok(Message::Text(text))) => self.ingest(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => self.ingest(&bytes),
                Some(Ok(Message::Close(_))) => {
                    debug!("Server closed the live session");
                    return Ok(None);
                }
                Some(Ok(_)) => {} // ping/pong keepalives
            }
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }
}

/// Connector for the real Gemini Live API.
pub struct GeminiConnector;

#[async_trait]
impl UpstreamConnector for GeminiConnector {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        let url = format!("{}?key={}", LIVE_API_URL, params.api_key);
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let (writer, reader) = ws.split();

        let session = GeminiLiveSession {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            pending: StdMutex::new(VecDeque::new()),
            audio_mime: format!("audio/pcm;rate={}", params.input_sample_rate),
        };

        session.send_json(&setup_message(params)).await?;

        // The server acknowledges the setup before any content flows.
        loop {
            let inbound = { session.reader.lock().await.next().await };
            match inbound {
                None => {
                    return Err(UpstreamError::Connect(
                        "connection closed before setup completed".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(UpstreamError::Connect(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) if msg.setup_complete.is_some() => break,
                        Ok(_) => debug!("Ignoring pre-setup message"),
                        Err(e) => {
                            return Err(UpstreamError::Protocol(format!(
                                "bad setup response: {}",
                                e
                            )))
                        }
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    match serde_json::from_slice::<ServerMessage>(&bytes) {
                        Ok(msg) if msg.setup_complete.is_some() => break,
                        Ok(_) => debug!("Ignoring pre-setup message"),
                        Err(e) => {
                            return Err(UpstreamError::Protocol(format!(
                                "bad setup response: {}",
                                e
                            )))
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(UpstreamError::Connect(
                        "connection closed before setup completed".to_string(),
                    ))
                }
                Some(Ok(_)) => {}
            }
        }

        info!(model = %params.model, "Live session established");
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_from_audio_and_turn() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"mimeType": "audio/pcm", "data": "AQID"}}]
                },
                "turnComplete": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let events = events_from(msg);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SessionEvent::Audio(vec![1, 2, 3]));
        assert_eq!(events[1], SessionEvent::TurnComplete);
    }

    #[test]
    fn test_events_from_resumption_requires_resumable() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"sessionResumptionUpdate": {"newHandle": "h", "resumable": false}}"#,
        )
        .unwrap();
        assert!(events_from(msg).is_empty());

        let msg: ServerMessage = serde_json::from_str(
            r#"{"sessionResumptionUpdate": {"newHandle": "h", "resumable": true}}"#,
        )
        .unwrap();
        assert_eq!(
            events_from(msg),
            vec![SessionEvent::Resumption("h".to_string())]
        );
    }

    #[test]
    fn test_events_from_interrupted() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(events_from(msg), vec![SessionEvent::Interrupted]);
    }

    #[test]
    fn test_setup_message_carries_resumption_handle() {
        let params = ConnectParams {
            api_key: "k".to_string(),
            model: "models/m".to_string(),
            voice_name: "Leda".to_string(),
            response_modalities: vec!["AUDIO".to_string()],
            system_instruction: "hi".to_string(),
            resumption_handle: Some("prev".to_string()),
            input_sample_rate: 16000,
        };
        let json = serde_json::to_value(setup_message(&params)).unwrap();
        assert_eq!(json["setup"]["sessionResumption"]["handle"], "prev");
    }
}
