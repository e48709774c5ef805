//! One WebSocket connection on `/ws/stream`: negotiates a session, feeds
//! inbound audio into an [`Orchestrator`], and serializes orchestrator
//! events plus synthesized audio back out over a single writer task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

use pipeline::adapters::{AsrAdapter, MtAdapter, TtsAdapter};
use pipeline::orchestrator::{Orchestrator, OrchestratorConfig, PipelineEvent};
use shared_protocol::{ClientMessage, ServerMessage};

use crate::config::ServerConfig;

/// Adapter instances shared by every connection on this server.
pub struct Adapters {
    pub asr: Arc<dyn AsrAdapter>,
    pub mt: Arc<dyn MtAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
}

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub async fn handle_connection(
    stream: TcpStream,
    server_config: Arc<ServerConfig>,
    adapters: Arc<Adapters>,
) -> Result<()> {
    let session_id = Uuid::new_v4();
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    if let Err(e) = run_session(session_id, &mut ws_receiver, &server_config, &adapters, out_tx).await {
        warn!(%session_id, error = %e, "session ended with error");
    }

    let _ = writer.await;
    info!(%session_id, "session closed");
    Ok(())
}

async fn send_json(out_tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    out_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| anyhow!("client disconnected"))
}

async fn send_error(out_tx: &mpsc::Sender<Message>, message: impl Into<String>) {
    let _ = send_json(
        out_tx,
        &ServerMessage::Error {
            message: message.into(),
        },
    )
    .await;
}

/// Frames a TTS chunk as a small binary envelope: `segment_id: u64 LE`,
/// `sample_rate: u32 LE`, then raw PCM16 LE samples. Both this and the
/// JSON/base64 `tts_audio_chunk` event carry the same audio (§6).
fn encode_tts_binary_frame(segment_id: u64, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + samples.len() * 2);
    buf.extend_from_slice(&segment_id.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

type WsReceiver =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn run_session(
    session_id: Uuid,
    ws_receiver: &mut WsReceiver,
    server_config: &ServerConfig,
    adapters: &Adapters,
    out_tx: mpsc::Sender<Message>,
) -> Result<()> {
    send_json(
        &out_tx,
        &ServerMessage::Status {
            message: format!("session {session_id} connected"),
        },
    )
    .await?;

    let (source_lang, target_lang) = match recv_with_timeout(ws_receiver, server_config.idle_timeout()).await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Config {
                source_lang,
                target_lang,
            }) => (source_lang, target_lang),
            Ok(_) => {
                send_error(&out_tx, "first message must be config").await;
                bail!("first message must be config");
            }
            Err(e) => {
                send_error(&out_tx, format!("failed to parse config: {e}")).await;
                bail!("failed to parse config: {e}");
            }
        },
        Some(Ok(_)) => {
            send_error(&out_tx, "first message must be config").await;
            bail!("first message must be config");
        }
        Some(Err(e)) => bail!("websocket error before config: {e}"),
        None => bail!("connection closed or idle before config"),
    };

    info!(%session_id, source_lang, target_lang, "session configured");

    let config = OrchestratorConfig {
        source_lang,
        target_lang,
        window_seconds: server_config.window_seconds,
        asr_interval: Duration::from_millis(server_config.asr_interval_ms),
        commit_k: server_config.commit_stability_k,
        commit_timeout: Duration::from_secs_f32(server_config.commit_timeout_seconds),
        commit_min_words: server_config.commit_min_words,
        buffer_limit_ms: server_config.buffer_limit_ms,
        asr_call_timeout: server_config.asr_call_timeout(),
        mt_call_timeout: server_config.mt_call_timeout(),
        tts_call_timeout: server_config.tts_call_timeout(),
        ..OrchestratorConfig::default()
    };

    let (mut orchestrator, mut events) = Orchestrator::spawn(
        config,
        Arc::clone(&adapters.asr),
        Arc::clone(&adapters.mt),
        Arc::clone(&adapters.tts),
    );
    let input_sample_rate = orchestrator.input_sample_rate();

    let event_out_tx = out_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if forward_event(&event_out_tx, event).await.is_err() {
                break;
            }
        }
    });

    send_json(&out_tx, &ServerMessage::Ready).await?;

    loop {
        match recv_with_timeout(ws_receiver, server_config.idle_timeout()).await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Config { .. }) => {
                    send_error(&out_tx, "config already negotiated for this session").await;
                    break;
                }
                Ok(ClientMessage::Audio {
                    seq: _,
                    sample_rate,
                    pcm16_base64,
                }) => {
                    if sample_rate != input_sample_rate {
                        send_error(
                            &out_tx,
                            format!(
                                "sample_rate mismatch: negotiated {input_sample_rate}, got {sample_rate}"
                            ),
                        )
                        .await;
                        break;
                    }
                    match decode_pcm16(&pcm16_base64) {
                        Ok(samples) => orchestrator.append_audio(&samples),
                        Err(e) => {
                            send_error(&out_tx, format!("invalid audio frame: {e}")).await;
                            break;
                        }
                    }
                }
                Ok(ClientMessage::Stop) => {
                    info!(%session_id, "stop requested");
                    break;
                }
                Err(e) => {
                    send_error(&out_tx, format!("cannot parse message: {e}")).await;
                    break;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                send_error(&out_tx, "binary client frames are not supported").await;
                break;
            }
            Some(Ok(Message::Close(_))) => {
                info!(%session_id, "client closed connection");
                break;
            }
            Some(Err(e)) => {
                warn!(%session_id, error = %e, "websocket read error");
                break;
            }
            None => {
                info!(%session_id, "session idle timeout");
                break;
            }
        }
    }

    orchestrator.stop().await;
    let _ = event_task.await;
    Ok(())
}

async fn recv_with_timeout(
    ws_receiver: &mut WsReceiver,
    idle_timeout: Duration,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
        Ok(item) => item,
        Err(_) => None,
    }
}

fn decode_pcm16(b64: &str) -> Result<Vec<i16>> {
    let bytes = BASE64.decode(b64)?;
    if bytes.len() % 2 != 0 {
        bail!("pcm16 payload has odd byte length {}", bytes.len());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

async fn forward_event(out_tx: &mpsc::Sender<Message>, event: PipelineEvent) -> Result<()> {
    match event {
        PipelineEvent::PartialTranscript { text } => {
            send_json(out_tx, &ServerMessage::PartialTranscript { text }).await
        }
        PipelineEvent::CommittedTranscript { text, segment_id } => {
            send_json(out_tx, &ServerMessage::CommittedTranscript { text, segment_id }).await
        }
        PipelineEvent::TranslationCommitted {
            text,
            source,
            segment_id,
        } => {
            send_json(
                out_tx,
                &ServerMessage::TranslationCommitted {
                    text,
                    source,
                    segment_id,
                },
            )
            .await
        }
        PipelineEvent::TtsAudioChunk {
            samples,
            segment_id,
            sample_rate,
        } => {
            let pcm16_bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
            let audio_b64 = BASE64.encode(&pcm16_bytes);
            send_json(
                out_tx,
                &ServerMessage::TtsAudioChunk {
                    audio_b64,
                    segment_id,
                    sample_rate,
                },
            )
            .await?;
            let frame = encode_tts_binary_frame(segment_id, sample_rate, &samples);
            out_tx
                .send(Message::Binary(frame.into()))
                .await
                .map_err(|_| anyhow!("client disconnected"))
        }
        PipelineEvent::TtsEnd { segment_id } => {
            send_json(out_tx, &ServerMessage::TtsEnd { segment_id }).await
        }
        PipelineEvent::Stats {
            asr_ms,
            mt_ms,
            tts_ms,
            e2e_ms,
            commits_total,
            tts_queue,
        } => {
            send_json(
                out_tx,
                &ServerMessage::Stats {
                    asr_ms,
                    mt_ms,
                    tts_ms,
                    e2e_ms,
                    commits_total,
                    tts_queue,
                },
            )
            .await
        }
        PipelineEvent::Error { message, segment_id } => {
            let message = match segment_id {
                Some(id) => format!("segment {id}: {message}"),
                None => message,
            };
            send_json(out_tx, &ServerMessage::Error { message }).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_roundtrips_through_base64() {
        let samples: Vec<i16> = vec![1, -1, 32767, -32768, 0];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let b64 = BASE64.encode(&bytes);
        let decoded = decode_pcm16(&b64).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn odd_length_payload_is_rejected() {
        let b64 = BASE64.encode([1u8, 2, 3]);
        assert!(decode_pcm16(&b64).is_err());
    }

    #[test]
    fn binary_frame_carries_header_and_samples() {
        let samples = vec![10i16, -10, 20];
        let frame = encode_tts_binary_frame(42, 24_000, &samples);
        assert_eq!(frame.len(), 8 + 4 + samples.len() * 2);
        assert_eq!(u64::from_le_bytes(frame[0..8].try_into().unwrap()), 42);
        assert_eq!(u32::from_le_bytes(frame[8..12].try_into().unwrap()), 24_000);
    }
}
