//! Channel over a byte stream (pipe, socket, child stdio).
//!
//! Frames are JSON documents in length-prefixed frames (see
//! [`crate::protocol::codec`]). A frame that fails to parse is surfaced to
//! the local side as [`ChannelEvent::Error`]; EOF or an I/O error closes the
//! channel.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{pair, ChannelEvent, Port};
use crate::protocol::codec::{decode_value, encode_value, read_frame, write_frame};
use crate::types::StreamConfig;

/// Bridge a reader/writer pair into a [`Port`].
///
/// Spawns one reader task and one writer task on the current runtime. Both
/// stop when the returned port (or the stream) closes.
pub fn connect<R, W>(reader: R, writer: W, config: StreamConfig) -> Port
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (local, bridge) = pair();
    let (to_local, mut from_local) = bridge.split();

    let closer = to_local.clone();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(event) = from_local.recv().await {
            let ChannelEvent::Message(frame) = event else {
                continue;
            };
            let payload = match encode_value(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("Frame encoding failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &payload).await {
                tracing::warn!("Stream write failed, closing channel: {}", e);
                break;
            }
        }
        closer.close();
    });

    tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let read = tokio::select! {
                biased;
                _ = to_local.closed() => break,
                read = read_frame(&mut reader, config.max_frame_bytes) => read,
            };
            let payload = match read {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::debug!("Stream reached EOF, closing channel");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Stream read failed, closing channel: {}", e);
                    break;
                }
            };
            let event = match decode_value(&payload) {
                Ok(frame) => ChannelEvent::Message(frame),
                Err(e) => ChannelEvent::Error(e.to_string()),
            };
            if to_local.post_event(event).is_err() {
                break;
            }
        }
        to_local.close();
    });

    local
}
