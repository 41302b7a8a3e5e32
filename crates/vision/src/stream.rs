//! Per-viewer MJPEG sink.
//!
//! Every viewer gets its own lazy stream that polls the shared
//! [`FramePublisher`] slot. There is no fan-out buffer: a slow or vanished
//! viewer only affects its own stream.

use std::{sync::Arc, time::Duration};

use async_stream::stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

use crate::data::{FramePacket, FramePublisher};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone, Copy, Debug)]
pub struct SinkOptions {
    /// Wait before re-polling when nothing new has been published.
    pub idle_retry: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            idle_retry: Duration::from_millis(10),
        }
    }
}

/// One multipart part: boundary, headers, JPEG bytes.
pub fn multipart_chunk(packet: &FramePacket) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
        packet.jpeg.len(),
        packet.sequence
    );
    let mut chunk = BytesMut::with_capacity(header.len() + packet.jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(&packet.jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Endless stream of multipart chunks for a single viewer.
///
/// A chunk is emitted only for a frame newer than the last one this viewer
/// received, then the sink sleeps for the producer's frame interval. Dropping
/// the stream is the only cancellation needed.
pub fn mjpeg_stream(
    publisher: Arc<FramePublisher>,
    options: SinkOptions,
) -> impl Stream<Item = Bytes> + Send + 'static {
    stream! {
        let mut last_sent = 0u64;
        loop {
            match publisher.latest() {
                Some(packet) if packet.sequence > last_sent => {
                    last_sent = packet.sequence;
                    let pace = frame_pace(packet.target_fps);
                    yield multipart_chunk(&packet);
                    tokio::time::sleep(pace).await;
                }
                _ => tokio::time::sleep(options.idle_retry).await,
            }
        }
    }
}

fn frame_pace(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn packet(sequence: u64, payload: &[u8]) -> FramePacket {
        FramePacket {
            jpeg: Bytes::copy_from_slice(payload),
            sequence,
            timestamp_ms: 0,
            width: 1,
            height: 1,
            target_fps: 100,
        }
    }

    fn fast() -> SinkOptions {
        SinkOptions {
            idle_retry: Duration::from_millis(1),
        }
    }

    #[test]
    fn chunk_layout() {
        let chunk = multipart_chunk(&packet(7, b"JPEG"));
        let expected = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\nX-Sequence: 7\r\n\r\nJPEG\r\n";
        assert_eq!(&chunk[..], &expected[..]);
    }

    #[tokio::test]
    async fn sink_waits_for_first_frame() {
        let publisher = Arc::new(FramePublisher::new());
        let sink = mjpeg_stream(publisher.clone(), fast());
        tokio::pin!(sink);

        let pending = tokio::time::timeout(Duration::from_millis(30), sink.next()).await;
        assert!(pending.is_err(), "no frame should be emitted yet");

        publisher.publish(packet(1, b"A"));
        let chunk = sink.next().await.unwrap();
        assert!(chunk.ends_with(b"A\r\n"));
    }

    #[tokio::test]
    async fn sink_never_repeats_or_regresses() {
        let publisher = Arc::new(FramePublisher::new());
        publisher.publish(packet(1, b"A"));
        let sink = mjpeg_stream(publisher.clone(), fast());
        tokio::pin!(sink);

        assert!(sink.next().await.unwrap().ends_with(b"A\r\n"));
        let repeat = tokio::time::timeout(Duration::from_millis(40), sink.next()).await;
        assert!(repeat.is_err(), "same frame must not be sent twice");

        publisher.publish(packet(2, b"B"));
        assert!(sink.next().await.unwrap().ends_with(b"B\r\n"));
    }

    #[tokio::test]
    async fn dropping_one_viewer_leaves_others_untouched() {
        let publisher = Arc::new(FramePublisher::new());
        let mut viewers: Vec<_> = (0..3)
            .map(|_| Box::pin(mjpeg_stream(publisher.clone(), fast())))
            .collect();

        let mut received: Vec<Vec<Bytes>> = vec![Vec::new(); 3];
        for sequence in 1..=4u64 {
            publisher.publish(packet(sequence, format!("frame-{sequence}").as_bytes()));
            if sequence == 3 {
                viewers.remove(1);
                received.remove(1);
            }
            for (viewer, log) in viewers.iter_mut().zip(received.iter_mut()) {
                log.push(viewer.next().await.unwrap());
            }
        }

        assert_eq!(viewers.len(), 2);
        let expected: Vec<Bytes> = (1..=4u64)
            .map(|sequence| multipart_chunk(&packet(sequence, format!("frame-{sequence}").as_bytes())))
            .collect();
        assert_eq!(received[0], expected);
        assert_eq!(received[1], expected);
    }
}
