use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use serde::Serialize;

/// One encoded frame as handed to viewers.
#[derive(Clone, Debug)]
pub struct FramePacket {
    pub jpeg: Bytes,
    /// Strictly increasing per published frame, starting at 1.
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    /// Frame rate the producer is pacing to; sinks pace to the same rate.
    pub target_fps: u32,
}

/// Metadata of the latest frame, without the payload.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct FrameInfo {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

impl FramePacket {
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            width: self.width,
            height: self.height,
            bytes: self.jpeg.len(),
        }
    }
}

/// Single-slot hand-off of the newest encoded frame.
///
/// The lock is held only to swap or clone the packet; the payload is
/// reference counted so readers never copy the JPEG bytes.
#[derive(Debug, Default)]
pub struct FramePublisher {
    slot: Mutex<Option<FramePacket>>,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with `packet`. Packets that are not newer than the
    /// current one are ignored; returns whether the slot changed.
    pub fn publish(&self, packet: FramePacket) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|current| current.sequence >= packet.sequence)
        {
            return false;
        }
        *slot = Some(packet);
        true
    }

    /// Current frame, or `None` if nothing has been published yet. Never waits.
    pub fn latest(&self) -> Option<FramePacket> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn packet(sequence: u64) -> FramePacket {
        FramePacket {
            jpeg: Bytes::from(vec![sequence as u8; 4]),
            sequence,
            timestamp_ms: sequence as i64,
            width: 2,
            height: 2,
            target_fps: 20,
        }
    }

    #[test]
    fn latest_is_empty_until_first_publish() {
        let publisher = FramePublisher::new();
        assert!(publisher.latest().is_none());
        assert!(publisher.publish(packet(1)));
        assert_eq!(publisher.latest().unwrap().sequence, 1);
    }

    #[test]
    fn publish_replaces_and_rejects_stale_packets() {
        let publisher = FramePublisher::new();
        publisher.publish(packet(2));
        assert!(!publisher.publish(packet(1)));
        assert!(!publisher.publish(packet(2)));
        assert!(publisher.publish(packet(3)));
        let latest = publisher.latest().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(&latest.jpeg[..], &[3, 3, 3, 3]);
    }

    #[test]
    fn concurrent_readers_observe_monotonic_sequences() {
        let publisher = Arc::new(FramePublisher::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2_000 {
                        if let Some(packet) = publisher.latest() {
                            assert!(packet.sequence >= last);
                            last = packet.sequence;
                        }
                    }
                })
            })
            .collect();
        for sequence in 1..=500 {
            publisher.publish(packet(sequence));
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(publisher.latest().unwrap().sequence, 500);
    }
}
