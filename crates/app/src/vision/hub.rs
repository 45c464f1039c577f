//! Latest-value fan-out between the single producer and every viewer.
//!
//! The hub only ever holds the newest state. A viewer that falls behind skips
//! straight to the current frame instead of draining a backlog.

use std::sync::Arc;

use tokio::sync::watch;

use crate::vision::data::FramePacket;

#[derive(Clone, Debug)]
pub(crate) enum Feed {
    /// Nothing produced yet.
    Idle,
    Frame(Arc<FramePacket>),
    /// The capture device failed; sessions streaming at that moment end.
    Interrupted,
    /// The producer stopped for good.
    Closed,
}

#[derive(Clone)]
pub(crate) struct FrameHub {
    tx: Arc<watch::Sender<Feed>>,
}

impl FrameHub {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Feed::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn publish(&self, packet: FramePacket) {
        self.tx.send_replace(Feed::Frame(Arc::new(packet)));
    }

    pub(crate) fn interrupt(&self) {
        self.tx.send_replace(Feed::Interrupted);
    }

    pub(crate) fn close(&self) {
        self.tx.send_replace(Feed::Closed);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Feed> {
        self.tx.subscribe()
    }

    pub(crate) fn latest(&self) -> Option<Arc<FramePacket>> {
        match &*self.tx.borrow() {
            Feed::Frame(packet) => Some(packet.clone()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        matches!(&*self.tx.borrow(), Feed::Closed)
    }

    pub(crate) fn viewers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::testing::packet;

    #[test]
    fn latest_tracks_only_the_newest_frame() {
        let hub = FrameHub::new();
        assert!(hub.latest().is_none());

        hub.publish(packet(1));
        hub.publish(packet(2));
        assert_eq!(hub.latest().map(|p| p.frame_number), Some(2));

        hub.interrupt();
        assert!(hub.latest().is_none());
        assert!(!hub.is_closed());
        hub.close();
        assert!(hub.is_closed());
    }

    #[test]
    fn publishing_without_viewers_still_stores_the_frame() {
        let hub = FrameHub::new();
        assert_eq!(hub.viewers(), 0);
        hub.publish(packet(5));
        let rx = hub.subscribe();
        assert_eq!(hub.viewers(), 1);
        assert!(matches!(&*rx.borrow(), Feed::Frame(p) if p.frame_number == 5));
    }
}
