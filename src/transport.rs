//! Transport bindings connect an entity to its remote entities.
//!
//! A [TransportBinding] carries typed [Pdu]s. Bindings also report reachability windows of the
//! remote entities to their [TransportListener]s, which freeze and thaw the affected
//! transactions.
use std::sync::{Arc, Mutex, Weak};

use spacepackets::util::UnsignedEnum;

use crate::pdu::Pdu;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("receiver disconnected")]
    Disconnected,
    #[error("transport queue full")]
    QueueFull,
    #[error("no route to entity {0}")]
    NoRoute(u64),
    #[error("transport error: {0}")]
    Other(String),
}

/// Receives everything a binding delivers to the local entity.
pub trait TransportListener: Send + Sync {
    fn indication(&self, pdu: Pdu);
    fn start_tx_period(&self, remote_id: u64);
    fn end_tx_period(&self, remote_id: u64);
    fn start_rx_period(&self, remote_id: u64);
    fn end_rx_period(&self, remote_id: u64);
}

/// Transport binding used by all transactions with the remote entities it serves. `send` may be
/// called concurrently by multiple transaction workers.
pub trait TransportBinding: Send + Sync {
    /// Whether the binding can reach the given remote entity.
    fn serves(&self, remote_id: u64) -> bool;
    fn send(&self, pdu: &Pdu, remote_id: u64) -> Result<(), TransportError>;
    fn subscribe(&self, listener: Arc<dyn TransportListener>);
}

/// Returns the PDUs which should be dropped instead of being delivered.
pub type DropFilter = Box<dyn FnMut(&Pdu) -> bool + Send>;

#[derive(Default)]
struct LoopbackPort {
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
}

impl LoopbackPort {
    fn listeners(&self) -> Vec<Arc<dyn TransportListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// In-process transport between two entities. PDUs are handed to the listeners of the peer
/// binding on the sending thread.
pub struct LoopbackTransport {
    local_id: u64,
    remote_id: u64,
    port: Arc<LoopbackPort>,
    peer: Weak<LoopbackPort>,
    drop_filter: Mutex<Option<DropFilter>>,
}

impl LoopbackTransport {
    /// Creates both ends of a loopback link between two entities.
    pub fn pair(
        first_id: impl UnsignedEnum,
        second_id: impl UnsignedEnum,
    ) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let first_port = Arc::new(LoopbackPort::default());
        let second_port = Arc::new(LoopbackPort::default());
        let first = Arc::new(LoopbackTransport {
            local_id: first_id.value(),
            remote_id: second_id.value(),
            port: first_port.clone(),
            peer: Arc::downgrade(&second_port),
            drop_filter: Mutex::new(None),
        });
        let second = Arc::new(LoopbackTransport {
            local_id: second_id.value(),
            remote_id: first_id.value(),
            port: second_port,
            peer: Arc::downgrade(&first_port),
            drop_filter: Mutex::new(None),
        });
        (first, second)
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Installs a filter for PDUs sent through this end of the link.
    pub fn set_drop_filter(&self, filter: impl FnMut(&Pdu) -> bool + Send + 'static) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Opens or closes the transmission window towards the remote entity, as seen by the local
    /// entity.
    pub fn set_tx_opportunity(&self, open: bool) {
        for listener in self.port.listeners() {
            if open {
                listener.start_tx_period(self.remote_id);
            } else {
                listener.end_tx_period(self.remote_id);
            }
        }
    }

    /// Opens or closes the reception window from the remote entity, as seen by the local entity.
    pub fn set_rx_opportunity(&self, open: bool) {
        for listener in self.port.listeners() {
            if open {
                listener.start_rx_period(self.remote_id);
            } else {
                listener.end_rx_period(self.remote_id);
            }
        }
    }

    /// Delivers a PDU to the local entity as if the peer had sent it.
    pub fn inject(&self, pdu: Pdu) {
        for listener in self.port.listeners() {
            listener.indication(pdu.clone());
        }
    }
}

impl TransportBinding for LoopbackTransport {
    fn serves(&self, remote_id: u64) -> bool {
        remote_id == self.remote_id
    }

    fn send(&self, pdu: &Pdu, remote_id: u64) -> Result<(), TransportError> {
        if remote_id != self.remote_id {
            return Err(TransportError::NoRoute(remote_id));
        }
        if let Some(filter) = self
            .drop_filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            if filter(pdu) {
                log::debug!("loopback {}: dropping {}", self.local_id, pdu);
                return Ok(());
            }
        }
        let peer = self.peer.upgrade().ok_or(TransportError::Disconnected)?;
        log::trace!("loopback {}: sending {}", self.local_id, pdu);
        for listener in peer.listeners() {
            listener.indication(pdu.clone());
        }
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn TransportListener>) {
        self.port
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use spacepackets::cfdp::{Direction, TransmissionMode};

    use super::*;
    use crate::{
        pdu::{tests::header, KeepAlivePdu, PduPayload},
        tests::{LOCAL_ID, REMOTE_ID},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ListenerEvent {
        Pdu(Pdu),
        TxPeriod(u64, bool),
        RxPeriod(u64, bool),
    }

    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<ListenerEvent>>,
    }

    impl TransportListener for RecordingListener {
        fn indication(&self, pdu: Pdu) {
            self.events.lock().unwrap().push(ListenerEvent::Pdu(pdu));
        }
        fn start_tx_period(&self, remote_id: u64) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::TxPeriod(remote_id, true));
        }
        fn end_tx_period(&self, remote_id: u64) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::TxPeriod(remote_id, false));
        }
        fn start_rx_period(&self, remote_id: u64) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::RxPeriod(remote_id, true));
        }
        fn end_rx_period(&self, remote_id: u64) {
            self.events
                .lock()
                .unwrap()
                .push(ListenerEvent::RxPeriod(remote_id, false));
        }
    }

    /// Records every PDU sent through it.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<(Pdu, u64)>>,
        pub fail_sends: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        pub fn take(&self) -> Vec<Pdu> {
            self.sent
                .lock()
                .unwrap()
                .drain(..)
                .map(|(pdu, _)| pdu)
                .collect()
        }
    }

    impl TransportBinding for RecordingTransport {
        fn serves(&self, _remote_id: u64) -> bool {
            true
        }

        fn send(&self, pdu: &Pdu, remote_id: u64) -> Result<(), TransportError> {
            if self.fail_sends.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(TransportError::Other("send failure".into()));
            }
            self.sent.lock().unwrap().push((pdu.clone(), remote_id));
            Ok(())
        }

        fn subscribe(&self, _listener: Arc<dyn TransportListener>) {}
    }

    fn keep_alive(progress: u64) -> Pdu {
        Pdu::new(
            header(TransmissionMode::Acknowledged, Direction::TowardsSender),
            PduPayload::KeepAlive(KeepAlivePdu { progress }),
        )
    }

    #[test]
    fn test_loopback_delivery() {
        let (local, remote) = LoopbackTransport::pair(LOCAL_ID, REMOTE_ID);
        let listener = Arc::new(RecordingListener::default());
        remote.subscribe(listener.clone());
        assert!(local.serves(REMOTE_ID.value()));
        assert!(!local.serves(LOCAL_ID.value()));
        local.send(&keep_alive(10), REMOTE_ID.value()).unwrap();
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![ListenerEvent::Pdu(keep_alive(10))]
        );
        assert_eq!(
            local.send(&keep_alive(10), 7),
            Err(TransportError::NoRoute(7))
        );
    }

    #[test]
    fn test_loopback_drop_filter() {
        let (local, remote) = LoopbackTransport::pair(LOCAL_ID, REMOTE_ID);
        let listener = Arc::new(RecordingListener::default());
        remote.subscribe(listener.clone());
        local.set_drop_filter(|pdu| matches!(pdu.payload, PduPayload::KeepAlive(ka) if ka.progress == 2));
        for progress in 0..4 {
            local.send(&keep_alive(progress), REMOTE_ID.value()).unwrap();
        }
        assert_eq!(listener.events.lock().unwrap().len(), 3);
        local.clear_drop_filter();
        local.send(&keep_alive(2), REMOTE_ID.value()).unwrap();
        assert_eq!(listener.events.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_loopback_opportunities() {
        let (local, _remote) = LoopbackTransport::pair(LOCAL_ID, REMOTE_ID);
        let listener = Arc::new(RecordingListener::default());
        local.subscribe(listener.clone());
        local.set_tx_opportunity(false);
        local.set_rx_opportunity(false);
        local.set_rx_opportunity(true);
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![
                ListenerEvent::TxPeriod(REMOTE_ID.value(), false),
                ListenerEvent::RxPeriod(REMOTE_ID.value(), false),
                ListenerEvent::RxPeriod(REMOTE_ID.value(), true),
            ]
        );
    }

    #[test]
    fn test_loopback_peer_gone() {
        let (local, remote) = LoopbackTransport::pair(LOCAL_ID, REMOTE_ID);
        drop(remote);
        assert_eq!(
            local.send(&keep_alive(1), REMOTE_ID.value()),
            Err(TransportError::Disconnected)
        );
    }
}
