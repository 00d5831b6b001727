//! Radio abstraction
//!
//! The scanner and session talk to the radio only through these traits, so
//! the btleplug backend and the simulated backend are interchangeable.

use crate::domain::errors::BleError;
use crate::domain::models::{Characteristic, PeripheralHandle, Service, WriteKind};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One advertisement as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// Advertisements, in the order the radio reports them
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Notification payloads from one characteristic; ends when the link drops
pub type FrameStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// BLE central role: scanning and connecting
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start an indefinite scan
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Establish the physical link
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Arc<dyn BleLink>, BleError>;

    /// Drop any OS-level link to `peripheral` that no [`BleLink`] owns
    ///
    /// A connect abandoned by timeout or teardown may still complete in the
    /// platform stack; this releases it. No-op when nothing is connected.
    async fn disconnect_peripheral(&self, peripheral: &PeripheralHandle) -> Result<(), BleError>;
}

/// An established link to one peripheral
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Full service/characteristic enumeration
    async fn discover_services(&self) -> Result<Vec<Service>, BleError>;

    /// Enable notifications (or indications) on a characteristic
    async fn subscribe(&self, characteristic: &Characteristic) -> Result<FrameStream, BleError>;

    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError>;

    /// Ask for elevated priority / pairing; advisory only
    async fn request_bonding(&self) -> Result<(), BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;
}

/// Adapt an mpsc receiver into a stream that ends when every sender is gone
pub(crate) fn receiver_stream<T: Send + 'static>(
    receiver: mpsc::UnboundedReceiver<T>,
) -> Pin<Box<dyn Stream<Item = T> + Send>> {
    Box::pin(futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_receiver_stream_ends_with_senders() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = receiver_stream(rx);

        tx.send(vec![1u8]).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(vec![1u8]));
        assert_eq!(stream.next().await, None);
    }
}
