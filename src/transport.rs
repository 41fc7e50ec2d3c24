//! Connected GATT access to a trap.
//!
//! [`GattTransport`] is all the tracker needs from the BLE stack. The
//! btleplug implementation connects on demand, performs one operation and
//! disconnects again, so the trap is free to keep advertising in between.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as _, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use log::{debug, warn};
use mac_address::MacAddress;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::TransportError;

#[async_trait]
pub trait GattTransport: Send + Sync {
    async fn read(&self, address: MacAddress, characteristic: Uuid)
    -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        address: MacAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

pub struct BtleplugTransport {
    adapter: Adapter,
    timeout: Duration,
}

impl BtleplugTransport {
    const CONNECT_RETRIES: u32 = 2;
    const DISCOVERY_POLL: Duration = Duration::from_millis(500);

    pub fn new(adapter: Adapter, timeout: Duration) -> Self {
        BtleplugTransport { adapter, timeout }
    }

    /// Scan until `address` shows up or `wait` elapses. Only needed when no
    /// scan is already running on the adapter.
    pub async fn discover(&self, address: MacAddress, wait: Duration) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(failure)?;

        let found = timeout(wait, async {
            loop {
                if self.find_peripheral(address).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Self::DISCOVERY_POLL).await;
            }
        })
        .await;

        if let Err(err) = self.adapter.stop_scan().await {
            debug!("Error stopping scan: {}", err);
        }
        found.map_err(|_| TransportError::NotFound(address.to_string()))
    }

    async fn find_peripheral(&self, address: MacAddress) -> Result<Peripheral, TransportError> {
        let peripherals = self.adapter.peripherals().await.map_err(failure)?;
        for peripheral in peripherals {
            if MacAddress::new(peripheral.address().into_inner()) == address {
                return Ok(peripheral);
            }
        }
        Err(TransportError::NotFound(address.to_string()))
    }

    async fn connect(peripheral: &Peripheral) -> Result<(), TransportError> {
        if !peripheral.is_connected().await.map_err(failure)? {
            let mut retries = Self::CONNECT_RETRIES;
            loop {
                match peripheral.connect().await {
                    Ok(()) => break,
                    Err(err) if retries > 0 => {
                        warn!("Failed to connect to {}: {}", peripheral.address(), err);
                        retries -= 1;
                    }
                    Err(err) => return Err(failure(err)),
                }
            }
        }

        peripheral.discover_services().await.map_err(failure)
    }

    async fn read_once(
        peripheral: &Peripheral,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        Self::connect(peripheral).await?;
        let c = find_characteristic(peripheral, characteristic)?;
        peripheral.read(&c).await.map_err(failure)
    }

    async fn write_once(
        peripheral: &Peripheral,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        Self::connect(peripheral).await?;
        let c = find_characteristic(peripheral, characteristic)?;
        peripheral
            .write(&c, value, WriteType::WithResponse)
            .await
            .map_err(failure)
    }

    async fn lookup(&self, address: MacAddress) -> Result<Peripheral, TransportError> {
        timeout(self.timeout, self.find_peripheral(address))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn disconnect(peripheral: &Peripheral) {
        if let Err(err) = peripheral.disconnect().await {
            debug!("Error disconnecting from {}: {}", peripheral.address(), err);
        }
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| TransportError::Failure(format!("characteristic {uuid} not found")))
}

/// Run `operation` for at most `limit`, then `cleanup`, whether the operation
/// finished, failed or timed out. btleplug keeps a link open when a connected
/// operation is dropped halfway.
async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, TransportError>>,
    cleanup: impl Future<Output = ()>,
) -> Result<T, TransportError> {
    let result = timeout(limit, operation)
        .await
        .unwrap_or(Err(TransportError::Timeout));
    cleanup.await;
    result
}

fn failure(err: btleplug::Error) -> TransportError {
    TransportError::Failure(err.to_string())
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn read(
        &self,
        address: MacAddress,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.lookup(address).await?;
        let data = bounded(
            self.timeout,
            Self::read_once(&peripheral, characteristic),
            Self::disconnect(&peripheral),
        )
        .await?;
        debug!("Read {} from {}: {}", characteristic, address, hex::encode(&data));
        Ok(data)
    }

    async fn write(
        &self,
        address: MacAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.lookup(address).await?;
        bounded(
            self.timeout,
            Self::write_once(&peripheral, characteristic, value),
            Self::disconnect(&peripheral),
        )
        .await?;
        debug!("Wrote {} to {}: {}", characteristic, address, hex::encode(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_bounded_cleans_up_after_timeout() {
        let cleaned_up = AtomicBool::new(false);
        let result: Result<(), _> = bounded(
            Duration::from_millis(10),
            futures::future::pending(),
            async { cleaned_up.store(true, Ordering::SeqCst) },
        )
        .await;
        assert_eq!(result, Err(TransportError::Timeout));
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bounded_cleans_up_after_success_and_failure() {
        let counter = AtomicUsize::new(0);
        let cleanups = &counter;
        let cleanup = || async move {
            cleanups.fetch_add(1, Ordering::SeqCst);
        };

        let ok = bounded(Duration::from_secs(1), async { Ok(vec![0x01]) }, cleanup()).await;
        assert_eq!(ok, Ok(vec![0x01]));

        let failed: Result<(), _> = bounded(
            Duration::from_secs(1),
            async { Err(TransportError::Failure("link lost".to_string())) },
            cleanup(),
        )
        .await;
        assert_eq!(failed, Err(TransportError::Failure("link lost".to_string())));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
