//! Shared connection handle with an explicit Disconnected/Connected cycle.

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use super::{Driver, Store};
use crate::error::ConnectionError;

/// Owns a driver and at most one connected store.
///
/// `store()` fails fast with `NotConnected` while disconnected.
/// `disconnect()` waits for outstanding `store()` guards to drop.
pub struct Lifecycle<D: Driver> {
    driver: D,
    store: RwLock<Option<D::Store>>,
}

impl<D: Driver> Lifecycle<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            store: RwLock::new(None),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn is_connected(&self) -> bool {
        self.store.read().await.is_some()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut slot = self.store.write().await;
        if slot.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }
        *slot = Some(self.driver.connect().await?);
        info!("store connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let store = self
            .store
            .write()
            .await
            .take()
            .ok_or(ConnectionError::NotConnected)?;
        store.disconnect().await?;
        info!("store disconnected");
        Ok(())
    }

    pub async fn store(&self) -> Result<RwLockReadGuard<'_, D::Store>, ConnectionError> {
        let guard = self.store.read().await;
        RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| {
            debug!("store access while disconnected");
            ConnectionError::NotConnected
        })
    }
}
