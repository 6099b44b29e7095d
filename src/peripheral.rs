//! BlueZ-backed implementation of the peripheral-role capability trait.
//!
//! btleplug offers no GATT server role, so the peripheral side runs on
//! BlueZ directly. Each subscribing central hands us a notifier through the
//! characteristic's callback; notifiers are kept per characteristic and
//! dead ones are pruned on the next push.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicNotifier, CharacteristicRead, Service,
};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::{AdapterState, PeripheralAdapter, ServiceDefinition};
use crate::error::Result;

const STATE_CHANNEL_CAPACITY: usize = 8;

type NotifierMap = Arc<Mutex<HashMap<Uuid, Vec<CharacteristicNotifier>>>>;

/// Peripheral adapter over the host's default BlueZ adapter
pub struct BluezPeripheral {
    adapter: bluer::Adapter,
    _session: bluer::Session,
    adv_handle: Mutex<Option<bluer::adv::AdvertisementHandle>>,
    app_handle: Mutex<Option<ApplicationHandle>>,
    notifiers: NotifierMap,
}

impl BluezPeripheral {
    /// Bind to the host's default BlueZ adapter and power it on
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::Bluez`] when the session or adapter
    /// cannot be opened.
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(
            "peripheral using adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        Ok(Self {
            adapter,
            _session: session,
            adv_handle: Mutex::new(None),
            app_handle: Mutex::new(None),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl PeripheralAdapter for BluezPeripheral {
    async fn adapter_states(&self) -> Result<mpsc::Receiver<AdapterState>> {
        let (tx, rx) = mpsc::channel(STATE_CHANNEL_CAPACITY);

        let initial = if self.adapter.is_powered().await? {
            AdapterState::PoweredOn
        } else {
            AdapterState::PoweredOff
        };
        let _ = tx.send(initial).await;

        let mut events = self.adapter.events().await?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let bluer::AdapterEvent::PropertyChanged(bluer::AdapterProperty::Powered(on)) =
                    event
                {
                    let state = if on {
                        AdapterState::PoweredOn
                    } else {
                        AdapterState::PoweredOff
                    };
                    if tx.send(state).await.is_err() {
                        break;
                    }
                }
            }
            debug!("adapter event stream ended");
        });

        Ok(rx)
    }

    async fn start_advertising(&self, name: &str, service: Uuid) -> Result<()> {
        let mut slot = self.adv_handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let advertisement = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![service].into_iter().collect(),
            local_name: Some(name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        *slot = Some(self.adapter.advertise(advertisement).await?);
        info!("advertising as {name:?} with service {service}");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        if self.adv_handle.lock().await.take().is_some() {
            info!("advertising stopped");
        }
        Ok(())
    }

    async fn register_service(&self, service: ServiceDefinition) -> Result<()> {
        let mut slot = self.app_handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut characteristics = Vec::new();
        for definition in service.characteristics {
            let mut characteristic = Characteristic {
                uuid: definition.uuid,
                ..Default::default()
            };

            if let Some(value) = definition.read_value {
                characteristic.read = Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req| {
                        let value = value.clone();
                        async move { Ok(value) }.boxed()
                    }),
                    ..Default::default()
                });
            }

            if definition.notify {
                let notifiers = Arc::clone(&self.notifiers);
                let uuid = definition.uuid;
                characteristic.notify = Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                        let notifiers = Arc::clone(&notifiers);
                        async move {
                            debug!("central subscribed to {uuid}");
                            notifiers.lock().await.entry(uuid).or_default().push(notifier);
                        }
                        .boxed()
                    })),
                    ..Default::default()
                });
            }

            characteristics.push(characteristic);
        }

        let application = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        *slot = Some(self.adapter.serve_gatt_application(application).await?);
        info!("GATT service {} registered", service.uuid);
        Ok(())
    }

    async fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<usize> {
        let mut map = self.notifiers.lock().await;
        let Some(subscribers) = map.get_mut(&characteristic) else {
            return Ok(0);
        };

        let mut live = Vec::with_capacity(subscribers.len());
        let mut delivered = 0usize;
        for mut notifier in subscribers.drain(..) {
            if notifier.is_stopped() {
                continue;
            }
            match notifier.notify(payload.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    live.push(notifier);
                }
                Err(e) => warn!("dropping notification subscriber: {e}"),
            }
        }
        *subscribers = live;
        Ok(delivered)
    }
}
