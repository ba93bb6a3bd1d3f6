use std::str::FromStr;

use bluer::Address;
use log::info;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::manager::Connector;

pub const BUS_NAME: &str = "org.sppconnector";
pub const OBJECT_PATH: &str = "/org/sppconnector/connector";

pub struct ConnectorService {
   connector: Connector,
}

impl ConnectorService {
   pub const fn new(connector: Connector) -> Self {
      Self { connector }
   }
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.sppconnector.Connector")]
impl ConnectorService {
   async fn start_discovery(&self) -> zbus::fdo::Result<bool> {
      self.connector.start_discovery().await.map_err(failed)?;
      Ok(true)
   }

   async fn stop_discovery(&self) -> zbus::fdo::Result<bool> {
      self.connector.stop_discovery().await.map_err(failed)
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self.connector.connect(addr).await.map_err(failed)?;
      info!("Connected to {addr} on request");
      Ok(true)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.connector.disconnect().await.map_err(failed)
   }

   async fn request_enable(&self) -> zbus::fdo::Result<String> {
      let state = self.connector.request_enable().await.map_err(failed)?;
      Ok(state.label().to_string())
   }

   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .connector
         .devices()
         .into_iter()
         .map(|d| json!({ "address": d.address.to_string(), "name": d.name }))
         .collect();
      Ok(serde_json::Value::Array(devices).to_string())
   }

   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let status = self.connector.status();
      let state: &'static str = status.state.into();
      Ok(json!({
         "address": status.address.map(|a| a.to_string()),
         "state": state,
      })
      .to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn on_success(
      emitter: &SignalEmitter<'_>,
      tag: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn on_error(emitter: &SignalEmitter<'_>, tag: &str, message: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(
      emitter: &SignalEmitter<'_>,
      address: &str,
      bytes: &[u8],
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn adapter_state(&self) -> String {
      self
         .connector
         .adapter_state()
         .map(|s| s.label().to_string())
         .unwrap_or_default()
   }
}
