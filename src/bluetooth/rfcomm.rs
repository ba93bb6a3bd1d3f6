//! RFCOMM channel setup for the Serial Port Profile.
//!
//! BlueZ resolves the SDP record and the RFCOMM channel itself: we register a
//! client profile for the service UUID, ask the device to connect that
//! profile, and accept the socket BlueZ hands back through the profile.

use bluer::{
   Adapter, Address, Session,
   rfcomm::{ConnectRequest, Profile, ProfileHandle, Role},
};
use futures::StreamExt;
use log::{debug, info};
use tokio::select;
use uuid::Uuid;

use crate::{
   bluetooth::platform::Channel,
   error::{ConnectorError, Result},
};

const PROFILE_NAME: &str = "Serial Port";

/// Opens a secure RFCOMM channel to `address` on `uuid`.
///
/// The returned channel keeps the profile registration alive; dropping it
/// closes the socket and unregisters the profile.
pub async fn connect(
   session: &Session,
   adapter: &Adapter,
   address: Address,
   uuid: Uuid,
) -> Result<Channel> {
   debug!("Registering RFCOMM client profile {uuid}");
   let profile = Profile {
      uuid,
      name: Some(PROFILE_NAME.to_string()),
      role: Some(Role::Client),
      require_authentication: Some(true),
      require_authorization: Some(false),
      auto_connect: Some(false),
      ..Default::default()
   };
   let mut handle = session.register_profile(profile).await?;

   let device = adapter.device(address)?;
   debug!("Connecting {address} on profile {uuid}");
   let request = wait_for_request(&device, &mut handle, address, uuid).await?;

   let stream = request.accept()?;
   info!("RFCOMM channel to {address} established");

   let (inbound, outbound) = stream.into_split();
   Ok(Channel::new(Box::new(inbound), Box::new(outbound)).with_guard(handle))
}

async fn wait_for_request(
   device: &bluer::Device,
   handle: &mut ProfileHandle,
   address: Address,
   uuid: Uuid,
) -> Result<ConnectRequest> {
   let connecting = device.connect_profile(&uuid);
   tokio::pin!(connecting);
   let mut profile_connected = false;

   loop {
      select! {
         res = &mut connecting, if !profile_connected => {
            res?;
            profile_connected = true;
         },
         req = handle.next() => {
            let Some(req) = req else {
               return Err(ConnectorError::ConnectionFailed("profile unregistered".into()));
            };
            if req.device() == address {
               return Ok(req);
            }
            // Dropping the request rejects it.
            debug!("Ignoring RFCOMM request from {}", req.device());
         },
      }
   }
}
