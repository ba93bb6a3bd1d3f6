//! Bluetooth layer for the serial port connector.
//!
//! The components here talk to the radio only through the [`Platform`]
//! trait; [`bluez`] is the production implementation.
//!
//! [`Platform`]: platform::Platform

pub mod adapter;
pub mod bluez;
pub mod connection;
pub mod discovery;
pub mod manager;
pub mod platform;
pub(crate) mod reader;
pub mod rfcomm;

#[cfg(test)]
pub(crate) mod mock;
