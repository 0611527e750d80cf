// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A VIF plugin which plugs guest network interfaces into a vRouter.
//!
//! The compute service hands the plugin a [`VifDescriptor`] and an
//! [`InstanceInfo`]; [`VrouterPlugin`] creates whatever local device the VIF
//! needs and registers the port with the vRouter through a
//! [`port_control::PortControl`] backend.

pub mod config;
pub mod dispatch;
pub mod instance;
pub mod interface;
pub mod plugin;
pub mod port;
pub mod port_control;
pub mod vif;

pub use config::Config;
pub use instance::InstanceInfo;
pub use plugin::{PlugError, UnplugError, VrouterPlugin};
pub use vif::{Vif, VifDescriptor, VifError};
