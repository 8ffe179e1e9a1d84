//! Command-line driver for the portal submission coordinator.

pub mod forms;

pub use forms::{
    Cli, EquipmentArgs, EquipmentRequest, FormCommand, PermitArgs, PermitRequest, PhoneArgs,
    PhoneUpdate,
};
