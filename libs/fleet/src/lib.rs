//! # anvil-fleet
//!
//! Machine lifecycle and status reconciliation for the fleet control plane.
//!
//! This crate plugs the domain into the generic store and controller
//! runtime:
//!
//! - Fleet resource types (`Machine`, `MachineStatus`,
//!   `MachineStatusSnapshot`, `MachineLabels`) as a tagged spec enum
//! - The per-machine collector task polling a managed node through the
//!   [`client::NodeClient`] seam and coalescing results into an
//!   [`collector::Info`] snapshot
//! - The `MachineStatus` controller deriving the status resource from the
//!   machine, its collector info, user labels, and event snapshots
//! - Schematic identity resolution from extension statuses

pub mod client;
pub mod collector;
pub mod controllers;
pub mod meta;
pub mod mock;
pub mod resources;
pub mod schematic;
