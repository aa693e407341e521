//! Fleet reconcilers.

mod machine_status;

pub use machine_status::MachineStatusController;
