// Background Jobs
//
// The execution scheduler polls each tenant for due workflow executions and
// runs the periodic maintenance sweep on its own interval.

pub mod maintenance;
pub mod scheduler;

pub use maintenance::{JobStatus, MaintenanceJobs, SweepReport};
pub use scheduler::{ExecutionScheduler, TickReport};
