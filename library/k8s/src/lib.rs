pub mod client;
pub mod errors;
pub mod pod;
pub mod quantity;
pub mod watch;

pub use client::{ClientProvider, PodApi};
pub use pod::PodExt;
pub use quantity::ComputeResources;

/// The label under which every batch pod carries the identifier of the job it
/// belongs to. A pod without this label is NOT batch work and the executor will
/// never touch it.
pub const JOB_ID_LABEL: &str = "job_id";

/// The label under which every batch pod carries its 0-indexed position within
/// its job. Multi-pod jobs produce one pod per index; single pod jobs carry "0".
pub const POD_NUMBER_LABEL: &str = "pod_number";

/// The annotation carrying the name of the queue the job was submitted to.
pub const QUEUE_ANNOTATION: &str = "queue";

/// The annotation carrying the job set that the job belongs to. Job sets are the
/// unit of event subscription, so every event the executor reports must be able
/// to recover this value from the pod alone.
pub const JOB_SET_ANNOTATION: &str = "job_set_id";

/// The annotation carrying the submitting user, used for impersonated
/// resubmission and for attribution in usage reports.
pub const OWNER_ANNOTATION: &str = "owner";
