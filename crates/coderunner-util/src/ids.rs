use uuid::Uuid;

/// Globally unique job identifier, assigned at enqueue time.
pub type JobId = Uuid;

/// Generates a fresh job id. Thin wrapper so callers don't need a direct `uuid` dependency
/// just to mint one.
pub fn new_job_id() -> JobId {
    Uuid::new_v4()
}
