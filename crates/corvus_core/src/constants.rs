pub mod scopes {
    pub const ADMIN: &str = "admin";

    pub const JOB_SUBMIT: &str = "job:submit";
    pub const JOB_READ: &str = "job:read";
    pub const JOB_CANCEL: &str = "job:cancel";
}

pub mod routes {
    pub const HEALTH: &str = "/health";

    pub const JOBS: &str = "/jobs";
    pub const JOB_ANALYZE: &str = "/jobs/analyze";
    pub const JOB_BY_ID: &str = "/jobs/{id}";
    pub const JOB_CANCEL: &str = "/jobs/{id}/cancel";
    pub const JOB_LOGS: &str = "/jobs/{id}/logs";

    pub const POOLS: &str = "/pools";

    pub const METRICS_SUMMARY: &str = "/metrics/summary";
    pub const METRICS_USER: &str = "/metrics/user";
}

pub mod labels {
    pub const JOB_ID: &str = "corvus.job_id";
    pub const OWNER: &str = "corvus.owner";
    pub const PROFILE: &str = "corvus.profile";
}

/// Profile name that asks the engine to pick a profile from the script contents.
pub const AUTO_PROFILE: &str = "auto";
