/// The token the caller presented, stashed in request extensions by the
/// token middleware for handlers that need it (completion auth, client
/// token capture on submit).
#[derive(Debug, Clone)]
pub struct AuthToken(pub String);

/// The runner version accepted by the version-gate middleware.
#[derive(Debug, Clone)]
pub struct RunnerVersion(pub String);
