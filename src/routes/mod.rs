/// Router Module Index
///
/// Routes are grouped by the session they require, and each group gets its access-control
/// layers at the router level so no endpoint can be mounted without them.

/// Unauthenticated routes (health).
pub mod public;

/// Routes behind an admin session. Permission checks happen per handler against the RBAC cache.
pub mod admin;

/// Routes behind a gallery session. Media fetches additionally pass the media gatekeeper.
pub mod gallery;
