//! Label and annotation keys placed on managed deployments.

/// Marks a deployment as owned by the fleet operator.
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY`] on every deployment this system owns.
pub const MANAGED_BY_VALUE: &str = "fleet-operator";

/// Queue the deployment serves. Exactly one queue per deployment.
pub const QUEUE_ID: &str = "fleet.dev/queue-id";

pub const QUEUE_NAME: &str = "fleet.dev/queue-name";
pub const ENVIRONMENT: &str = "fleet.dev/environment";
pub const COMPONENT: &str = "app.kubernetes.io/component";

/// Config version the deployment was last rendered from.
pub const CONFIG_VERSION_ANNOTATION: &str = "fleet.dev/config-version";

/// Package version the deployment was last rendered from.
pub const PACKAGE_VERSION_ANNOTATION: &str = "fleet.dev/package-version";

/// Prefix applied to queue tags when copied onto deployment labels.
pub const TAG_PREFIX: &str = "fleet.dev/tag-";
