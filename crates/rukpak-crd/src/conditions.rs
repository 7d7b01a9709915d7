//! Status condition helpers shared by `Bundle` and `BundleDeployment`.
//!
//! Conditions are plain `k8s_openapi` `Condition` values rather than a
//! bespoke type.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use std::time::SystemTime;

pub const TYPE_UNPACKED: &str = "Unpacked";
pub const TYPE_HAS_VALID_BUNDLE: &str = "HasValidBundle";
pub const TYPE_VALIDATED: &str = "Validated";
pub const TYPE_INSTALLED: &str = "Installed";
pub const TYPE_UPLOAD_STATUS: &str = "UploadStatus";
pub const TYPE_DYNAMIC_WATCHES_FAILED: &str = "DynamicWatchesFailed";

pub const REASON_UNPACK_PENDING: &str = "UnpackPending";
pub const REASON_UNPACKING: &str = "Unpacking";
pub const REASON_UNPACK_SUCCESSFUL: &str = "UnpackSuccessful";
pub const REASON_UNPACK_FAILED: &str = "UnpackFailed";
pub const REASON_UPLOAD_SUCCESSFUL: &str = "UploadSuccessful";
pub const REASON_INSTALLATION_SUCCEEDED: &str = "InstallationSucceeded";
pub const REASON_INSTALL_FAILED: &str = "InstallFailed";
pub const REASON_VALIDATION_SUCCEEDED: &str = "ValidationSucceeded";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_DYNAMIC_WATCHES_FAILED: &str = "DynamicWatchesFailed";
pub const REASON_DYNAMIC_WATCHES_ESTABLISHED: &str = "DynamicWatchesEstablished";

/// Builds (or updates in place) a condition within `conditions`, bumping
/// `lastTransitionTime` only when `status` actually changed and always
/// stamping the given `observed_generation` — conditions must carry a
/// monotone non-decreasing `observedGeneration` across reconciliations.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: i64,
) {
    let status_str = if status { "True" } else { "False" }.to_string();
    let now = Time(k8s_time_now());

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status_str {
            existing.last_transition_time = now;
        }
        existing.status = status_str;
        existing.reason = reason.to_string();
        existing.message = message.into();
        existing.observed_generation = Some(observed_generation);
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status_str,
        reason: reason.to_string(),
        message: message.into(),
        observed_generation: Some(observed_generation),
        last_transition_time: now,
    });
}

pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

fn k8s_time_now() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(SystemTime::now())
}
