//! Classification of instance-creation failures reported by managed groups.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use regex::RegexSet;

use crate::core::types::ErrorClass;
use crate::core::types::ErrorCode;
use crate::core::types::InstanceErrorInfo;
use crate::platform::gce::wire::OperationErrorItem;

static VM_EXTERNAL_IP_ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Constraint constraints/compute\.vmExternalIpAccess violated for project")
        .expect("valid regex")
});

static UNSUPPORTED_TPU: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(unsupported|invalid|not supported).*\bTPU\b.*(configuration|topology)")
        .expect("valid regex")
});

static RESERVATION_NOT_READY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Cannot insert instance to a reservation with status: CREATING")
        .expect("valid regex")
});

static INVALID_RESERVATION: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"Incompatible AggregateReservation VMFamily",
        r"Could not find the given reservation with the following name",
        r"must use ReservationAffinity of",
        r"The reservation must exist in the same project as the instance",
        r"only compatible with Aggregate Reservations",
        r"Please target a reservation with workload_type",
        r"AggregateReservation VMFamily: .* should be a (?:TPU|GPU) VMFamily",
        r"VM Family: .* is not supported for aggregate reservations",
        r"Reservation .* is incorrect for the requested resources",
        r"Zone does not currently have sufficient capacity for the requested resources",
    ])
    .expect("valid regex set")
});

static RESERVATION_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Specified reservation '.*' does not exist").expect("valid regex")
});

static RESERVATION_CAPACITY_EXCEEDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Specified reservation '.*' does not have available resources for the request")
        .expect("valid regex")
});

const RESERVATION_INCOMPATIBLE: &str = "does not match the properties of the reservation";

fn is_resource_pool_exhausted(code: &str) -> bool {
    matches!(
        code,
        "RESOURCE_POOL_EXHAUSTED"
            | "ZONE_RESOURCE_POOL_EXHAUSTED"
            | "ZONE_RESOURCE_POOL_EXHAUSTED_WITH_DETAILS"
    )
}

fn is_instance_status_not_running_yet(status: &str) -> bool {
    matches!(status, "" | "PROVISIONING" | "STAGING")
}

/// Classifies one error of the last creation attempt.
///
/// The first matching predicate decides. When nothing matches and the instance has not started
/// yet, `previous` is kept (or `Other` when there is none); otherwise the error is ignored.
pub fn get_error_info(
    code: &str,
    message: &str,
    instance_status: &str,
    previous: Option<&InstanceErrorInfo>,
) -> Option<InstanceErrorInfo> {
    let classified = |class, code| {
        Some(InstanceErrorInfo {
            class,
            code,
            message: String::new(),
        })
    };

    if is_resource_pool_exhausted(code) {
        classified(ErrorClass::OutOfResources, ErrorCode::ResourcePoolExhausted)
    } else if code.contains("QUOTA") {
        classified(ErrorClass::OutOfResources, ErrorCode::QuotaExceeded)
    } else if code.contains("IP_SPACE_EXHAUSTED") {
        classified(ErrorClass::Other, ErrorCode::IpSpaceExhausted)
    } else if code.contains("PERMISSIONS_ERROR") {
        classified(ErrorClass::Other, ErrorCode::PermissionsError)
    } else if code.contains("CONDITION_NOT_MET") && VM_EXTERNAL_IP_ACCESS.is_match(message) {
        classified(
            ErrorClass::Other,
            ErrorCode::VmExternalIpAccessPolicyConstraint,
        )
    } else if code.contains("CONDITION_NOT_MET") && UNSUPPORTED_TPU.is_match(message) {
        classified(ErrorClass::Other, ErrorCode::UnsupportedTpuConfiguration)
    } else if RESERVATION_NOT_READY.is_match(message) {
        classified(ErrorClass::Other, ErrorCode::ReservationNotReady)
    } else if INVALID_RESERVATION.is_match(message) {
        classified(ErrorClass::Other, ErrorCode::InvalidReservation)
    } else if RESERVATION_NOT_FOUND.is_match(message) {
        classified(ErrorClass::Other, ErrorCode::ReservationNotFound)
    } else if RESERVATION_CAPACITY_EXCEEDED.is_match(message) {
        classified(ErrorClass::Other, ErrorCode::ReservationCapacityExceeded)
    } else if message.contains(RESERVATION_INCOMPATIBLE) {
        classified(ErrorClass::Other, ErrorCode::ReservationIncompatible)
    } else if is_instance_status_not_running_yet(instance_status) {
        match previous {
            Some(previous) => Some(previous.clone()),
            None => classified(ErrorClass::Other, ErrorCode::Other),
        }
    } else {
        None
    }
}

/// Folds all errors of the last attempt into one [`InstanceErrorInfo`]; the last match wins and
/// messages of matched errors are joined with `"; "`.
///
/// Every seen error code is tallied into `code_counts`.
pub fn attribute_errors(
    errors: &[OperationErrorItem],
    instance_status: &str,
    code_counts: &mut BTreeMap<String, usize>,
) -> Option<InstanceErrorInfo> {
    let mut info: Option<InstanceErrorInfo> = None;
    let mut messages = Vec::new();
    for error in errors {
        *code_counts.entry(error.code.clone()).or_default() += 1;
        let Some(next) = get_error_info(&error.code, &error.message, instance_status, info.as_ref())
        else {
            continue;
        };
        info = Some(next);
        if !error.message.is_empty() {
            messages.push(error.message.as_str());
        }
    }
    info.map(|mut info| {
        info.message = messages.join("; ");
        info
    })
}
