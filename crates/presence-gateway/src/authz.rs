//! Topic join authorization.
//!
//! `can_join` is pure: it looks only at the identity, the topic and, for call
//! topics, the recorded participants of that call. Callers resolve the
//! participants before asking.

use crate::identity::Identity;
use crate::topic::Topic;

/// Returns whether `identity` may join `topic`.
///
/// `call_participants` is `(caller_id, callee_id)` of the call named by a
/// `call:<id>` topic, or `None` when the call is unknown. It is ignored for
/// every other topic.
#[must_use]
pub fn can_join(
    identity: &Identity,
    topic: &Topic,
    call_participants: Option<(&str, &str)>,
) -> bool {
    match topic {
        Topic::User(user_id) => identity.user_id == *user_id,
        Topic::Role(role) => identity.role.as_ref().is_some_and(|r| r.as_str() == role),
        Topic::Org(org_id) => identity.organization_id.as_deref() == Some(org_id.as_str()),
        Topic::Patient(patient_id) => identity.is_care_team() || identity.user_id == *patient_id,
        Topic::AlertsAll => identity.is_care_team(),
        Topic::Call(_) => call_participants.is_some_and(|(caller, callee)| {
            identity.user_id == caller || identity.user_id == callee
        }),
    }
}
