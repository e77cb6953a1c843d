use crate::limits::AUTO_APPROVE_PARTICIPANT_LIMIT;
use crate::model::BookingStatus;

/// Whether a booking needs an approver's sign-off. Small meetings with no
/// special requests, no notes and no equipment are auto-approved.
pub fn needs_approval(
    participants: u32,
    extra_requests: &str,
    notes: &str,
    has_equipment: bool,
) -> bool {
    participants >= AUTO_APPROVE_PARTICIPANT_LIMIT
        || !extra_requests.trim().is_empty()
        || !notes.trim().is_empty()
        || has_equipment
}

/// Initial status for a new booking.
pub fn initial_status(
    participants: u32,
    extra_requests: &str,
    notes: &str,
    has_equipment: bool,
) -> BookingStatus {
    if needs_approval(participants, extra_requests, notes, has_equipment) {
        BookingStatus::Pending
    } else {
        BookingStatus::Approved
    }
}

/// Re-decision after an edit. Demote-only: edited content that fails the
/// policy pulls the booking back to Pending, but content that starts passing
/// it never promotes Pending to Approved — the pre-edit status stands.
pub fn edited_status(
    current: BookingStatus,
    participants: u32,
    extra_requests: &str,
    notes: &str,
    has_equipment: bool,
) -> BookingStatus {
    if needs_approval(participants, extra_requests, notes, has_equipment) {
        BookingStatus::Pending
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_simple_meeting_auto_approves() {
        assert_eq!(initial_status(5, "", "", false), BookingStatus::Approved);
        assert_eq!(initial_status(14, "", "", false), BookingStatus::Approved);
    }

    #[test]
    fn large_meeting_pends() {
        assert_eq!(initial_status(15, "", "", false), BookingStatus::Pending);
        assert_eq!(initial_status(20, "", "", false), BookingStatus::Pending);
    }

    #[test]
    fn requests_notes_or_equipment_pend() {
        assert_eq!(initial_status(5, "need catering", "", false), BookingStatus::Pending);
        assert_eq!(initial_status(5, "", "vip visit", false), BookingStatus::Pending);
        assert_eq!(initial_status(5, "", "", true), BookingStatus::Pending);
    }

    #[test]
    fn whitespace_only_text_is_empty() {
        assert_eq!(initial_status(5, "   ", "\t\n", false), BookingStatus::Approved);
    }

    #[test]
    fn edit_demotes_approved_when_policy_fails() {
        assert_eq!(
            edited_status(BookingStatus::Approved, 20, "", "", false),
            BookingStatus::Pending
        );
        assert_eq!(
            edited_status(BookingStatus::Approved, 5, "projector please", "", false),
            BookingStatus::Pending
        );
    }

    #[test]
    fn edit_never_promotes_pending() {
        // Content now passes the policy, but the booking stays Pending.
        assert_eq!(
            edited_status(BookingStatus::Pending, 5, "", "", false),
            BookingStatus::Pending
        );
    }

    #[test]
    fn edit_keeps_approved_when_policy_still_passes() {
        assert_eq!(
            edited_status(BookingStatus::Approved, 8, "", "", false),
            BookingStatus::Approved
        );
    }
}
