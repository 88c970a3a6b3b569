//! ACSE negotiation rules.
//!
//! The functions here are pure:
//! they take the proposal and the local policy
//! and produce the negotiated outcome,
//! leaving PDU construction and socket I/O to the association builders.
//!
//! Covered here:
//! presentation context outcomes
//! (abstract syntax support, transfer syntax intersection
//! with acceptor preference order),
//! SCP/SCU role selection,
//! and the user identity response.

use std::borrow::Cow;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::pdu::{
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
};

/// Trim trailing whitespace and padding NULs from a UID.
///
/// Trailing characters of this kind are not significant on ingest.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(|c: char| c.is_whitespace() || c == '\0') {
        Cow::Owned(
            uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string(),
        )
    } else {
        uid
    }
}

/// Check that a transfer syntax repository supports the given
/// transfer syntax, meaning that data sets under it can be decoded.
///
/// ```
/// # use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
/// # use netdicom_ul::association::negotiation::is_supported_with_repo;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported_with_repo(TransferSyntaxRegistry, "1.2.840.10008.1.2"));
/// ```
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry supports the given
/// transfer syntax, meaning that data sets under it can be decoded.
///
/// ```
/// # use netdicom_ul::association::negotiation::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the given repository.
pub fn choose_supported_with_repo<R, I, T>(ts_repo: R, it: I) -> Option<T>
where
    R: TransferSyntaxIndex,
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter()
        .find(|ts| is_supported_with_repo(&ts_repo, ts.as_ref()))
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the main registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

/// Choose the transfer syntax for one presentation context:
/// the first entry of the acceptor's preference list
/// which also appears in the proposal and is decodable.
///
/// An empty acceptor list stands for
/// "anything the transfer syntax registry can decode",
/// in which case proposal order decides.
pub fn choose_transfer_syntax<'a>(
    acceptor_preference: &[Cow<'_, str>],
    proposed: &'a [String],
) -> Option<&'a str> {
    if acceptor_preference.is_empty() {
        return choose_supported(proposed.iter().map(|ts| ts.as_str()));
    }

    acceptor_preference.iter().find_map(|preferred| {
        proposed
            .iter()
            .map(|ts| ts.as_str())
            .find(|ts| trim_uid(Cow::from(*ts)) == *preferred && is_supported(ts))
    })
}

/// The local policy for one presentation context negotiation.
pub(crate) struct AcceptorPolicy<'a> {
    /// the abstract syntaxes this node serves
    pub abstract_syntax_uids: &'a [Cow<'a, str>],
    /// the transfer syntaxes this node accepts, in preference order
    /// (empty means anything decodable)
    pub transfer_syntax_uids: &'a [Cow<'a, str>],
    /// whether to accept unknown abstract syntaxes
    pub promiscuous: bool,
}

/// Negotiate a single proposed presentation context
/// against the local policy.
///
/// The accepted transfer syntax field of a rejected context is filled
/// with Implicit VR Little Endian,
/// since the field is not significant in that case
/// but must still be present on the wire.
pub(crate) fn negotiate_presentation_context(
    pc: PresentationContextProposed,
    policy: &AcceptorPolicy<'_>,
) -> PresentationContextNegotiated {
    let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax));

    if !policy.abstract_syntax_uids.contains(&abstract_syntax) && !policy.promiscuous {
        return PresentationContextNegotiated {
            id: pc.id,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            abstract_syntax: abstract_syntax.to_string(),
            local_scu: false,
            local_scp: true,
        };
    }

    let (transfer_syntax, reason) =
        match choose_transfer_syntax(policy.transfer_syntax_uids, &pc.transfer_syntaxes) {
            Some(ts) => (ts.to_string(), PresentationContextResultReason::Acceptance),
            None => (
                "1.2.840.10008.1.2".to_string(),
                PresentationContextResultReason::TransferSyntaxesNotSupported,
            ),
        };

    PresentationContextNegotiated {
        id: pc.id,
        reason,
        transfer_syntax,
        abstract_syntax: abstract_syntax.to_string(),
        local_scu: false,
        local_scp: true,
    }
}

impl From<&PresentationContextNegotiated> for PresentationContextResult {
    fn from(pc: &PresentationContextNegotiated) -> Self {
        PresentationContextResult {
            id: pc.id,
            reason: pc.reason.clone(),
            transfer_syntax: pc.transfer_syntax.clone(),
        }
    }
}

/// The agreed role distribution for one presentation context,
/// from the requestor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    /// the context is unusable: the acceptor declined both roles
    Rejected,
    /// requestor acts as SCU, acceptor as SCP
    Default,
    /// requestor acts as SCP, acceptor as SCU
    Reversed,
    /// both nodes may act as SCU and SCP
    Both,
}

/// Resolve the role selection outcome for one SOP class
/// from the requestor's proposal and the acceptor's answer.
///
/// When either side sent no role selection item,
/// default roles apply (requestor = SCU, acceptor = SCP).
/// Combinations which the role selection tables leave open
/// also resolve to the default,
/// except an answer declining both roles,
/// which leaves the context unusable.
pub fn resolve_roles(
    proposed: Option<&RoleSelection>,
    answered: Option<&RoleSelection>,
) -> RoleOutcome {
    let (proposed, answered) = match (proposed, answered) {
        (Some(p), Some(a)) => (p, a),
        _ => return RoleOutcome::Default,
    };

    match (
        proposed.scu_role,
        proposed.scp_role,
        answered.scu_role,
        answered.scp_role,
    ) {
        (_, _, false, false) => RoleOutcome::Rejected,
        (true, true, false, true) => RoleOutcome::Reversed,
        (true, true, true, false) => RoleOutcome::Default,
        (true, true, true, true) => RoleOutcome::Both,
        (true, false, true, _) => RoleOutcome::Default,
        (false, true, _, true) => RoleOutcome::Reversed,
        _ => RoleOutcome::Default,
    }
}

impl RoleOutcome {
    /// The local roles `(scu, scp)` granted by this outcome
    /// to the association requestor.
    pub fn requestor_roles(self) -> (bool, bool) {
        match self {
            RoleOutcome::Rejected => (false, false),
            RoleOutcome::Default => (true, false),
            RoleOutcome::Reversed => (false, true),
            RoleOutcome::Both => (true, true),
        }
    }

    /// The local roles `(scu, scp)` granted by this outcome
    /// to the association acceptor.
    pub fn acceptor_roles(self) -> (bool, bool) {
        match self {
            RoleOutcome::Rejected => (false, false),
            RoleOutcome::Default => (false, true),
            RoleOutcome::Reversed => (true, false),
            RoleOutcome::Both => (true, true),
        }
    }
}

/// Compute the acceptor's answer to a proposed role selection item,
/// given the roles the local node is willing to take
/// for that SOP class.
///
/// `willing` is the local `(scu, scp)` willingness
/// from the acceptor's perspective;
/// the answered item speaks about the *requestor's* roles,
/// so the two are crossed:
/// the requestor may keep the SCU role
/// only if the acceptor is willing to be an SCP, and vice versa.
pub(crate) fn answer_role_selection(
    proposed: &RoleSelection,
    willing: (bool, bool),
) -> RoleSelection {
    let (local_scu, local_scp) = willing;
    RoleSelection {
        sop_class_uid: proposed.sop_class_uid.clone(),
        scu_role: proposed.scu_role && local_scp,
        scp_role: proposed.scp_role && local_scu,
    }
}

/// Find the role selection item for a SOP class
/// in a list of user variables.
pub fn find_role_selection<'a>(
    user_variables: &'a [UserVariableItem],
    sop_class_uid: &str,
) -> Option<&'a RoleSelection> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::RoleSelection(role) if role.sop_class_uid == sop_class_uid => Some(role),
        _ => None,
    })
}

/// Find the user identity request in a list of user variables.
pub fn find_user_identity(user_variables: &[UserVariableItem]) -> Option<&UserIdentity> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::UserIdentityItem(identity) => Some(identity),
        _ => None,
    })
}

/// Fetch the maximum PDU length announced in a list of user variables,
/// mapping the "unlimited" marker of zero
/// to the largest expressible length.
pub fn peer_max_pdu_length(user_variables: &[UserVariableItem], fallback: u32) -> u32 {
    let length = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(fallback);
    if length == 0 {
        u32::MAX
    } else {
        length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn ts_list(uids: &[&str]) -> Vec<String> {
        uids.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn choose_supported_prefers_proposal_order() {
        assert_eq!(choose_supported(vec!["1.1.1.1.1"]), None);

        assert_eq!(
            choose_supported(vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE]),
            Some(IMPLICIT_VR_LE),
        );

        assert_eq!(
            choose_supported(vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()]),
            Some(EXPLICIT_VR_LE.to_string()),
        );
    }

    /// the acceptor's preference order decides the tie break
    #[test]
    fn acceptor_preference_order_wins() {
        let acceptor: Vec<Cow<'_, str>> =
            vec![Cow::from(EXPLICIT_VR_LE), Cow::from(IMPLICIT_VR_LE)];
        let proposed = ts_list(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE]);
        assert_eq!(
            choose_transfer_syntax(&acceptor, &proposed),
            Some(EXPLICIT_VR_LE)
        );
    }

    /// narrowing: requestor proposes a syntax the acceptor lacks,
    /// the common denominator is chosen
    #[test]
    fn transfer_syntax_narrowing() {
        let acceptor: Vec<Cow<'_, str>> = vec![Cow::from(IMPLICIT_VR_LE)];
        let proposed = ts_list(&[IMPLICIT_VR_LE, JPEG_BASELINE]);
        assert_eq!(
            choose_transfer_syntax(&acceptor, &proposed),
            Some(IMPLICIT_VR_LE)
        );
    }

    #[test]
    fn no_common_transfer_syntax() {
        let acceptor: Vec<Cow<'_, str>> = vec![Cow::from(EXPLICIT_VR_LE)];
        let proposed = ts_list(&[JPEG_BASELINE]);
        assert_eq!(choose_transfer_syntax(&acceptor, &proposed), None);
    }

    #[test]
    fn abstract_syntax_not_supported() {
        let policy = AcceptorPolicy {
            abstract_syntax_uids: &[Cow::from("1.2.840.10008.1.1")],
            transfer_syntax_uids: &[],
            promiscuous: false,
        };
        let pc = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.88.11".to_string(),
            transfer_syntaxes: ts_list(&[IMPLICIT_VR_LE]),
        };
        let negotiated = negotiate_presentation_context(pc, &policy);
        assert_eq!(
            negotiated.reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
    }

    fn role(scu: bool, scp: bool) -> RoleSelection {
        RoleSelection {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            scu_role: scu,
            scp_role: scp,
        }
    }

    #[test]
    fn role_selection_table() {
        // absent items: defaults
        assert_eq!(resolve_roles(None, None), RoleOutcome::Default);
        assert_eq!(resolve_roles(Some(&role(true, true)), None), RoleOutcome::Default);

        // acceptor declines both roles: unusable context
        assert_eq!(
            resolve_roles(Some(&role(true, true)), Some(&role(false, false))),
            RoleOutcome::Rejected
        );

        // requestor offers both, acceptor picks
        assert_eq!(
            resolve_roles(Some(&role(true, true)), Some(&role(false, true))),
            RoleOutcome::Reversed
        );
        assert_eq!(
            resolve_roles(Some(&role(true, true)), Some(&role(true, false))),
            RoleOutcome::Default
        );
        assert_eq!(
            resolve_roles(Some(&role(true, true)), Some(&role(true, true))),
            RoleOutcome::Both
        );

        // single-role proposals
        assert_eq!(
            resolve_roles(Some(&role(true, false)), Some(&role(true, false))),
            RoleOutcome::Default
        );
        assert_eq!(
            resolve_roles(Some(&role(false, true)), Some(&role(false, true))),
            RoleOutcome::Reversed
        );
    }

    #[test]
    fn role_reversal_grants_scp_to_requestor() {
        let outcome = resolve_roles(Some(&role(true, true)), Some(&role(false, true)));
        assert_eq!(outcome.requestor_roles(), (false, true));
        assert_eq!(outcome.acceptor_roles(), (true, false));
    }

    #[test]
    fn max_length_zero_means_unlimited() {
        let vars = vec![UserVariableItem::MaxLength(0)];
        assert_eq!(peer_max_pdu_length(&vars, 16_384), u32::MAX);
        assert_eq!(peer_max_pdu_length(&[], 16_384), 16_384);
    }
}
