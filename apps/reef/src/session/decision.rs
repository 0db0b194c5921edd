//! The decision engine: pure functions over a context snapshot, no I/O.
//!
//! Every (re)connect the server emits one `session_state` message; the
//! router snapshots everything relevant into a [`SessionContext`] and this
//! module decides what code the editor should display and whether the
//! outcome gets persisted as a local backup. Keeping it pure means every
//! reconnect race is a table-driven unit test.

use serde::Serialize;

use reef_proto::{Draft, Participant, SessionRole};

/// Ephemeral, per-reconciliation snapshot. Constructed fresh for each
/// `session_state` message and never persisted.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Whether an auth token is present (authenticated user).
    pub has_token: bool,
    /// Tab-scoped pointer to the currently open saved strudel.
    pub current_strudel_id: Option<String>,
    /// Raw tab-scoped draft pointer; may dangle.
    pub current_draft_id: Option<String>,
    /// The pointer resolved against durable storage (None when dangling).
    pub current_draft: Option<Draft>,
    /// Draft with the maximum `updated_at` among all durable drafts.
    pub latest_draft: Option<Draft>,
    /// True once this logical session has established its working state.
    pub initial_load_complete: bool,
    /// Explicit "do not restore anything" request from the embedder.
    pub skip_code_restoration: bool,
    /// Correlation id carried by the inbound message, if any.
    pub request_id: Option<String>,
    pub role: SessionRole,
    pub participants: Vec<Participant>,
    /// Server-authoritative code from the payload.
    pub server_code: Option<String>,
    pub default_code: String,
}

impl SessionContext {
    /// A collaborative session: someone other than a solo owner is involved,
    /// so server state is authoritative.
    pub fn is_live_session(&self) -> bool {
        self.role != SessionRole::Owner || self.participants.len() > 1
    }

    /// Draft preference order: the tab's own pointer wins over the newest
    /// draft anywhere, which may belong to another tab.
    fn preferred_draft(&self) -> Option<(&Draft, DraftSource)> {
        if let Some(draft) = self.current_draft.as_ref() {
            return Some((draft, DraftSource::CurrentPointer));
        }
        self.latest_draft
            .as_ref()
            .map(|draft| (draft, DraftSource::LatestDurable))
    }
}

/// Which source supplied a restored draft. Load-bearing: the fork-then-
/// refresh race is only distinguishable through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftSource {
    CurrentPointer,
    LatestDurable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ExplicitSkip,
    AlreadyEstablished,
}

/// What "current code" should be.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeAction {
    RestoreDraft { draft: Draft, source: DraftSource },
    UseServerCode { code: String },
    UseDefaultCode { code: String },
    SkipCodeUpdate { reason: SkipReason },
}

/// Where a backup write lands. Fresh ids are minted by the router, keeping
/// the engine deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    Strudel(String),
    ExistingDraft(String),
    FreshDraft,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DraftSaveDecision {
    Skip,
    Save { target: SaveTarget, code: String },
}

impl DraftSaveDecision {
    pub fn should_save(&self) -> bool {
        matches!(self, DraftSaveDecision::Save { .. })
    }
}

/// Redacted observability snapshot: presence flags and counts only, never
/// code content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionDebug {
    pub role: SessionRole,
    pub participant_count: usize,
    pub has_token: bool,
    pub has_server_code: bool,
    pub had_current_draft_pointer: bool,
    pub had_current_draft: bool,
    pub had_latest_draft: bool,
    pub had_strudel_pointer: bool,
    pub initial_load_complete: bool,
    pub skip_code_restoration: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub code_action: CodeAction,
    pub draft_save: DraftSaveDecision,
    pub debug: DecisionDebug,
}

/// Classify what "current code" should be. Strict priority order; the first
/// matching rule wins.
pub fn decide_code_action(ctx: &SessionContext) -> CodeAction {
    // 1. Embedder asked to leave the editor alone.
    if ctx.skip_code_restoration {
        return CodeAction::SkipCodeUpdate {
            reason: SkipReason::ExplicitSkip,
        };
    }

    // 2. Reconnect within the same logical session. Server-pushed state must
    // never override in-progress local edits once the tab has established
    // its working state.
    if ctx.initial_load_complete {
        return CodeAction::SkipCodeUpdate {
            reason: SkipReason::AlreadyEstablished,
        };
    }

    // 3. Live session: server code is authoritative.
    if ctx.is_live_session() {
        return match ctx.server_code.as_ref() {
            Some(code) => CodeAction::UseServerCode { code: code.clone() },
            None => CodeAction::UseDefaultCode {
                code: ctx.default_code.clone(),
            },
        };
    }

    // 4. Solo, unauthenticated: local drafts are the only place work lives.
    if !ctx.has_token {
        if let Some((draft, source)) = ctx.preferred_draft() {
            return CodeAction::RestoreDraft {
                draft: draft.clone(),
                source,
            };
        }
    }

    // 5. Solo, authenticated, nothing saved open: drafts still win.
    if ctx.has_token && ctx.current_strudel_id.is_none() {
        if let Some((draft, source)) = ctx.preferred_draft() {
            return CodeAction::RestoreDraft {
                draft: draft.clone(),
                source,
            };
        }
    }

    // 6. A saved strudel is open: it is authoritative over any local backup.
    if ctx.has_token && ctx.current_strudel_id.is_some() {
        if let Some(code) = ctx.server_code.as_ref() {
            return CodeAction::UseServerCode { code: code.clone() };
        }
    }

    // 7./8. Whatever the server has, else the default pattern.
    match ctx.server_code.as_ref() {
        Some(code) => CodeAction::UseServerCode { code: code.clone() },
        None => CodeAction::UseDefaultCode {
            code: ctx.default_code.clone(),
        },
    }
}

/// Decide whether the outcome of `decide_code_action` should be written back
/// to durable storage.
pub fn decide_draft_save(ctx: &SessionContext, action: &CodeAction) -> DraftSaveDecision {
    match action {
        // Saving here would overwrite the draft just restored, or save when
        // nothing changed.
        CodeAction::RestoreDraft { .. } | CodeAction::SkipCodeUpdate { .. } => {
            DraftSaveDecision::Skip
        }

        // Back up server-authoritative code locally so it survives a future
        // offline session. Keyed by the open strudel when there is one.
        CodeAction::UseServerCode { code } => {
            let target = if let Some(strudel_id) = ctx.current_strudel_id.as_ref() {
                SaveTarget::Strudel(strudel_id.clone())
            } else if let Some(draft_id) = ctx.current_draft_id.as_ref() {
                SaveTarget::ExistingDraft(draft_id.clone())
            } else {
                SaveTarget::FreshDraft
            };
            DraftSaveDecision::Save {
                target,
                code: code.clone(),
            }
        }

        // Falling back to default code must never stomp an existing draft
        // just because this tab doesn't see it yet.
        CodeAction::UseDefaultCode { code } => {
            if ctx.current_draft.is_none() && ctx.latest_draft.is_none() {
                let target = match ctx.current_draft_id.as_ref() {
                    Some(draft_id) => SaveTarget::ExistingDraft(draft_id.clone()),
                    None => SaveTarget::FreshDraft,
                };
                DraftSaveDecision::Save {
                    target,
                    code: code.clone(),
                }
            } else {
                DraftSaveDecision::Skip
            }
        }
    }
}

/// Compose the code action and save decision with a redacted debug snapshot.
pub fn process_session_state(ctx: &SessionContext) -> Decision {
    let code_action = decide_code_action(ctx);
    let draft_save = decide_draft_save(ctx, &code_action);
    let debug = DecisionDebug {
        role: ctx.role,
        participant_count: ctx.participants.len(),
        has_token: ctx.has_token,
        has_server_code: ctx.server_code.is_some(),
        had_current_draft_pointer: ctx.current_draft_id.is_some(),
        had_current_draft: ctx.current_draft.is_some(),
        had_latest_draft: ctx.latest_draft.is_some(),
        had_strudel_pointer: ctx.current_strudel_id.is_some(),
        initial_load_complete: ctx.initial_load_complete,
        skip_code_restoration: ctx.skip_code_restoration,
    };
    Decision {
        code_action,
        draft_save,
        debug,
    }
}
