// =============================================================================
// Palaver Matrix Homeserver - Event VM Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The event evaluation pipeline: an ordered sequence of phases that
//   validates, authorizes, applies and persists each event. Options carry a
//   mask of enabled phases, fault dispositions (accept/warn/reject) and the
//   write-appendix regions to touch. Events within a room evaluate in
//   depth-then-arrival order under the per-room lock; cross-room
//   evaluations proceed concurrently.
//
// Features:
//   • Individually maskable phases
//   • Fault masks for accept/warn/reject dispositions
//   • Atomic rejection before the commit point
//   • Post-commit phases that never unwind a committed event
//   • Global commit sequence for age computation
//
// Architecture:
//   • Fetch phases run before the room lock is taken; nested evaluations
//     therefore never re-enter a held lock
//
// Dependencies:
//   • Tokio async runtime
//   • Structured logging with tracing
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/server-server-api/
//
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    canonical::{self, CanonicalObject},
    mxid::{EventId, ServerName, UserId},
    service::{
        fetch::FetchOpts,
        pdu::{self, EventType, PduEvent, RoomVersion},
        rooms::auth::{self, AuthState},
    },
    services, Error, ErrorKind, Result,
};

/// A named stage of the evaluation pipeline, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Phase {
    Execute = 0,
    Issue,
    Conform,
    Access,
    Verify,
    FetchAuth,
    AuthStatic,
    FetchPrev,
    FetchState,
    AuthRelative,
    Evaluate,
    Index,
    Post,
    Notify,
    Effects,
}

/// A set of enabled phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseMask(u32);

impl PhaseMask {
    pub const ALL: Self = Self(u32::MAX);

    pub fn has(&self, phase: Phase) -> bool {
        self.0 & (1 << phase as u32) != 0
    }

    pub fn set(&mut self, phase: Phase, enabled: bool) {
        if enabled {
            self.0 |= 1 << phase as u32;
        } else {
            self.0 &= !(1 << phase as u32);
        }
    }
}

impl Default for PhaseMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// The fault emitted by a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Fault {
    /// Evaluation succeeded.
    Accept = 0,
    /// The event is already indexed.
    Exists,
    /// Unspecified failure.
    General,
    /// The event is malformed or semantically invalid.
    Invalid,
    /// Authorization denied under the room rules.
    Auth,
    /// Required state is missing or unresolvable.
    State,
    /// The event's identity did not check out: bad hash, signature or ID.
    Event,
    /// The event exceeds the size bound.
    BufOverflow,
    /// Cooperative cancellation.
    Interrupt,
}

/// A set of faults, used for the accept/warn/reject dispositions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultMask(u16);

impl FaultMask {
    pub const ALL: Self = Self(u16::MAX);

    pub fn has(&self, fault: Fault) -> bool {
        self.0 & (1 << fault as u16) != 0
    }

    pub fn set(&mut self, fault: Fault, enabled: bool) {
        if enabled {
            self.0 |= 1 << fault as u16;
        } else {
            self.0 &= !(1 << fault as u16);
        }
    }

    pub fn with(mut self, fault: Fault) -> Self {
        self.set(fault, true);
        self
    }

    pub fn without(mut self, fault: Fault) -> Self {
        self.set(fault, false);
        self
    }
}

/// A persisted write-appendix region touched by the commit phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Appendix {
    RoomHead = 0,
    RoomEvents,
    RoomState,
    EventRefs,
    EventJson,
    Keys,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendixMask(u8);

impl AppendixMask {
    pub const ALL: Self = Self(u8::MAX);

    pub fn has(&self, appendix: Appendix) -> bool {
        self.0 & (1 << appendix as u8) != 0
    }

    pub fn set(&mut self, appendix: Appendix, enabled: bool) {
        if enabled {
            self.0 |= 1 << appendix as u8;
        } else {
            self.0 &= !(1 << appendix as u8);
        }
    }
}

impl Default for AppendixMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Options for one evaluation: enabled phases, fault dispositions, and
/// per-phase modifiers.
#[derive(Clone, Debug)]
pub struct Opts {
    pub phase: PhaseMask,

    /// Faults treated as success; evaluation of the event stops there.
    pub accept: FaultMask,
    /// Faults logged at warning level. A warned fault that is neither
    /// accepted nor rejected lets evaluation continue.
    pub warn: FaultMask,
    /// Faults that abort the event. A fault in none of the three masks is
    /// logged and evaluation continues.
    pub reject: FaultMask,

    /// Log accepted events at info level.
    pub infolog_accept: bool,
    /// Announce committed events to federation peers.
    pub notify_servers: bool,
    /// The caller already holds the room state mutex.
    pub state_lock_held: bool,

    /// Write-appendix regions the commit phases may touch.
    pub appendix: AppendixMask,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            phase: PhaseMask::ALL,
            accept: FaultMask::default().with(Fault::Accept).with(Fault::Exists),
            warn: FaultMask::default().with(Fault::Exists),
            reject: FaultMask::ALL,
            infolog_accept: false,
            notify_servers: true,
            state_lock_held: false,
            appendix: AppendixMask::ALL,
        }
    }
}

impl Opts {
    /// The options the acquirer evaluates backfill responses with: the
    /// acquirer supplies parents itself, so recursive fetching is off, and
    /// old events must not disturb the room head.
    pub fn for_backfill() -> Self {
        let mut opts = Self {
            infolog_accept: true,
            notify_servers: false,
            ..Default::default()
        };
        opts.warn.set(Fault::Exists, false);
        opts.phase.set(Phase::Notify, false);
        opts.phase.set(Phase::FetchPrev, false);
        opts.phase.set(Phase::FetchState, false);
        opts.appendix.set(Appendix::RoomHead, false);
        opts
    }
}

/// The terminal result of evaluating one event.
#[derive(Clone, Debug)]
pub enum Outcome {
    Accepted {
        event_id: Option<EventId>,
        fault: Option<Fault>,
    },
    Rejected {
        event_id: Option<EventId>,
        fault: Fault,
    },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    pub fn fault(&self) -> Option<Fault> {
        match self {
            Outcome::Accepted { fault, .. } => *fault,
            Outcome::Rejected { fault, .. } => Some(*fault),
        }
    }
}

enum Flow {
    Continue,
    Accept(Fault),
    Reject(Fault),
}

pub struct Service {
    /// Increases with every committed event; clients use it for age display.
    sequence: AtomicU64,
    notify: watch::Sender<u64>,
}

impl Service {
    pub fn new(initial_sequence: u64) -> Self {
        Self {
            sequence: AtomicU64::new(initial_sequence),
            notify: watch::channel(initial_sequence).0,
        }
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(AtomicOrdering::SeqCst)
    }

    /// A receiver that observes the commit sequence advancing.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Evaluates a batch of events in depth-then-arrival order.
    ///
    /// Only interrupts propagate as errors; per-event failures surface as
    /// rejected outcomes.
    pub fn eval<'a>(
        &'a self,
        pdus: Vec<CanonicalObject>,
        opts: &'a Opts,
    ) -> BoxFuture<'a, Result<Vec<Outcome>>> {
        Box::pin(async move {
            let mut ordered = pdus;
            ordered.sort_by_key(|object| {
                object.get("depth").and_then(Value::as_i64).unwrap_or(i64::MAX)
            });

            let mut outcomes = Vec::with_capacity(ordered.len());
            for object in ordered {
                services().globals.interruption_point()?;
                outcomes.push(self.eval_one(object, opts).await?);
            }

            Ok(outcomes)
        })
    }

    /// Evaluates a single event through the phase pipeline.
    pub async fn eval_one(&self, object: CanonicalObject, opts: &Opts) -> Result<Outcome> {
        // The execute gate: do nothing unless invoked.
        if !opts.phase.has(Phase::Execute) {
            return Ok(Outcome::Accepted { event_id: None, fault: None });
        }

        macro_rules! phase {
            ($event_id:expr, $phase:expr, $result:expr) => {
                if opts.phase.has($phase) {
                    let fault = match $result {
                        Ok(fault) => fault,
                        Err(e) if e.is_interrupt() => return Err(e),
                        Err(e) => {
                            warn!(phase = ?$phase, "phase error: {}", e);
                            Some(fault_for(&e))
                        }
                    };

                    if let Some(fault) = fault {
                        match self.dispose(opts, $phase, fault, $event_id.as_ref()) {
                            Flow::Continue => {}
                            Flow::Accept(fault) => {
                                return Ok(Outcome::Accepted {
                                    event_id: $event_id.clone(),
                                    fault: Some(fault),
                                })
                            }
                            Flow::Reject(fault) => {
                                return Ok(Outcome::Rejected {
                                    event_id: $event_id.clone(),
                                    fault,
                                })
                            }
                        }
                    }
                }
            };
        }

        // The typed view is needed by every later phase; a shape failure is
        // an ISSUE fault even when that phase is masked off.
        let mut event_id: Option<EventId> = None;
        let parsed = self.issue(&object);
        let mut pdu = match parsed {
            Ok(pdu) => pdu,
            Err(e) => {
                let fault = if opts.phase.has(Phase::Issue) { fault_for(&e) } else { Fault::Invalid };
                return Ok(match self.dispose(opts, Phase::Issue, fault, None) {
                    Flow::Accept(fault) => Outcome::Accepted { event_id: None, fault: Some(fault) },
                    _ => Outcome::Rejected { event_id: None, fault },
                });
            }
        };

        let room_version = self.room_version_for(&pdu);

        // Room-version 3+ identifiers derive from the content.
        if !room_version.server_based_ids() {
            match pdu::derive_event_id(&object, room_version, services().globals.server_name()) {
                Ok(derived) => pdu.event_id = Some(derived),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(_) => {
                    return Ok(Outcome::Rejected { event_id: None, fault: Fault::Invalid })
                }
            }
        }
        event_id.clone_from(&pdu.event_id);

        phase!(event_id, Phase::Issue, self.issue_checks(&object));
        phase!(event_id, Phase::Conform, self.conform(&object, &pdu, room_version));
        phase!(event_id, Phase::Access, self.access(&pdu));
        phase!(event_id, Phase::Verify, self.verify(&object, &pdu, room_version));

        // Fetch phases run before the room lock so nested evaluations never
        // re-enter it.
        phase!(event_id, Phase::FetchAuth, self.fetch_referenced(&pdu, true, opts).await);
        phase!(event_id, Phase::AuthStatic, self.auth_static(&pdu));
        phase!(event_id, Phase::FetchPrev, self.fetch_referenced(&pdu, false, opts).await);
        phase!(event_id, Phase::FetchState, self.fetch_state(&pdu));

        let state_mutex = services().globals.room_mutex_state(&pdu.room_id).await;
        let _state_lock = if opts.state_lock_held {
            None
        } else {
            Some(state_mutex.lock().await)
        };

        phase!(event_id, Phase::AuthRelative, self.auth_relative(&pdu));
        phase!(event_id, Phase::Evaluate, self.evaluate(&pdu, room_version));

        let insert_mutex = services().globals.room_mutex_insert(&pdu.room_id).await;
        let insert_lock = insert_mutex.lock().await;

        let mut idx = 0u64;
        phase!(event_id, Phase::Index, self.index(&pdu, room_version, opts, &mut idx));
        phase!(event_id, Phase::Post, self.post(&pdu, idx, opts));

        drop(insert_lock);
        drop(_state_lock);

        // Post-commit phases: faults are logged but the event remains
        // committed.
        if opts.phase.has(Phase::Notify) {
            if let Err(e) = self.notify_phase(idx, opts) {
                warn!("notify phase failed post-commit: {}", e);
            }
        }

        if opts.phase.has(Phase::Effects) {
            if let Err(e) = self.effects(&pdu) {
                warn!("effects phase failed post-commit: {}", e);
            }
        }

        if opts.infolog_accept {
            info!(
                event_id = event_id.as_ref().map(EventId::as_str).unwrap_or("?"),
                room_id = pdu.room_id.as_str(),
                depth = pdu.depth,
                "event accepted"
            );
        }

        Ok(Outcome::Accepted { event_id, fault: None })
    }

    /// Applies the accept/warn/reject disposition masks to a fault, in
    /// that precedence. A fault outside all three masks is logged and
    /// evaluation continues.
    fn dispose(&self, opts: &Opts, phase: Phase, fault: Fault, event_id: Option<&EventId>) -> Flow {
        let id = event_id.map(EventId::as_str).unwrap_or("?");

        if fault == Fault::Interrupt {
            return Flow::Reject(fault);
        }

        if opts.accept.has(fault) {
            if opts.warn.has(fault) {
                warn!(?phase, ?fault, event_id = id, "fault accepted");
            } else {
                debug!(?phase, ?fault, event_id = id, "fault accepted");
            }
            return Flow::Accept(fault);
        }

        if opts.warn.has(fault) {
            warn!(?phase, ?fault, event_id = id, "fault warned, continuing");
            return Flow::Continue;
        }

        if opts.reject.has(fault) {
            warn!(?phase, ?fault, event_id = id, "fault rejected");
            return Flow::Reject(fault);
        }

        debug!(?phase, ?fault, event_id = id, "fault unmasked, continuing");
        Flow::Continue
    }

    /// Parses the typed view; shape failures fault the ISSUE phase.
    fn issue(&self, object: &CanonicalObject) -> Result<PduEvent> {
        for required in ["room_id", "sender", "type", "origin_server_ts", "content"] {
            if !object.contains_key(required) {
                return Err(Error::BadRequestString(
                    ErrorKind::Invalid,
                    format!("Event is missing required field '{required}'"),
                ));
            }
        }

        PduEvent::from_object(object)
    }

    fn issue_checks(&self, object: &CanonicalObject) -> Result<Option<Fault>> {
        let size = canonical::to_canonical_string(&Value::Object(object.clone()))?.len();
        if size > services().globals.event_max_size() {
            return Ok(Some(Fault::BufOverflow));
        }

        Ok(None)
    }

    fn room_version_for(&self, pdu: &PduEvent) -> RoomVersion {
        if pdu.kind == EventType::RoomCreate {
            return pdu
                .content_value()
                .ok()
                .and_then(|c| {
                    c.get("room_version")
                        .and_then(Value::as_str)
                        .and_then(RoomVersion::parse)
                })
                .unwrap_or(RoomVersion::V1);
        }

        services()
            .rooms
            .state
            .room_version(&pdu.room_id)
            .ok()
            .or_else(|| RoomVersion::parse(&services().globals.config.default_room_version))
            .unwrap_or(RoomVersion::V5)
    }

    fn conform(
        &self,
        object: &CanonicalObject,
        pdu: &PduEvent,
        room_version: RoomVersion,
    ) -> Result<Option<Fault>> {
        if pdu.depth < 0 {
            return Ok(Some(Fault::Invalid));
        }

        if pdu.kind.is_state() && pdu.state_key.is_none() {
            return Ok(Some(Fault::Invalid));
        }

        if pdu.kind == EventType::RoomRedaction && self.redaction_target(pdu)?.is_none() {
            return Ok(Some(Fault::Invalid));
        }

        // Depth must exceed every locally-resolvable parent.
        for prev in &pdu.prev_events {
            if let Some(parent) = services().rooms.timeline.get_pdu(prev)? {
                if pdu.depth <= parent.depth {
                    return Ok(Some(Fault::Invalid));
                }
            }
        }

        match &pdu.event_id {
            Some(event_id) => {
                if !pdu::check_id(object, room_version, event_id) {
                    return Ok(Some(Fault::Event));
                }
            }
            // Legacy room versions carry the ID out-of-band.
            None => return Ok(Some(Fault::Invalid)),
        }

        Ok(None)
    }

    fn access(&self, pdu: &PduEvent) -> Result<Option<Fault>> {
        // Room-wide ban of the sender.
        if services()
            .rooms
            .state
            .membership(&pdu.room_id, &pdu.sender)?
            .as_deref()
            == Some("ban")
        {
            return Ok(Some(Fault::Auth));
        }

        // Server ACL of the sender's origin.
        if let Some(acl) = services().rooms.state.state_get(
            &pdu.room_id,
            &EventType::Other("m.room.server_acl".to_owned()),
            "",
        )? {
            let content = acl.content_value()?;
            let server = pdu.sender.server_name();
            let matches = |list: Option<&Value>| {
                list.and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(Value::as_str)
                            .any(|glob| acl_match(glob, server.as_str()))
                    })
                    .unwrap_or(false)
            };

            if matches(content.get("deny")) {
                return Ok(Some(Fault::Auth));
            }

            if content.get("allow").is_some() && !matches(content.get("allow")) {
                return Ok(Some(Fault::Auth));
            }
        }

        Ok(None)
    }

    fn verify(
        &self,
        object: &CanonicalObject,
        pdu: &PduEvent,
        room_version: RoomVersion,
    ) -> Result<Option<Fault>> {
        if !pdu::verify_content_hash(object)? {
            return Ok(Some(Fault::Event));
        }

        let origin = match &pdu.origin {
            Some(origin) => origin.clone(),
            None => pdu.sender.server_name(),
        };

        if !self.verify_origin_signature(object, &origin, room_version)? {
            return Ok(Some(Fault::Event));
        }

        Ok(None)
    }

    /// True iff at least one signature from `origin` verifies under a key
    /// advertised by that server. A missing key yields false, not an error.
    fn verify_origin_signature(
        &self,
        object: &CanonicalObject,
        origin: &ServerName,
        room_version: RoomVersion,
    ) -> Result<bool> {
        for key_id in pdu::signature_key_ids(object, origin) {
            let Some(pk) = services().keys.verify_key(origin, &key_id)? else {
                continue;
            };

            if pdu::verify_signature(object, &pk, origin, &key_id, room_version)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Best-effort fetch of referenced events absent locally: the auth
    /// chain when `auth`, otherwise the prev parents.
    async fn fetch_referenced(
        &self,
        pdu: &PduEvent,
        auth: bool,
        opts: &Opts,
    ) -> Result<Option<Fault>> {
        let referenced = if auth { &pdu.auth_events } else { &pdu.prev_events };

        let mut missing = Vec::new();
        for event_id in referenced {
            if !services().rooms.timeline.pdu_exists(event_id)? {
                missing.push(event_id.clone());
            }
        }

        if missing.is_empty() {
            return Ok(None);
        }

        let hint = pdu.origin.clone().or_else(|| Some(pdu.sender.server_name()));
        let mut nested_opts = opts.clone();
        nested_opts.phase.set(Phase::FetchAuth, false);
        nested_opts.phase.set(Phase::FetchPrev, false);
        nested_opts.phase.set(Phase::FetchState, false);
        nested_opts.phase.set(Phase::Notify, false);
        nested_opts.state_lock_held = false;
        nested_opts.appendix.set(Appendix::RoomHead, false);

        for event_id in missing {
            services().globals.interruption_point()?;

            let fetch_opts = FetchOpts {
                room_id: pdu.room_id.clone(),
                event_id: event_id.clone(),
                backfill_limit: referenced.len().max(1).min(48),
                hint: hint.clone(),
                hint_only: true,
            };

            match services().fetch.backfill(&fetch_opts).await {
                Ok(result) => {
                    debug!(
                        event_id = event_id.as_str(),
                        pdus = result.pdus.len(),
                        "fetched referenced events"
                    );
                    // Recursion is bounded: nested evaluations do not fetch.
                    self.eval(result.pdus, &nested_opts).await?;
                }
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    debug!(event_id = event_id.as_str(), "fetch of referenced event failed: {}", e);
                }
            }
        }

        Ok(None)
    }

    /// Authorization against the auth chain the event references.
    fn auth_static(&self, pdu: &PduEvent) -> Result<Option<Fault>> {
        let mut auth_state = AuthState {
            create: None,
            power_levels: None,
            join_rules: None,
            sender_membership: None,
            target_membership: None,
        };

        let target = pdu.state_key.as_deref();
        for auth_id in &pdu.auth_events {
            let Some(auth_pdu) = services().rooms.timeline.get_pdu(auth_id)? else {
                continue;
            };

            match (&auth_pdu.kind, auth_pdu.state_key.as_deref()) {
                (EventType::RoomCreate, Some("")) => auth_state.create = Some(auth_pdu),
                (EventType::RoomPowerLevels, Some("")) => auth_state.power_levels = Some(auth_pdu),
                (EventType::RoomJoinRules, Some("")) => auth_state.join_rules = Some(auth_pdu),
                (EventType::RoomMember, Some(state_key)) => {
                    let membership = auth_pdu
                        .content_value()?
                        .get("membership")
                        .and_then(Value::as_str)
                        .map(str::to_owned);

                    if state_key == pdu.sender.as_str() {
                        auth_state.sender_membership = membership.clone();
                    }
                    if Some(state_key) == target {
                        auth_state.target_membership = membership;
                    }
                }
                _ => {}
            }
        }

        match auth::auth_check(pdu, &auth_state) {
            Ok(()) => Ok(None),
            Err(e) => {
                debug!(reason = %e, "static authorization denied");
                Ok(Some(Fault::Auth))
            }
        }
    }

    /// The room's state must be resolvable before relative authorization.
    fn fetch_state(&self, pdu: &PduEvent) -> Result<Option<Fault>> {
        if pdu.kind == EventType::RoomCreate {
            return Ok(None);
        }

        if !services().rooms.state.room_exists(&pdu.room_id)? {
            return Ok(Some(Fault::State));
        }

        Ok(None)
    }

    /// Re-authorization against the state the room has actually converged
    /// on. Skipped for rooms whose state is not locally known.
    fn auth_relative(&self, pdu: &PduEvent) -> Result<Option<Fault>> {
        if pdu.kind == EventType::RoomCreate {
            return Ok(None);
        }

        let state = &services().rooms.state;
        if !state.room_exists(&pdu.room_id)? {
            return Ok(None);
        }

        let target = pdu.state_key.as_deref();
        let target_membership = match target.and_then(|t| UserId::parse(t).ok()) {
            Some(user) => state.membership(&pdu.room_id, &user)?,
            None => None,
        };

        let auth_state = AuthState {
            create: state.state_get(&pdu.room_id, &EventType::RoomCreate, "")?,
            power_levels: state.state_get(&pdu.room_id, &EventType::RoomPowerLevels, "")?,
            join_rules: state.state_get(&pdu.room_id, &EventType::RoomJoinRules, "")?,
            sender_membership: state.membership(&pdu.room_id, &pdu.sender)?,
            target_membership,
        };

        match auth::auth_check(pdu, &auth_state) {
            Ok(()) => Ok(None),
            Err(e) => {
                debug!(reason = %e, "relative authorization denied");
                Ok(Some(Fault::Auth))
            }
        }
    }

    fn redaction_target(&self, pdu: &PduEvent) -> Result<Option<EventId>> {
        if let Some(redacts) = &pdu.redacts {
            return Ok(Some(redacts.clone()));
        }

        // Room version 11 moved the pointer into content.
        let content = pdu.content_value()?;
        Ok(content
            .get("redacts")
            .and_then(Value::as_str)
            .and_then(|s| EventId::parse(s).ok()))
    }

    /// Applies the redaction projection to a locally-present target.
    fn evaluate(&self, pdu: &PduEvent, room_version: RoomVersion) -> Result<Option<Fault>> {
        if pdu.kind != EventType::RoomRedaction {
            return Ok(None);
        }

        let Some(target_id) = self.redaction_target(pdu)? else {
            return Ok(Some(Fault::Invalid));
        };

        let Some(target_idx) = services().rooms.timeline.index_of(&target_id)? else {
            // The target may arrive later; nothing to project yet.
            return Ok(None);
        };

        let Some(mut target) = services().rooms.timeline.get_pdu_at(target_idx)? else {
            return Ok(None);
        };

        target.redact(room_version)?;
        services()
            .rooms
            .timeline
            .db
            .replace_pdu_json(target_idx, &target.to_object()?)?;
        debug!(target = target_id.as_str(), "applied redaction projection");

        Ok(None)
    }

    /// Assigns a fresh monotone index and inserts into the global index.
    fn index(
        &self,
        pdu: &PduEvent,
        room_version: RoomVersion,
        opts: &Opts,
        idx_out: &mut u64,
    ) -> Result<Option<Fault>> {
        let event_id = pdu
            .event_id
            .as_ref()
            .ok_or(Error::BadRequest(ErrorKind::Invalid, "Event has no ID at indexing"))?;

        if services().rooms.timeline.pdu_exists(event_id)? {
            return Ok(Some(Fault::Exists));
        }

        let idx = services().globals.next_count()?;
        *idx_out = idx;

        let stored = pdu.to_federation_object(room_version)?;
        let json = opts.appendix.has(Appendix::EventJson).then_some(&stored);
        services().rooms.timeline.db.index_pdu(idx, event_id, json)?;

        Ok(None)
    }

    /// Appends to the room DAG and updates the head set.
    fn post(&self, pdu: &PduEvent, idx: u64, opts: &Opts) -> Result<Option<Fault>> {
        let event_id = pdu
            .event_id
            .as_ref()
            .ok_or(Error::BadRequest(ErrorKind::Invalid, "Event has no ID at append"))?;

        if opts.appendix.has(Appendix::RoomEvents) {
            services()
                .rooms
                .timeline
                .db
                .append_to_room(&pdu.room_id, pdu.depth, idx, event_id)?;
        }

        if opts.appendix.has(Appendix::EventRefs) {
            let referenced: Vec<EventId> = pdu
                .prev_events
                .iter()
                .chain(pdu.auth_events.iter())
                .cloned()
                .collect();
            services()
                .rooms
                .metadata
                .mark_as_referenced(&pdu.room_id, &referenced, idx)?;
        }

        if opts.appendix.has(Appendix::RoomHead) {
            services()
                .rooms
                .metadata
                .replace_head(&pdu.room_id, &pdu.prev_events, (event_id, pdu.depth))?;

            // Parents we have never seen are candidate heads beyond local
            // knowledge, creditable to the event's origin.
            let origin = pdu.origin.clone().unwrap_or_else(|| pdu.sender.server_name());
            for prev in &pdu.prev_events {
                if !services().rooms.timeline.pdu_exists(prev)? {
                    services().rooms.metadata.add_candidate_head(
                        &pdu.room_id,
                        prev,
                        pdu.depth - 1,
                        Some(&origin),
                    )?;
                }
            }
        }

        // However it arrived, this event is no longer merely claimed.
        services()
            .rooms
            .metadata
            .remove_candidate_head(&pdu.room_id, event_id)?;

        if opts.appendix.has(Appendix::RoomState) {
            if let Some(state_key) = &pdu.state_key {
                services()
                    .rooms
                    .state
                    .set_state(&pdu.room_id, &pdu.kind, state_key, idx)?;
            }
        }

        self.sequence.fetch_max(idx, AtomicOrdering::SeqCst);
        Ok(None)
    }

    fn notify_phase(&self, idx: u64, opts: &Opts) -> Result<()> {
        let _ = self.notify.send(self.current_sequence().max(idx));

        if opts.notify_servers {
            debug!("federation notification elided; no outbound sender configured");
        }

        Ok(())
    }

    /// Side effects: membership bookkeeping, power-levels cache
    /// invalidation, directory changes.
    fn effects(&self, pdu: &PduEvent) -> Result<()> {
        match &pdu.kind {
            EventType::RoomMember => {
                if let Some(state_key) = &pdu.state_key {
                    let target = UserId::parse(state_key)?;
                    let membership = pdu
                        .content_value()?
                        .get("membership")
                        .and_then(Value::as_str)
                        .unwrap_or("leave")
                        .to_owned();
                    services()
                        .rooms
                        .state
                        .update_membership(&pdu.room_id, &target, &membership)?;
                }
            }
            EventType::RoomPowerLevels => {
                services().rooms.state.invalidate_power_levels(&pdu.room_id);
            }
            EventType::RoomAliases | EventType::RoomCanonicalAlias => {
                debug!(room_id = pdu.room_id.as_str(), "directory entry changed");
            }
            _ => {}
        }

        Ok(())
    }
}

fn acl_match(glob: &str, server: &str) -> bool {
    if glob == "*" {
        return true;
    }

    if let Some(suffix) = glob.strip_prefix("*") {
        return server.ends_with(suffix);
    }

    glob == server
}

fn fault_for(error: &Error) -> Fault {
    match error.kind() {
        ErrorKind::MalformedInput | ErrorKind::Invalid => Fault::Invalid,
        ErrorKind::Auth => Fault::Auth,
        ErrorKind::Verify => Fault::Event,
        ErrorKind::Exists => Fault::Exists,
        ErrorKind::NotFound => Fault::State,
        ErrorKind::Interrupted => Fault::Interrupt,
        _ => Fault::General,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_mask_defaults_to_all() {
        let mask = PhaseMask::default();
        assert!(mask.has(Phase::Execute));
        assert!(mask.has(Phase::Effects));
    }

    #[test]
    fn phase_mask_clears_individually() {
        let mut mask = PhaseMask::default();
        mask.set(Phase::FetchPrev, false);
        assert!(!mask.has(Phase::FetchPrev));
        assert!(mask.has(Phase::FetchAuth));
    }

    #[test]
    fn default_opts_accept_exists_informationally() {
        let opts = Opts::default();
        assert!(opts.accept.has(Fault::Exists));
        assert!(opts.warn.has(Fault::Exists));
        assert!(!opts.accept.has(Fault::Auth));
    }

    #[test]
    fn backfill_opts_match_the_acquirer_contract() {
        let opts = Opts::for_backfill();
        assert!(opts.infolog_accept);
        assert!(!opts.notify_servers);
        assert!(!opts.warn.has(Fault::Exists));
        assert!(!opts.phase.has(Phase::Notify));
        assert!(!opts.phase.has(Phase::FetchPrev));
        assert!(!opts.phase.has(Phase::FetchState));
        assert!(!opts.appendix.has(Appendix::RoomHead));
        assert!(opts.appendix.has(Appendix::RoomEvents));
    }

    #[test]
    fn disposition_respects_the_reject_mask() {
        let vm = Service::new(0);

        let opts = Opts::default();
        assert!(matches!(
            vm.dispose(&opts, Phase::AuthStatic, Fault::Auth, None),
            Flow::Reject(Fault::Auth)
        ));

        // Narrowing the reject mask lets the fault pass through.
        let mut narrowed = Opts::default();
        narrowed.reject = FaultMask::ALL.without(Fault::Auth);
        assert!(matches!(
            vm.dispose(&narrowed, Phase::AuthStatic, Fault::Auth, None),
            Flow::Continue
        ));

        // Interrupts are never maskable.
        assert!(matches!(
            vm.dispose(&narrowed, Phase::AuthStatic, Fault::Interrupt, None),
            Flow::Reject(Fault::Interrupt)
        ));
    }

    #[test]
    fn disposition_precedence_is_accept_then_warn_then_reject() {
        let vm = Service::new(0);

        let mut opts = Opts::default();
        opts.accept = FaultMask::default().with(Fault::Exists);
        opts.warn = FaultMask::default().with(Fault::Exists);
        assert!(matches!(
            vm.dispose(&opts, Phase::Index, Fault::Exists, None),
            Flow::Accept(Fault::Exists)
        ));

        opts.accept = FaultMask::default();
        assert!(matches!(
            vm.dispose(&opts, Phase::Index, Fault::Exists, None),
            Flow::Continue
        ));
    }

    #[test]
    fn acl_globs() {
        assert!(acl_match("*", "anything.example"));
        assert!(acl_match("*.evil.example", "sub.evil.example"));
        assert!(!acl_match("*.evil.example", "good.example"));
        assert!(acl_match("exact.example", "exact.example"));
    }
}
