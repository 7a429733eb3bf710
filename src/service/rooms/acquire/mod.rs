// =============================================================================
// Palaver Matrix Homeserver - Acquire Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The room DAG acquirer: plans and submits backfill fetches to fill head
//   and interior gaps, bounds in-flight parallelism, and feeds returned
//   events into the evaluation pipeline. Runs to completion: every
//   in-flight fetch is drained or cancelled before the call returns.
//
// Features:
//   • Head branch over candidate heads beyond local knowledge
//   • Missing branch over referenced-but-absent events
//   • Gap measurement via sounding/twain to size each request
//   • Saturated/slack drain waits (5000 ms / 50 ms)
//   • Checkpoint-based cancellation
//
// Architecture:
//   • In-flight futures live in the acquirer and die with it
//
// Dependencies:
//   • Tokio async runtime
//   • futures-util for the in-flight set
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/server-server-api/#backfill
//
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use futures_util::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use tracing::{debug, error};

use crate::{
    mxid::{EventId, RoomId, ServerName},
    service::{
        fetch::{FetchOpts, FetchResult},
        rooms::vm,
    },
    services, Result,
};

/// How many events a single backfill may request, whatever the gap
/// estimate says.
const LIMIT_CLAMP: (i64, i64) = (1, 48);

/// Drain wait when the in-flight set is saturated / has slack.
const WAIT_FULL: Duration = Duration::from_millis(5000);
const WAIT_SLACK: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct Opts {
    pub room_id: RoomId,

    /// Only missing references whose referrer index falls in this range are
    /// considered.
    pub ref_range: (u64, u64),

    /// Depth window; unset bounds default to the viewport floor and the
    /// room's top depth.
    pub depth_range: (Option<i64>, Option<i64>),

    /// Events further than this many indices above the viewport are
    /// skipped. Zero disables the measurement.
    pub viewport_size: usize,

    /// Only gaps within this range are fetched.
    pub gap_range: (i64, i64),

    /// Maximum passes of the missing branch.
    pub rounds: usize,

    /// Maximum concurrently in-flight fetches.
    pub fetch_width: usize,

    /// Preferred peer for submissions without a better origin hint.
    pub hint: Option<ServerName>,

    /// Branch selection.
    pub head: bool,
    pub missing: bool,
}

impl Opts {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            ref_range: (0, u64::MAX),
            depth_range: (None, None),
            viewport_size: 0,
            gap_range: (1, i64::MAX),
            rounds: 1,
            fetch_width: services().globals.config.fetch_width,
            hint: None,
            head: true,
            missing: true,
        }
    }
}

type InFlight = BoxFuture<'static, (EventId, Result<FetchResult>)>;

pub struct Acquire {
    opts: Opts,
    fetching: FuturesUnordered<InFlight>,
    in_flight: Vec<EventId>,
}

impl Acquire {
    /// Construct-and-run: performs the selected branches, then drains all
    /// in-flight fetches before returning. Dropping the acquirer cancels
    /// anything still outstanding.
    pub async fn execute(opts: Opts) -> Result<()> {
        let mut this = Self {
            opts,
            fetching: FuturesUnordered::new(),
            in_flight: Vec::new(),
        };

        if this.opts.head {
            this.acquire_head().await?;
        }

        if this.opts.missing {
            this.acquire_missing().await?;
        }

        // Complete all work before returning, otherwise everything would be
        // cancelled on unwind.
        while !this.fetching.is_empty() {
            while this.handle().await? {}
        }

        Ok(())
    }

    async fn acquire_head(&mut self) -> Result<()> {
        let top_depth = services()
            .rooms
            .timeline
            .top(&self.opts.room_id)?
            .map(|(_, depth, _)| depth)
            .unwrap_or(0);

        let candidates = services()
            .rooms
            .metadata
            .candidate_heads(&self.opts.room_id)?;

        for (event_id, depth, origin) in candidates {
            services().globals.interruption_point()?;

            // Bail if the claim is below the window.
            if depth < self.opts.depth_range.0.unwrap_or(i64::MIN) {
                continue;
            }

            let gap = depth - top_depth;
            let limit = gap.clamp(LIMIT_CLAMP.0, LIMIT_CLAMP.1) as usize;
            let hint = origin.or_else(|| self.opts.hint.clone());

            let submitted = self.submit(event_id.clone(), hint.clone(), true, limit).await?;
            if submitted {
                debug!(
                    event_id = event_id.as_str(),
                    hint = hint.as_ref().map(ServerName::as_str).unwrap_or("<any>"),
                    room_id = self.opts.room_id.as_str(),
                    top_depth,
                    fetching = self.fetching.len(),
                    "fetch head"
                );
            }
        }

        Ok(())
    }

    async fn acquire_missing(&mut self) -> Result<()> {
        let mut ref_min = self.opts.ref_range.0;

        for _ in 0..self.opts.rounds {
            if !self.fetch_missing(&mut ref_min).await? {
                break;
            }

            if ref_min > self.opts.ref_range.1 {
                break;
            }
        }

        Ok(())
    }

    /// One pass of the missing branch. Advances `ref_min` to the highest
    /// referrer considered so progress is monotone across passes.
    async fn fetch_missing(&mut self, ref_min: &mut u64) -> Result<bool> {
        let Some((_top_id, top_depth, top_idx)) =
            services().rooms.timeline.top(&self.opts.room_id)?
        else {
            return Ok(false);
        };

        let (mut low, high) = self.opts.depth_range;
        if low.is_none() && self.opts.viewport_size > 0 {
            low = Some(services().rooms.timeline.viewport(&self.opts.room_id)?.0);
        }

        let mut low = low.unwrap_or(0);
        let high = high.unwrap_or(top_depth);

        // Widen a narrow window downward so small viewports still make
        // progress into history.
        if (high - low) < self.opts.viewport_size as i64 {
            low -= (self.opts.viewport_size as i64).min(low);
        }

        let ref_floor = *ref_min;
        let (ref_lo, ref_hi) = self.opts.ref_range;
        let mut candidates: Vec<(EventId, i64, u64)> = Vec::new();
        services().rooms.timeline.missing_in_range(
            &self.opts.room_id,
            low,
            high,
            |missing_id, ref_depth, ref_idx| {
                if services().globals.interrupted() {
                    return Ok(false);
                }

                if ref_idx < ref_lo || ref_idx < ref_floor || ref_idx > ref_hi {
                    return Ok(true);
                }

                candidates.push((missing_id.clone(), ref_depth, ref_idx));
                Ok(true)
            },
        )?;

        let mut ret = false;
        let mut ref_top = *ref_min;
        let mut seen_refs: HashSet<u64> = HashSet::new();

        for (missing_id, ref_depth, ref_idx) in candidates {
            services().globals.interruption_point()?;

            if !seen_refs.insert(ref_idx) {
                continue;
            }

            // Bail if this reference sits above the viewport.
            if self.opts.viewport_size > 0 {
                let idx_range = (ref_idx.min(top_idx), ref_idx.max(top_idx));
                let between = services().rooms.timeline.count_between(
                    &self.opts.room_id,
                    idx_range.0,
                    idx_range.1,
                )?;
                if between > self.opts.viewport_size as u64 {
                    continue;
                }
            }

            let Some(ref_id) = services().rooms.timeline.event_id_at(ref_idx)? else {
                continue;
            };

            let (sound_depth, sound_idx) =
                services().rooms.timeline.sounding(&self.opts.room_id, &ref_id)?;

            // The far side of the gap matters only when the reference itself
            // borders it.
            let twain_depth = if sound_idx == ref_idx {
                services()
                    .rooms
                    .timeline
                    .twain(&self.opts.room_id, &ref_id)?
                    .map(|(depth, _)| depth)
                    .unwrap_or(0)
            } else {
                0
            };

            let gap = (sound_depth - twain_depth).max(0);

            // Ignore if this ref borders on a gap which does not satisfy
            // the options.
            if gap < self.opts.gap_range.0 || gap > self.opts.gap_range.1 {
                continue;
            }

            // The depth on each side of a gap is a rough heuristic for how
            // many events are missing and how much to request at once. It
            // lowballs on wide DAGs and overshoots on distant secondary
            // references, but most estimates land close enough.
            let limit = gap.clamp(LIMIT_CLAMP.0, LIMIT_CLAMP.1) as usize;

            // Without an explicit hint, the referrer's origin is the best
            // guess for who can fill the gap behind it.
            let hint = match self.opts.hint.clone() {
                Some(hint) => Some(hint),
                None => services()
                    .rooms
                    .timeline
                    .get_pdu_at(ref_idx)?
                    .map(|ref_pdu| {
                        ref_pdu
                            .origin
                            .unwrap_or_else(|| ref_pdu.sender.server_name())
                    }),
            };

            let submitted = self.submit(missing_id.clone(), hint, false, limit).await?;

            if submitted {
                debug!(
                    event_id = missing_id.as_str(),
                    ref_id = ref_id.as_str(),
                    ref_depth,
                    room_id = self.opts.room_id.as_str(),
                    top_depth,
                    sound_depth,
                    twain_depth,
                    fetching = self.fetching.len(),
                    "fetch missing"
                );
            }

            ref_top = ref_top.max(ref_idx);
            ret |= submitted;
        }

        debug_assert!(ref_top >= *ref_min);
        *ref_min = ref_top;
        Ok(ret)
    }

    /// Submits a fetch unless one for the same event is already in flight.
    /// On reaching the width cap, handles completions before returning.
    async fn submit(
        &mut self,
        event_id: EventId,
        hint: Option<ServerName>,
        hint_only: bool,
        limit: usize,
    ) -> Result<bool> {
        let ret = if !self.started(&event_id) {
            self.start(event_id, hint, hint_only, limit)
        } else {
            false
        };

        if ret || self.full() {
            while self.handle().await? {}
        }

        Ok(ret)
    }

    fn start(
        &mut self,
        event_id: EventId,
        hint: Option<ServerName>,
        hint_only: bool,
        limit: usize,
    ) -> bool {
        let fetch_opts = FetchOpts {
            room_id: self.opts.room_id.clone(),
            event_id: event_id.clone(),
            backfill_limit: limit,
            hint,
            hint_only,
        };

        if let Err(e) = services().fetch.check(&fetch_opts) {
            error!(
                event_id = event_id.as_str(),
                room_id = self.opts.room_id.as_str(),
                hint = fetch_opts.hint.as_ref().map(ServerName::as_str).unwrap_or("<any>"),
                "fetch submission failed: {}",
                e
            );
            return false;
        }

        let future_id = event_id.clone();
        self.fetching.push(
            async move {
                let result = services().fetch.backfill(&fetch_opts).await;
                (future_id, result)
            }
            .boxed(),
        );
        self.in_flight.push(event_id);

        true
    }

    fn started(&self, event_id: &EventId) -> bool {
        self.in_flight.iter().any(|id| id == event_id)
    }

    fn full(&self) -> bool {
        self.fetching.len() >= self.opts.fetch_width
    }

    /// Waits for the next completion. Returns false once the in-flight set
    /// has slack and nothing resolved within the short wait.
    async fn handle(&mut self) -> Result<bool> {
        if self.fetching.is_empty() {
            return Ok(false);
        }

        let wait = if self.full() { WAIT_FULL } else { WAIT_SLACK };
        let resolved = tokio::time::timeout(wait, self.fetching.next()).await;

        let (event_id, result) = match resolved {
            Err(_elapsed) => return Ok(self.full()),
            Ok(None) => return Ok(false),
            Ok(Some(resolved)) => resolved,
        };
        self.in_flight.retain(|id| id != &event_id);
        self.handle_result(event_id, result).await
    }

    async fn handle_result(
        &mut self,
        event_id: EventId,
        result: Result<FetchResult>,
    ) -> Result<bool> {
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                error!(
                    event_id = event_id.as_str(),
                    room_id = self.opts.room_id.as_str(),
                    "fetch failed: {}",
                    e
                );
                return Ok(true);
            }
        };

        debug!(
            pdus = response.pdus.len(),
            event_id = event_id.as_str(),
            room_id = self.opts.room_id.as_str(),
            "eval of fetched events"
        );

        services().globals.interruption_point()?;

        let vm_opts = vm::Opts::for_backfill();
        match services().rooms.vm.eval(response.pdus, &vm_opts).await {
            Ok(_) => {}
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                error!(
                    event_id = event_id.as_str(),
                    room_id = self.opts.room_id.as_str(),
                    "eval failed: {}",
                    e
                );
            }
        }

        Ok(true)
    }
}
