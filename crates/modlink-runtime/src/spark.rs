//! Spark channel semantics: receiver-side command scheduling, notify
//! staleness, emit state tracking and `(id, eventId)` dedupe.

use indexmap::IndexMap;
use modlink_protocol::{
    EventId, ModuleId, SparkCommand, SparkEmit, SparkEmitState, SparkInterrupt, SparkNotify,
};
use tracing::{debug, warn};

use crate::dedupe::RecentSet;

/// `(id, eventId)` correlation pair used for dedupe.
pub type SparkKey = (EventId, EventId);

fn notify_key(notify: &SparkNotify) -> SparkKey {
    (notify.id.clone(), notify.event_id.clone())
}

fn command_key(command: &SparkCommand) -> SparkKey {
    (
        command.id.clone(),
        command.event_id.clone().unwrap_or_else(|| command.id.clone()),
    )
}

/// A notify is stale once `now > issuedAt + ttlMs`. Without `issuedAt` the
/// receipt time stands in for the issue time.
pub fn is_stale(notify: &SparkNotify, received_at_ms: i64, now_ms: i64) -> bool {
    let Some(ttl) = notify.ttl_ms else {
        return false;
    };
    let issued = notify.issued_at.unwrap_or(received_at_ms);
    let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
    now_ms > issued.saturating_add(ttl)
}

fn emit_for(event_id: &EventId, state: SparkEmitState, note: &str) -> SparkEmit {
    SparkEmit {
        id: EventId::default(),
        event_id: event_id.clone(),
        state,
        note: Some(note.to_owned()),
        payload: None,
    }
}

// ─── Receiver side ─────────────────────────────────────────────────

/// What a receiving agent must do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SparkAction {
    /// Suspend the activity currently in progress.
    SuspendCurrent { intent: String },
    /// Start processing a command's intent now.
    Execute(SparkCommand),
    /// Queued behind current activity at `position` (0 = next).
    Enqueued { id: EventId, position: usize },
    /// Advisory command; no scheduling effect.
    Advise(SparkCommand),
    /// Act on a fresh notify.
    Handle(SparkNotify),
    /// Report back to the sender.
    Emit(SparkEmit),
    /// A stale notify that must not be acted on.
    Discard { id: EventId, reason: String },
}

/// Receiver-side scheduler honouring interrupt and priority semantics.
#[derive(Debug)]
pub struct SparkReceiver {
    seen: RecentSet<SparkKey>,
    current: Option<String>,
    suspended: Vec<String>,
    queue: Vec<SparkCommand>,
}

impl SparkReceiver {
    pub fn new(dedupe_capacity: usize) -> Self {
        Self {
            seen: RecentSet::new(dedupe_capacity),
            current: None,
            suspended: Vec::new(),
            queue: Vec::new(),
        }
    }

    pub fn begin_activity(&mut self, intent: impl Into<String>) {
        self.current = Some(intent.into());
    }

    pub fn current_activity(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn suspended(&self) -> &[String] {
        &self.suspended
    }

    /// Finish the current activity and start the next queued command, if
    /// any. Suspended activities resume only once the queue is drained.
    pub fn finish_activity(&mut self) -> Option<SparkAction> {
        self.current = None;
        if !self.queue.is_empty() {
            let next = self.queue.remove(0);
            self.current = Some(next.intent.clone());
            return Some(SparkAction::Execute(next));
        }
        self.current = self.suspended.pop();
        None
    }

    pub fn receive_notify(
        &mut self,
        notify: SparkNotify,
        received_at_ms: i64,
        now_ms: i64,
    ) -> Vec<SparkAction> {
        if !self.seen.insert(notify_key(&notify)) {
            debug!(id = %notify.id, "duplicate spark notify");
            return Vec::new();
        }

        if is_stale(&notify, received_at_ms, now_ms) {
            let mut actions = vec![SparkAction::Discard {
                id: notify.id.clone(),
                reason: "ttl elapsed".to_owned(),
            }];
            if notify.requires_ack {
                actions.push(SparkAction::Emit(emit_for(
                    &notify.event_id,
                    SparkEmitState::Expired,
                    "ttl elapsed before handling",
                )));
            }
            return actions;
        }

        let ack = notify
            .requires_ack
            .then(|| emit_for(&notify.event_id, SparkEmitState::Queued, "received"));
        let mut actions = vec![SparkAction::Handle(notify)];
        actions.extend(ack.map(SparkAction::Emit));
        actions
    }

    pub fn receive_command(&mut self, command: SparkCommand) -> Vec<SparkAction> {
        if !self.seen.insert(command_key(&command)) {
            debug!(id = %command.id, "duplicate spark command");
            return Vec::new();
        }

        match command.interrupt {
            SparkInterrupt::Force => {
                let mut actions = Vec::new();
                if let Some(intent) = self.current.take() {
                    self.suspended.push(intent.clone());
                    actions.push(SparkAction::SuspendCurrent { intent });
                }
                self.current = Some(command.intent.clone());
                actions.push(SparkAction::Execute(command));
                actions
            }
            SparkInterrupt::Soft if self.current.is_none() => {
                self.current = Some(command.intent.clone());
                vec![SparkAction::Execute(command)]
            }
            SparkInterrupt::Soft => {
                let id = command.id.clone();
                // Higher priority first, FIFO within a priority.
                let position = self
                    .queue
                    .iter()
                    .position(|queued| queued.priority < command.priority)
                    .unwrap_or(self.queue.len());
                self.queue.insert(position, command);
                vec![SparkAction::Enqueued { id, position }]
            }
            SparkInterrupt::Advisory => vec![SparkAction::Advise(command)],
        }
    }
}

// ─── Emit tracking ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitObservation {
    Transitioned {
        from: Option<SparkEmitState>,
        to: SparkEmitState,
    },
    Duplicate,
    Rejected {
        from: SparkEmitState,
        to: SparkEmitState,
    },
}

/// Tracks the emit state each recipient reports for a correlated
/// notify/command. A broadcast has one state machine per recipient.
#[derive(Debug)]
pub struct SparkEmitTracker {
    capacity: usize,
    seen: RecentSet<(ModuleId, SparkKey)>,
    states: IndexMap<(ModuleId, EventId), SparkEmitState>,
}

impl SparkEmitTracker {
    pub fn new(dedupe_capacity: usize) -> Self {
        Self {
            capacity: dedupe_capacity.max(1),
            seen: RecentSet::new(dedupe_capacity),
            states: IndexMap::new(),
        }
    }

    pub fn state(&self, emitter: &ModuleId, event_id: &EventId) -> Option<SparkEmitState> {
        self.states
            .get(&(emitter.clone(), event_id.clone()))
            .copied()
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    pub fn observe(&mut self, emitter: &ModuleId, emit: &SparkEmit) -> EmitObservation {
        let key = (emitter.clone(), (emit.id.clone(), emit.event_id.clone()));
        if self.seen.contains(&key) {
            return EmitObservation::Duplicate;
        }

        let correlation = (emitter.clone(), emit.event_id.clone());
        let from = self.states.get(&correlation).copied();
        if let Some(from) = from
            && !from.can_advance_to(emit.state)
        {
            warn!(
                emitter = %emitter,
                event_id = %emit.event_id,
                ?from,
                to = ?emit.state,
                "spark emit moves backwards"
            );
            return EmitObservation::Rejected {
                from,
                to: emit.state,
            };
        }

        self.seen.insert(key);
        // Most recently advanced last, so eviction drops the quietest pair.
        self.states.shift_remove(&correlation);
        if self.states.len() >= self.capacity {
            self.states.shift_remove_index(0);
        }
        self.states.insert(correlation, emit.state);
        EmitObservation::Transitioned {
            from,
            to: emit.state,
        }
    }

    /// Drop every state reported by `emitter`.
    pub fn forget(&mut self, emitter: &ModuleId) {
        self.states.retain(|(module, _), _| module != emitter);
    }
}

// ─── Host relay ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Forward,
    Duplicate,
    Stale,
    OutOfOrder,
}

impl Admission {
    pub fn reason(self) -> Option<&'static str> {
        match self {
            Self::Forward => None,
            Self::Duplicate => Some("duplicate spark delivery"),
            Self::Stale => Some("spark notify ttl elapsed"),
            Self::OutOfOrder => Some("spark emit state cannot move backwards"),
        }
    }
}

/// Host-side gate applied before spark events are routed.
#[derive(Debug)]
pub struct SparkRelay {
    notifies: RecentSet<SparkKey>,
    commands: RecentSet<SparkKey>,
    emits: SparkEmitTracker,
}

impl SparkRelay {
    pub fn new(dedupe_capacity: usize) -> Self {
        Self {
            notifies: RecentSet::new(dedupe_capacity),
            commands: RecentSet::new(dedupe_capacity),
            emits: SparkEmitTracker::new(dedupe_capacity),
        }
    }

    pub fn admit_notify(&mut self, notify: &SparkNotify, now_ms: i64) -> Admission {
        if is_stale(notify, now_ms, now_ms) {
            return Admission::Stale;
        }
        if !self.notifies.insert(notify_key(notify)) {
            return Admission::Duplicate;
        }
        Admission::Forward
    }

    pub fn admit_command(&mut self, command: &SparkCommand) -> Admission {
        if self.commands.insert(command_key(command)) {
            Admission::Forward
        } else {
            Admission::Duplicate
        }
    }

    pub fn admit_emit(&mut self, emitter: &ModuleId, emit: &SparkEmit) -> Admission {
        match self.emits.observe(emitter, emit) {
            EmitObservation::Transitioned { .. } => Admission::Forward,
            EmitObservation::Duplicate => Admission::Duplicate,
            EmitObservation::Rejected { .. } => Admission::OutOfOrder,
        }
    }

    pub fn emit_state(&self, emitter: &ModuleId, event_id: &EventId) -> Option<SparkEmitState> {
        self.emits.state(emitter, event_id)
    }

    /// `emitter` left; its emit state machines are finished.
    pub fn forget(&mut self, emitter: &ModuleId) {
        self.emits.forget(emitter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_protocol::{SparkPriority, SparkUrgency};
    use proptest::prelude::*;

    fn command(id: &str, interrupt: SparkInterrupt, priority: SparkPriority) -> SparkCommand {
        SparkCommand {
            id: id.into(),
            event_id: None,
            intent: format!("intent-{id}"),
            interrupt,
            priority,
            destinations: None,
            arguments: None,
        }
    }

    fn notify(id: &str, ttl_ms: Option<u64>, issued_at: Option<i64>) -> SparkNotify {
        SparkNotify {
            id: id.into(),
            event_id: format!("evt-{id}").as_str().into(),
            kind: "reminder".into(),
            urgency: SparkUrgency::Soon,
            headline: "stand up".into(),
            note: None,
            payload: None,
            destinations: None,
            requires_ack: true,
            ttl_ms,
            issued_at,
        }
    }

    fn emit(id: &str, event_id: &str, state: SparkEmitState) -> SparkEmit {
        SparkEmit {
            id: id.into(),
            event_id: event_id.into(),
            state,
            note: None,
            payload: None,
        }
    }

    #[test]
    fn force_command_suspends_current_activity_before_executing() {
        let mut receiver = SparkReceiver::new(64);
        receiver.begin_activity("reading news");

        let actions = receiver.receive_command(command(
            "c1",
            SparkInterrupt::Force,
            SparkPriority::Critical,
        ));

        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[0],
            SparkAction::SuspendCurrent { intent } if intent == "reading news"
        ));
        assert!(matches!(&actions[1], SparkAction::Execute(c) if c.id.as_str() == "c1"));
        assert_eq!(receiver.current_activity(), Some("intent-c1"));
        assert_eq!(receiver.suspended(), ["reading news".to_owned()]);
    }

    #[test]
    fn soft_commands_queue_by_priority_then_arrival() {
        let mut receiver = SparkReceiver::new(64);
        receiver.begin_activity("chatting");
        receiver.receive_command(command("low", SparkInterrupt::Soft, SparkPriority::Low));
        receiver.receive_command(command("high-1", SparkInterrupt::Soft, SparkPriority::High));
        let actions =
            receiver.receive_command(command("high-2", SparkInterrupt::Soft, SparkPriority::High));
        assert!(matches!(actions[0], SparkAction::Enqueued { position: 1, .. }));

        let mut order = Vec::new();
        while let Some(SparkAction::Execute(next)) = receiver.finish_activity() {
            order.push(next.id.to_string());
        }
        assert_eq!(order, vec!["high-1", "high-2", "low"]);
        assert_eq!(receiver.current_activity(), None);
    }

    #[test]
    fn advisory_commands_do_not_schedule() {
        let mut receiver = SparkReceiver::new(64);
        let actions = receiver.receive_command(command(
            "a1",
            SparkInterrupt::Advisory,
            SparkPriority::Normal,
        ));
        assert!(matches!(actions[0], SparkAction::Advise(_)));
        assert_eq!(receiver.current_activity(), None);
    }

    #[test]
    fn stale_notify_is_discarded_and_reported_expired() {
        let mut receiver = SparkReceiver::new(64);
        let actions = receiver.receive_notify(notify("n1", Some(1_000), Some(0)), 500, 5_000);
        assert!(matches!(actions[0], SparkAction::Discard { .. }));
        assert!(matches!(
            &actions[1],
            SparkAction::Emit(emit) if emit.state == SparkEmitState::Expired
        ));

        let fresh = receiver.receive_notify(notify("n2", Some(1_000), None), 4_500, 5_000);
        assert!(matches!(fresh[0], SparkAction::Handle(_)));
        assert!(matches!(
            &fresh[1],
            SparkAction::Emit(emit) if emit.state == SparkEmitState::Queued
        ));
    }

    #[test]
    fn duplicate_deliveries_have_no_effect() {
        let mut receiver = SparkReceiver::new(64);
        assert_eq!(receiver.receive_notify(notify("n1", None, None), 0, 0).len(), 2);
        assert!(receiver.receive_notify(notify("n1", None, None), 0, 0).is_empty());

        let mut tracker = SparkEmitTracker::new(64);
        let bot = ModuleId::from("bot");
        let queued = emit("e1", "evt", SparkEmitState::Queued);
        assert!(matches!(tracker.observe(&bot, &queued), EmitObservation::Transitioned { .. }));
        assert_eq!(tracker.observe(&bot, &queued), EmitObservation::Duplicate);
    }

    #[test]
    fn each_recipient_advances_its_own_emit_state() {
        let mut tracker = SparkEmitTracker::new(64);
        let (a, b) = (ModuleId::from("bot-a"), ModuleId::from("bot-b"));
        tracker.observe(&a, &emit("a1", "evt", SparkEmitState::Queued));
        tracker.observe(&a, &emit("a2", "evt", SparkEmitState::Done));
        assert_eq!(
            tracker.observe(&b, &emit("b1", "evt", SparkEmitState::Queued)),
            EmitObservation::Transitioned {
                from: None,
                to: SparkEmitState::Queued
            }
        );
        assert_eq!(tracker.state(&a, &"evt".into()), Some(SparkEmitState::Done));
        assert_eq!(tracker.state(&b, &"evt".into()), Some(SparkEmitState::Queued));

        tracker.forget(&a);
        assert_eq!(tracker.state(&a, &"evt".into()), None);
        assert_eq!(tracker.tracked(), 1);
    }

    #[test]
    fn tracked_states_stay_within_capacity() {
        let mut tracker = SparkEmitTracker::new(4);
        let bot = ModuleId::from("bot");
        for n in 0..10 {
            let event_id = format!("evt-{n}");
            tracker.observe(&bot, &emit(&format!("e{n}"), &event_id, SparkEmitState::Queued));
        }
        assert_eq!(tracker.tracked(), 4);
        assert_eq!(tracker.state(&bot, &"evt-0".into()), None);
        assert_eq!(tracker.state(&bot, &"evt-9".into()), Some(SparkEmitState::Queued));
    }

    #[test]
    fn done_to_working_is_rejected() {
        let mut tracker = SparkEmitTracker::new(64);
        let bot = ModuleId::from("bot");
        tracker.observe(&bot, &emit("e1", "evt", SparkEmitState::Working));
        tracker.observe(&bot, &emit("e2", "evt", SparkEmitState::Done));
        assert_eq!(
            tracker.observe(&bot, &emit("e3", "evt", SparkEmitState::Working)),
            EmitObservation::Rejected {
                from: SparkEmitState::Done,
                to: SparkEmitState::Working
            }
        );
        assert_eq!(tracker.state(&bot, &"evt".into()), Some(SparkEmitState::Done));
    }

    #[test]
    fn relay_drops_stale_and_duplicate_notifies() {
        let mut relay = SparkRelay::new(8);
        assert_eq!(relay.admit_notify(&notify("n1", Some(10), Some(0)), 1_000), Admission::Stale);
        assert_eq!(relay.admit_notify(&notify("n2", None, None), 1_000), Admission::Forward);
        assert_eq!(relay.admit_notify(&notify("n2", None, None), 1_000), Admission::Duplicate);
    }

    fn arb_state() -> impl Strategy<Value = SparkEmitState> {
        prop::sample::select(vec![
            SparkEmitState::Queued,
            SparkEmitState::Working,
            SparkEmitState::Done,
            SparkEmitState::Dropped,
            SparkEmitState::Blocked,
            SparkEmitState::Expired,
        ])
    }

    proptest! {
        #[test]
        fn observed_states_only_move_forward(
            deliveries in prop::collection::vec((0u8..6, arb_state()), 1..24)
        ) {
            let mut tracker = SparkEmitTracker::new(64);
            let bot = ModuleId::from("bot");
            let mut transitions = Vec::new();
            for (id, state) in deliveries {
                let delivery = emit(&format!("e{id}"), "evt", state);
                let observation = tracker.observe(&bot, &delivery);
                if let EmitObservation::Transitioned { from, to } = observation {
                    transitions.push((from, to));
                }
            }
            for (from, to) in transitions {
                if let Some(from) = from {
                    prop_assert!(from.can_advance_to(to));
                }
            }
        }

        #[test]
        fn repeated_pairs_transition_once(state in arb_state(), repeats in 2usize..6) {
            let mut tracker = SparkEmitTracker::new(64);
            let bot = ModuleId::from("bot");
            let delivery = emit("e1", "evt", state);
            let transitions = (0..repeats)
                .filter(|_| {
                    matches!(tracker.observe(&bot, &delivery), EmitObservation::Transitioned { .. })
                })
                .count();
            prop_assert_eq!(transitions, 1);
        }
    }
}
