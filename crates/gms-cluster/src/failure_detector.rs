//! Heartbeat-based failure detection
//!
//! [`FailureDetector`] tracks one [`MemberState`] per peer of the installed
//! view. It never performs I/O: callers feed it heartbeats, suspicion
//! reports and clock ticks, and act on the returned [`DetectorEvent`]s.
//! [`spawn_failure_detector`] runs it as a worker with its own queue.

use crate::member::MemberIdentifier;
use crate::view::View;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Liveness of a peer as seen by the local member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Alive,
    Suspect,
    /// Terminal: the identifier is never tracked again
    ConfirmedDead,
}

/// When a suspicion escalates to a confirmed death.
///
/// A single report escalates once `suspicion_timeout` passes without a
/// heartbeat. `independent_reports` distinct reporters with outstanding
/// suspicions escalate immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionPolicy {
    /// Consecutive heartbeat intervals without a heartbeat before suspecting
    pub missed_heartbeats: u32,

    /// Grace period between suspicion and confirmed death
    pub suspicion_timeout: Duration,

    /// Distinct reporters that confirm a death without waiting out the grace
    /// period; 0 disables the fast path
    pub independent_reports: usize,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        Self {
            missed_heartbeats: 3,
            suspicion_timeout: Duration::from_secs(5),
            independent_reports: 2,
        }
    }
}

/// One member's report that a peer may have failed
#[derive(Debug, Clone)]
pub struct SuspicionRecord {
    pub reporter: MemberIdentifier,
    pub reason: String,
    pub reported_at: DateTime<Utc>,
    received: Instant,
}

/// Outputs of the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    /// The local member started suspecting `member`; tell the coordinator
    Suspected { member: MemberIdentifier, reason: String },

    /// A suspected member proved alive
    Refuted { member: MemberIdentifier },

    /// Emitted exactly once per identifier
    ConfirmedDead { member: MemberIdentifier, reason: String },

    /// Peers suspect the local member; it should heartbeat immediately
    RefuteLocalSuspicion,
}

#[derive(Debug)]
struct MemberHealth {
    state: MemberState,
    last_heard: Instant,
    last_sequence: Option<u64>,
    suspected_at: Option<Instant>,
    suspicions: HashMap<MemberIdentifier, SuspicionRecord>,
}

impl MemberHealth {
    fn alive(now: Instant) -> Self {
        Self {
            state: MemberState::Alive,
            last_heard: now,
            last_sequence: None,
            suspected_at: None,
            suspicions: HashMap::new(),
        }
    }
}

/// Per-member liveness state machine
pub struct FailureDetector {
    local: MemberIdentifier,
    heartbeat_interval: Duration,
    policy: SuspicionPolicy,
    members: HashMap<MemberIdentifier, MemberHealth>,
    dead: HashSet<MemberIdentifier>,
}

impl FailureDetector {
    pub fn new(local: MemberIdentifier, heartbeat_interval: Duration, policy: SuspicionPolicy) -> Self {
        Self {
            local,
            heartbeat_interval,
            policy,
            members: HashMap::new(),
            dead: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &SuspicionPolicy {
        &self.policy
    }

    /// Track the peers of a newly installed view.
    ///
    /// New peers start alive as of `now`. Records of members that left the
    /// view are dropped; records of members that stayed are kept.
    pub fn update_view(&mut self, view: &View, now: Instant) {
        self.members.retain(|member, _| view.contains(member));

        for member in view.peers(&self.local) {
            if self.dead.contains(member) {
                continue;
            }
            self.members
                .entry(member.clone())
                .or_insert_with(|| MemberHealth::alive(now));
        }

        tracing::debug!(
            "Failure detector tracking {} peers of view {}",
            self.members.len(),
            view.view_number()
        );
    }

    pub fn state(&self, member: &MemberIdentifier) -> Option<MemberState> {
        if self.dead.contains(member) {
            return Some(MemberState::ConfirmedDead);
        }
        self.members.get(member).map(|health| health.state)
    }

    /// Outstanding suspicions of `member`
    pub fn suspicions(&self, member: &MemberIdentifier) -> Vec<&SuspicionRecord> {
        self.members
            .get(member)
            .map(|health| health.suspicions.values().collect())
            .unwrap_or_default()
    }

    pub fn tracked_members(&self) -> usize {
        self.members.len()
    }

    /// A heartbeat arrived from `sender`
    pub fn record_heartbeat(&mut self, sender: &MemberIdentifier, sequence: u64, now: Instant) -> Vec<DetectorEvent> {
        let Some(health) = self.members.get_mut(sender) else {
            return Vec::new();
        };

        if let Some(last) = health.last_sequence {
            if sequence <= last {
                tracing::trace!("Ignoring stale heartbeat {} from {}", sequence, sender);
                return Vec::new();
            }
        }

        health.last_sequence = Some(sequence);
        health.last_heard = now;

        if health.state == MemberState::Suspect {
            health.state = MemberState::Alive;
            health.suspected_at = None;
            health.suspicions.clear();
            tracing::info!("Member {} refuted suspicion", sender);
            return vec![DetectorEvent::Refuted { member: sender.clone() }];
        }

        Vec::new()
    }

    /// Any traffic from `sender` that proves it is alive without a sequence
    pub fn record_activity(&mut self, sender: &MemberIdentifier, now: Instant) {
        if let Some(health) = self.members.get_mut(sender) {
            if health.state == MemberState::Alive {
                health.last_heard = now;
            }
        }
    }

    /// `reporter` suspects each of `suspects`
    pub fn record_suspicion(
        &mut self,
        reporter: &MemberIdentifier,
        suspects: &[MemberIdentifier],
        reason: &str,
        now: Instant,
    ) -> Vec<DetectorEvent> {
        let mut events = Vec::new();

        if reporter != &self.local && !self.members.contains_key(reporter) {
            tracing::debug!("Ignoring suspicion report from non-member {}", reporter);
            return events;
        }

        for suspect in suspects {
            if suspect == &self.local {
                if !events.contains(&DetectorEvent::RefuteLocalSuspicion) {
                    tracing::warn!("Suspected by {} ({}), refuting", reporter, reason);
                    events.push(DetectorEvent::RefuteLocalSuspicion);
                }
                continue;
            }
            if suspect == reporter {
                continue;
            }
            events.extend(self.add_suspicion(suspect, reporter, reason, now));
        }

        events
    }

    /// The local member suspects `member`, e.g. after it failed to
    /// acknowledge a view
    pub fn suspect(&mut self, member: &MemberIdentifier, reason: &str, now: Instant) -> Vec<DetectorEvent> {
        let local = self.local.clone();
        self.add_suspicion(member, &local, reason, now)
    }

    /// Advance timers
    pub fn tick(&mut self, now: Instant) -> Vec<DetectorEvent> {
        let silence = self.heartbeat_interval * self.policy.missed_heartbeats.max(1);
        let mut late = Vec::new();
        let mut expired = Vec::new();

        for (member, health) in &self.members {
            match health.state {
                MemberState::Alive if now.saturating_duration_since(health.last_heard) >= silence => {
                    late.push(member.clone());
                }
                MemberState::Suspect => {
                    let timed_out = health
                        .suspected_at
                        .map(|at| now.saturating_duration_since(at) >= self.policy.suspicion_timeout)
                        .unwrap_or(false);
                    if timed_out {
                        expired.push(member.clone());
                    }
                }
                _ => {}
            }
        }

        // Deterministic output order
        late.sort();
        expired.sort();

        let mut events = Vec::new();
        for member in late {
            let reason = format!("missed {} heartbeats", self.policy.missed_heartbeats);
            events.extend(self.suspect(&member, &reason, now));
        }
        for member in expired {
            let reason = format!("no heartbeat within {:?} of suspicion", self.policy.suspicion_timeout);
            events.extend(self.confirm_dead(&member, reason));
        }
        events
    }

    fn add_suspicion(
        &mut self,
        suspect: &MemberIdentifier,
        reporter: &MemberIdentifier,
        reason: &str,
        now: Instant,
    ) -> Vec<DetectorEvent> {
        let local_report = reporter == &self.local;
        let grace = self.policy.suspicion_timeout;

        let Some(health) = self.members.get_mut(suspect) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let newly_suspected = health.state == MemberState::Alive;
        if newly_suspected {
            health.state = MemberState::Suspect;
            health.suspected_at = Some(now);
            tracing::warn!("Suspecting member {} (reported by {}: {})", suspect, reporter, reason);
        }

        health.suspicions.insert(
            reporter.clone(),
            SuspicionRecord {
                reporter: reporter.clone(),
                reason: reason.to_string(),
                reported_at: Utc::now(),
                received: now,
            },
        );
        health
            .suspicions
            .retain(|_, record| now.saturating_duration_since(record.received) < grace);

        if newly_suspected && local_report {
            events.push(DetectorEvent::Suspected {
                member: suspect.clone(),
                reason: reason.to_string(),
            });
        }

        let reports = health.suspicions.len();
        if self.policy.independent_reports > 0 && reports >= self.policy.independent_reports {
            let reason = format!("{} independent suspicion reports", reports);
            events.extend(self.confirm_dead(suspect, reason));
        }

        events
    }

    fn confirm_dead(&mut self, member: &MemberIdentifier, reason: String) -> Vec<DetectorEvent> {
        if self.members.remove(member).is_none() || !self.dead.insert(member.clone()) {
            return Vec::new();
        }

        tracing::warn!("Member {} confirmed dead: {}", member, reason);
        vec![DetectorEvent::ConfirmedDead {
            member: member.clone(),
            reason,
        }]
    }
}

/// Inputs accepted by the failure detector worker
#[derive(Debug, Clone)]
pub enum DetectorInput {
    Heartbeat {
        sender: MemberIdentifier,
        sequence: u64,
    },
    Activity {
        sender: MemberIdentifier,
    },
    Suspicion {
        reporter: MemberIdentifier,
        suspects: Vec<MemberIdentifier>,
        reason: String,
    },
    LocalSuspicion {
        member: MemberIdentifier,
        reason: String,
    },
}

/// Run `detector` until the input queue closes.
///
/// Views published on `views` are applied before the next input; timers
/// advance every `tick_interval`.
pub fn spawn_failure_detector(
    mut detector: FailureDetector,
    tick_interval: Duration,
    mut inputs: mpsc::Receiver<DetectorInput>,
    mut views: watch::Receiver<Option<Arc<View>>>,
    events: mpsc::Sender<DetectorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let initial = views.borrow_and_update().clone();
        if let Some(view) = initial {
            detector.update_view(&view, Instant::now());
        }

        loop {
            let produced = tokio::select! {
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    let now = Instant::now();
                    match input {
                        DetectorInput::Heartbeat { sender, sequence } => {
                            detector.record_heartbeat(&sender, sequence, now)
                        }
                        DetectorInput::Activity { sender } => {
                            detector.record_activity(&sender, now);
                            Vec::new()
                        }
                        DetectorInput::Suspicion { reporter, suspects, reason } => {
                            detector.record_suspicion(&reporter, &suspects, &reason, now)
                        }
                        DetectorInput::LocalSuspicion { member, reason } => {
                            detector.suspect(&member, &reason, now)
                        }
                    }
                }
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let installed = views.borrow_and_update().clone();
                    if let Some(view) = installed {
                        detector.update_view(&view, Instant::now());
                    }
                    Vec::new()
                }
                _ = ticker.tick() => detector.tick(Instant::now()),
            };

            for event in produced {
                if events.send(event).await.is_err() {
                    tracing::debug!("Failure detector output closed, stopping");
                    return;
                }
            }
        }

        tracing::debug!("Failure detector stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn member(port: u16) -> MemberIdentifier {
        MemberIdentifier::with_start_time(SocketAddr::from(([10, 1, 0, 1], port)), 11)
    }

    fn view_of(ports: &[u16]) -> View {
        let joins: Vec<_> = ports[1..].iter().map(|p| member(*p)).collect();
        View::initial(member(ports[0])).unwrap().next_view(&joins, &[], &[]).unwrap()
    }

    fn detector(now: Instant) -> FailureDetector {
        let mut detector = FailureDetector::new(member(1), INTERVAL, SuspicionPolicy::default());
        detector.update_view(&view_of(&[1, 2, 3, 4]), now);
        detector
    }

    fn confirmed(events: &[DetectorEvent]) -> Vec<MemberIdentifier> {
        events
            .iter()
            .filter_map(|event| match event {
                DetectorEvent::ConfirmedDead { member, .. } => Some(member.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tracks_peers_only() {
        let start = Instant::now();
        let detector = detector(start);
        assert_eq!(detector.tracked_members(), 3);
        assert_eq!(detector.state(&member(1)), None);
        assert_eq!(detector.state(&member(2)), Some(MemberState::Alive));
    }

    #[test]
    fn test_missed_heartbeats_raise_suspicion() {
        let start = Instant::now();
        let mut detector = detector(start);

        for sequence in 1..=2 {
            let now = start + INTERVAL * sequence;
            detector.record_heartbeat(&member(2), sequence as u64, now);
            detector.record_heartbeat(&member(3), sequence as u64, now);
        }

        // Member 4 has been silent for three intervals
        let events = detector.tick(start + INTERVAL * 3);
        assert_eq!(
            events,
            vec![DetectorEvent::Suspected {
                member: member(4),
                reason: "missed 3 heartbeats".to_string(),
            }]
        );
        assert_eq!(detector.state(&member(4)), Some(MemberState::Suspect));
        assert_eq!(detector.state(&member(2)), Some(MemberState::Alive));
    }

    #[test]
    fn test_heartbeat_refutes_suspicion() {
        let start = Instant::now();
        let mut detector = detector(start);

        detector.tick(start + INTERVAL * 3);
        assert_eq!(detector.state(&member(2)), Some(MemberState::Suspect));

        let events = detector.record_heartbeat(&member(2), 1, start + INTERVAL * 4);
        assert_eq!(events, vec![DetectorEvent::Refuted { member: member(2) }]);
        assert_eq!(detector.state(&member(2)), Some(MemberState::Alive));
        assert!(detector.suspicions(&member(2)).is_empty());
    }

    #[test]
    fn test_stale_heartbeat_does_not_refute() {
        let start = Instant::now();
        let mut detector = detector(start);

        detector.record_heartbeat(&member(2), 5, start);
        detector.tick(start + INTERVAL * 3);
        let events = detector.record_heartbeat(&member(2), 4, start + INTERVAL * 4);
        assert!(events.is_empty());
        assert_eq!(detector.state(&member(2)), Some(MemberState::Suspect));
    }

    #[test]
    fn test_single_report_escalates_after_grace_period() {
        let start = Instant::now();
        let mut detector = detector(start);
        let policy = detector.policy().clone();

        let events = detector.record_suspicion(&member(2), &[member(3)], "no ack", start);
        assert!(events.is_empty(), "remote reports are not re-forwarded");
        assert_eq!(detector.state(&member(3)), Some(MemberState::Suspect));
        assert_eq!(detector.suspicions(&member(3))[0].reason, "no ack");

        // Keep the others alive while waiting
        let almost = start + policy.suspicion_timeout - INTERVAL;
        detector.record_heartbeat(&member(2), 1, almost);
        detector.record_heartbeat(&member(4), 1, almost);
        assert!(confirmed(&detector.tick(almost)).is_empty());

        let later = start + policy.suspicion_timeout;
        detector.record_heartbeat(&member(2), 2, later);
        detector.record_heartbeat(&member(4), 2, later);
        assert_eq!(confirmed(&detector.tick(later)), vec![member(3)]);
        assert_eq!(detector.state(&member(3)), Some(MemberState::ConfirmedDead));
    }

    #[test]
    fn test_two_independent_reporters_confirm_immediately() {
        let start = Instant::now();
        let mut detector = detector(start);

        let first = detector.record_suspicion(&member(2), &[member(4)], "timeout", start);
        assert!(confirmed(&first).is_empty());

        let second = detector.record_suspicion(&member(3), &[member(4)], "timeout", start + INTERVAL);
        assert_eq!(confirmed(&second), vec![member(4)]);
        assert_eq!(detector.state(&member(4)), Some(MemberState::ConfirmedDead));
    }

    #[test]
    fn test_duplicate_reports_from_same_reporter_count_once() {
        let start = Instant::now();
        let mut detector = detector(start);

        for offset in 0..5 {
            let events = detector.record_suspicion(&member(2), &[member(4)], "timeout", start + INTERVAL * offset);
            assert!(confirmed(&events).is_empty());
        }
        assert_eq!(detector.suspicions(&member(4)).len(), 1);
    }

    #[test]
    fn test_reports_outside_grace_period_do_not_combine() {
        let start = Instant::now();
        let mut detector = detector(start);
        let grace = detector.policy().suspicion_timeout;

        detector.record_suspicion(&member(2), &[member(4)], "timeout", start);
        detector.record_heartbeat(&member(4), 1, start + INTERVAL);
        assert_eq!(detector.state(&member(4)), Some(MemberState::Alive));

        let events = detector.record_suspicion(&member(3), &[member(4)], "timeout", start + grace);
        assert!(confirmed(&events).is_empty());
    }

    #[test]
    fn test_confirmed_dead_emitted_exactly_once() {
        let start = Instant::now();
        let mut detector = detector(start);

        let mut all = Vec::new();
        all.extend(detector.record_suspicion(&member(2), &[member(4)], "a", start));
        all.extend(detector.record_suspicion(&member(3), &[member(4)], "b", start));
        all.extend(detector.record_suspicion(&member(2), &[member(4)], "c", start));
        all.extend(detector.suspect(&member(4), "ack timeout", start));
        all.extend(detector.tick(start + Duration::from_secs(60)));
        all.extend(detector.record_heartbeat(&member(4), 99, start + Duration::from_secs(61)));

        assert_eq!(confirmed(&all), vec![member(4)]);

        // Still terminal even if the view lists it again
        detector.update_view(&view_of(&[1, 2, 3, 4]), start + Duration::from_secs(62));
        assert_eq!(detector.state(&member(4)), Some(MemberState::ConfirmedDead));
        assert!(detector.record_heartbeat(&member(4), 100, start).is_empty());
    }

    #[test]
    fn test_local_member_refutes_when_suspected() {
        let start = Instant::now();
        let mut detector = detector(start);

        let events = detector.record_suspicion(&member(2), &[member(1), member(1)], "timeout", start);
        assert_eq!(events, vec![DetectorEvent::RefuteLocalSuspicion]);
    }

    #[test]
    fn test_reports_from_strangers_are_ignored() {
        let start = Instant::now();
        let mut detector = detector(start);

        let events = detector.record_suspicion(&member(99), &[member(2)], "x", start);
        assert!(events.is_empty());
        assert_eq!(detector.state(&member(2)), Some(MemberState::Alive));
    }

    #[test]
    fn test_view_change_drops_departed_records_only() {
        let start = Instant::now();
        let mut detector = detector(start);

        detector.record_suspicion(&member(2), &[member(3)], "x", start);
        let next = view_of(&[1, 2, 3, 4]).next_view(&[member(5)], &[member(4)], &[]).unwrap();
        detector.update_view(&next, start);

        assert_eq!(detector.state(&member(4)), None);
        assert_eq!(detector.state(&member(3)), Some(MemberState::Suspect));
        assert_eq!(detector.state(&member(5)), Some(MemberState::Alive));
    }

    #[test]
    fn test_fast_path_can_be_disabled() {
        let start = Instant::now();
        let policy = SuspicionPolicy {
            independent_reports: 0,
            ..SuspicionPolicy::default()
        };
        let mut detector = FailureDetector::new(member(1), INTERVAL, policy);
        detector.update_view(&view_of(&[1, 2, 3, 4]), start);

        detector.record_suspicion(&member(2), &[member(4)], "a", start);
        let events = detector.record_suspicion(&member(3), &[member(4)], "b", start);
        assert!(confirmed(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reports_silent_member() {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_view_tx, view_rx) = watch::channel(Some(Arc::new(view_of(&[1, 2]))));

        let detector = FailureDetector::new(member(1), INTERVAL, SuspicionPolicy::default());
        let handle = spawn_failure_detector(detector, INTERVAL, input_rx, view_rx, event_tx);

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, DetectorEvent::Suspected { member: ref suspect, .. } if *suspect == member(2)));

        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, DetectorEvent::ConfirmedDead { .. }));

        drop(input_tx);
        handle.await.unwrap();
    }
}
