//! View installation state machine
//!
//! [`ViewManager`] owns the installed view of one member. It consumes
//! membership events and protocol messages together with the current time
//! and returns [`ViewAction`]s for the caller to carry out; it never sends,
//! sleeps or spawns by itself. The service drives it from a single task, so
//! two candidate views are never computed concurrently.
//!
//! Installation is two-phase. The coordinator sends the candidate as
//! `View{Prepare}` to the members of the old and new view, collects
//! [`MessageBody::ViewAck`]s, and once the [`AckPolicy`] is satisfied
//! installs it locally and sends `View{Install}`. Members accept a view only
//! when its number is exactly one above their installed view; a gap makes
//! them request a resync instead.
//!
//! A member accepts at most one candidate per view number. A coordinator
//! whose prepare is refused in favour of another coordinator's candidate
//! adopts that candidate, since it may already be committed elsewhere.

use crate::error::{MembershipError, Result};
use crate::member::MemberIdentifier;
use crate::message::{Message, MessageBody, Recipients, ViewPhase};
use crate::view::{View, ViewDiff};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Acknowledgments required before a candidate view is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// A majority of the candidate's members
    Majority,

    /// Every reachable member; falls back to a majority once retries are
    /// exhausted
    AllReachable,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::Majority
    }
}

/// Retry and commit settings for view installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationPolicy {
    /// Wait for acknowledgments before the first retry
    pub ack_timeout: Duration,

    /// Prepare broadcasts before non-responders are suspected
    pub max_attempts: u32,

    /// Upper bound of the exponential backoff
    pub max_backoff: Duration,

    /// Random extra delay added to each retry
    pub jitter: Duration,

    pub ack_policy: AckPolicy,
}

impl Default for InstallationPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            max_attempts: 4,
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
            ack_policy: AckPolicy::Majority,
        }
    }
}

impl InstallationPolicy {
    /// Delay after send number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .ack_timeout
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Role of the local member with respect to view installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    NotCoordinator,
    CoordinatorStable,
    CoordinatorInstalling,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCoordinator => write!(f, "not-coordinator"),
            Self::CoordinatorStable => write!(f, "coordinator-stable"),
            Self::CoordinatorInstalling => write!(f, "coordinator-installing"),
        }
    }
}

/// Side effects requested by the view manager
#[derive(Debug)]
pub enum ViewAction {
    /// Hand a message to the dispatcher
    Send(Message),

    /// A new view was installed locally
    Installed { view: Arc<View>, diff: ViewDiff },

    /// Members that did not acknowledge a view in time
    Suspect {
        members: Vec<MemberIdentifier>,
        reason: String,
    },

    /// The coordinator refused the local join request
    JoinRejected { reason: String },

    /// The local member left after asking to
    Left,

    /// The local member must stop participating
    Disconnected(MembershipError),
}

/// Membership changes waiting for the next candidate view
#[derive(Debug, Default, Clone)]
struct Batch {
    joins: BTreeMap<MemberIdentifier, Option<String>>,
    leaves: BTreeSet<MemberIdentifier>,
    removals: BTreeSet<MemberIdentifier>,
}

impl Batch {
    /// Changes that turn `base` into `candidate`
    fn between(base: &View, candidate: &View) -> Self {
        let mut batch = Batch::default();
        let diff = candidate.diff(base);
        for joined in diff.joined {
            batch.joins.insert(joined, None);
        }
        for departed in diff.departed {
            if candidate.is_shunned(&departed) {
                batch.removals.insert(departed);
            } else {
                batch.leaves.insert(departed);
            }
        }
        batch
    }

    fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty() && self.removals.is_empty()
    }

    fn merge(&mut self, other: Batch) {
        for (candidate, credentials) in other.joins {
            self.joins.entry(candidate).or_insert(credentials);
        }
        self.leaves.extend(other.leaves);
        self.removals.extend(other.removals);
    }
}

/// A candidate view waiting for acknowledgments
#[derive(Debug)]
struct Installation {
    candidate: View,
    batch: Batch,
    /// Members of the old and new view other than the local member
    recipients: BTreeSet<MemberIdentifier>,
    acked: HashSet<MemberIdentifier>,
    attempts: u32,
    deadline: Instant,
    /// Started by a member taking over from a failed coordinator
    takeover: bool,
    suspected: bool,
}

impl Installation {
    fn unacked(&self) -> Vec<MemberIdentifier> {
        self.recipients
            .iter()
            .filter(|member| !self.acked.contains(*member))
            .cloned()
            .collect()
    }

    fn awaits(&self, member: &MemberIdentifier) -> bool {
        self.recipients.contains(member) && !self.acked.contains(member)
    }

    fn candidate_acks(&self) -> usize {
        self.candidate
            .members()
            .iter()
            .filter(|member| self.acked.contains(*member))
            .count()
    }
}

/// Coordinator state machine of one member
pub struct ViewManager {
    local: MemberIdentifier,
    policy: InstallationPolicy,
    installed: Option<Arc<View>>,
    prepared: Option<View>,
    /// Coordinators that sent the prepared view
    prepared_by: HashSet<MemberIdentifier>,
    coordinating: bool,
    installation: Option<Installation>,
    queued: Batch,
    /// Members confirmed dead locally that may still be in the installed view
    presumed_dead: HashSet<MemberIdentifier>,
    resync_requested: Option<u64>,
    takeover: bool,
    leaving: bool,
    stopped: bool,
}

impl ViewManager {
    pub fn new(local: MemberIdentifier, policy: InstallationPolicy) -> Self {
        Self {
            local,
            policy,
            installed: None,
            prepared: None,
            prepared_by: HashSet::new(),
            coordinating: false,
            installation: None,
            queued: Batch::default(),
            presumed_dead: HashSet::new(),
            resync_requested: None,
            takeover: false,
            leaving: false,
            stopped: false,
        }
    }

    pub fn local(&self) -> &MemberIdentifier {
        &self.local
    }

    pub fn installed(&self) -> Option<&Arc<View>> {
        self.installed.as_ref()
    }

    /// Candidate view acknowledged but not yet installed
    pub fn prepared(&self) -> Option<&View> {
        self.prepared.as_ref()
    }

    pub fn state(&self) -> ManagerState {
        match (self.coordinating, self.installation.is_some()) {
            (false, _) => ManagerState::NotCoordinator,
            (true, false) => ManagerState::CoordinatorStable,
            (true, true) => ManagerState::CoordinatorInstalling,
        }
    }

    /// Whether the manager has left, been rejected or been disconnected
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Acting coordinator: the installed view's coordinator, or its
    /// successor when that coordinator is confirmed dead
    pub fn coordinator(&self) -> Option<MemberIdentifier> {
        self.installed
            .as_ref()
            .and_then(|view| view.coordinator_excluding(&self.presumed_dead))
    }

    /// When [`tick`](Self::tick) next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.installation.as_ref().map(|installation| installation.deadline)
    }

    /// Start a new cluster with the local member as its only member
    pub fn found(&mut self, now: Instant) -> Result<Vec<ViewAction>> {
        let view = View::initial(self.local.clone())?;
        tracing::info!("Founding cluster with {}", view);

        let mut actions = Vec::new();
        self.install(Arc::new(view), now, &mut actions);
        Ok(actions)
    }

    /// Route an inbound protocol message. Heartbeats and suspicion reports
    /// belong to the failure detector and are ignored here.
    pub fn handle_message(&mut self, body: MessageBody, now: Instant) -> Vec<ViewAction> {
        match body {
            MessageBody::JoinRequest { candidate, credentials } => self.handle_join(candidate, credentials, now),
            MessageBody::JoinRejected { candidate, reason } => self.handle_join_rejected(&candidate, reason),
            MessageBody::LeaveRequest { member, reason } => self.handle_leave(member, &reason, now),
            MessageBody::RemoveMember { target, reason } => self.handle_removal(target, &reason, now),
            MessageBody::View { phase, sender, view } => self.handle_view(phase, sender, view, now),
            MessageBody::ViewAck {
                sender,
                view_number,
                accepted,
                installed,
                prepared,
            } => self.handle_ack(sender, view_number, accepted, installed, prepared, now),
            MessageBody::ViewResyncRequest { requester, installed } => {
                self.handle_resync_request(requester, installed)
            }
            MessageBody::Heartbeat { .. } | MessageBody::SuspectMembers { .. } => Vec::new(),
        }
    }

    /// An authenticated join request
    pub fn handle_join(
        &mut self,
        candidate: MemberIdentifier,
        credentials: Option<String>,
        now: Instant,
    ) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }
        let Some(installed) = self.installed.clone() else {
            tracing::debug!("Dropping join request from {} before joining", candidate);
            return actions;
        };

        if !self.coordinating {
            if let Some(coordinator) = self.coordinator() {
                tracing::debug!("Forwarding join request from {} to {}", candidate, coordinator);
                actions.push(ViewAction::Send(Message::join_request(
                    Recipients::Single(coordinator),
                    candidate,
                    credentials,
                )));
            }
            return actions;
        }

        if installed.is_shunned(&candidate) {
            let reason = MembershipError::Shunned(candidate.to_string()).to_string();
            tracing::warn!("Rejecting join: {}", reason);
            actions.push(ViewAction::Send(Message::new(
                Recipients::Single(candidate.clone()),
                MessageBody::JoinRejected { candidate, reason },
            )));
        } else if installed.contains(&candidate) {
            // Already a member; it missed the install
            actions.push(ViewAction::Send(Message::view(
                Recipients::Single(candidate),
                ViewPhase::Sync,
                self.local.clone(),
                (*installed).clone(),
            )));
        } else {
            tracing::info!("Join request from {}", candidate);
            self.queued.joins.entry(candidate).or_insert(credentials);
            self.advance(now, &mut actions);
        }
        actions
    }

    pub fn handle_leave(&mut self, member: MemberIdentifier, reason: &str, now: Instant) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped || self.installed.is_none() {
            return actions;
        }

        if self.coordinating {
            tracing::info!("Member {} is leaving: {}", member, reason);
            self.enqueue_departure(member, false, now, &mut actions);
        } else if let Some(coordinator) = self.coordinator() {
            actions.push(ViewAction::Send(Message::leave_request(coordinator, member, reason)));
        }
        actions
    }

    /// Administrative or failure-driven removal; the target is shunned
    pub fn handle_removal(&mut self, target: MemberIdentifier, reason: &str, now: Instant) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped || self.installed.is_none() {
            return actions;
        }

        if self.coordinating {
            tracing::info!("Removal requested for {}: {}", target, reason);
            self.enqueue_departure(target, true, now, &mut actions);
        } else if self.coordinator().as_ref() == Some(&target) {
            // The acting coordinator is not asked to remove itself
            tracing::info!("Removal requested for acting coordinator {}: {}", target, reason);
            self.presumed_dead.insert(target.clone());
            if let Some(successor) = self.coordinator().filter(|successor| *successor != self.local) {
                actions.push(ViewAction::Send(Message::remove_member(successor, target, reason)));
            }
            self.reconcile(now, &mut actions);
        } else if let Some(coordinator) = self.coordinator() {
            tracing::debug!("Forwarding removal of {} to {}", target, coordinator);
            actions.push(ViewAction::Send(Message::remove_member(coordinator, target, reason)));
        }
        actions
    }

    pub fn handle_view(
        &mut self,
        phase: ViewPhase,
        sender: MemberIdentifier,
        view: View,
        now: Instant,
    ) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }
        let number = view.view_number();

        let Some(installed) = self.installed.clone() else {
            // Joining: accept the first view that contains us
            if !view.contains(&self.local) {
                tracing::debug!("Ignoring view {} that does not include {}", number, self.local);
                return actions;
            }
            match phase {
                ViewPhase::Prepare => match self.competing_prepare(&sender, &view).cloned() {
                    Some(competing) => self.acknowledge(sender, number, false, 0, Some(competing), &mut actions),
                    None => {
                        self.record_prepared(sender.clone(), view);
                        self.acknowledge(sender, number, true, 0, None, &mut actions);
                    }
                },
                ViewPhase::Install | ViewPhase::Sync => self.install(Arc::new(view), now, &mut actions),
            }
            return actions;
        };

        let current = installed.view_number();

        if phase == ViewPhase::Sync {
            if number > current && view.contains(&sender) {
                tracing::info!("Resynchronized from view {} to view {} via {}", current, number, sender);
                self.install(Arc::new(view), now, &mut actions);
            } else {
                tracing::debug!("Ignoring sync of view {} from {} at view {}", number, sender, current);
            }
            return actions;
        }

        if number <= current {
            let error = MembershipError::StaleViewNumber {
                received: number,
                installed: current,
            };
            tracing::warn!("Ignoring {} from {}: {}", phase, sender, error);
            if phase == ViewPhase::Prepare {
                self.acknowledge(sender, number, false, current, None, &mut actions);
            }
            return actions;
        }

        if number > current + 1 {
            let error = MembershipError::ViewNumberGap {
                received: number,
                installed: current,
            };
            tracing::warn!("{} from {}, requesting resync", error, sender);
            self.request_resync(sender, number, &mut actions);
            return actions;
        }

        // Another coordinator finishing a candidate accepted earlier
        let repeats_prepared = installed.contains(&sender) && self.prepared.as_ref() == Some(&view);
        if !repeats_prepared && !self.accepts_from(&installed, &sender, &view) {
            tracing::warn!(
                "Ignoring {} of view {} from {} which does not coordinate view {}",
                phase,
                number,
                sender,
                current
            );
            return actions;
        }

        match phase {
            ViewPhase::Prepare => {
                if let Some(competing) = self.competing_prepare(&sender, &view).cloned() {
                    tracing::warn!(
                        "Refusing view {} from {}: a different view {} was already accepted",
                        number,
                        sender,
                        competing.view_number()
                    );
                    self.acknowledge(sender, number, false, current, Some(competing), &mut actions);
                    return actions;
                }
                if let Some(old) = installed.coordinator() {
                    if *old != sender && !view.contains(old) {
                        // Promise: no more views from the replaced coordinator
                        self.presumed_dead.insert(old.clone());
                    }
                }
                tracing::debug!("Prepared view {} from {}", number, sender);
                self.record_prepared(sender.clone(), view);
                self.acknowledge(sender, number, true, current, None, &mut actions);
            }
            ViewPhase::Install => self.install(Arc::new(view), now, &mut actions),
            ViewPhase::Sync => {}
        }
        actions
    }

    pub fn handle_ack(
        &mut self,
        sender: MemberIdentifier,
        view_number: u64,
        accepted: bool,
        installed: u64,
        prepared: Option<View>,
        now: Instant,
    ) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }

        let base = self.installed.as_ref().map(|view| view.view_number()).unwrap_or(0);
        let Some(installation) = self.installation.as_mut() else {
            tracing::trace!("Ack for view {} from {} with no installation pending", view_number, sender);
            return actions;
        };
        if view_number != installation.candidate.view_number() || !installation.recipients.contains(&sender) {
            tracing::debug!("Ignoring ack for view {} from {}", view_number, sender);
            return actions;
        }

        if accepted {
            installation.acked.insert(sender);
            self.try_commit(now, false, &mut actions);
            return actions;
        }

        let candidate = &installation.candidate;
        let competing =
            prepared.filter(|view| view.view_number() == candidate.view_number() && view != candidate);

        if installed > base {
            tracing::warn!(
                "{} has installed view {} beyond local view {}, resynchronizing",
                sender,
                installed,
                base
            );
            if let Some(aborted) = self.installation.take() {
                self.queued.merge(aborted.batch);
            }
            self.request_resync(sender, installed, &mut actions);
        } else if let Some(competing) = competing {
            self.adopt(sender, competing, now, &mut actions);
        } else {
            tracing::debug!("{} rejected view {}", sender, view_number);
        }
        actions
    }

    pub fn handle_resync_request(&mut self, requester: MemberIdentifier, installed: u64) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if let Some(view) = &self.installed {
            if view.view_number() > installed {
                tracing::debug!("Sending view {} to {} at view {}", view.view_number(), requester, installed);
                actions.push(ViewAction::Send(Message::view(
                    Recipients::Single(requester),
                    ViewPhase::Sync,
                    self.local.clone(),
                    (**view).clone(),
                )));
            }
        }
        actions
    }

    pub fn handle_join_rejected(&mut self, candidate: &MemberIdentifier, reason: String) -> Vec<ViewAction> {
        if candidate != &self.local || self.installed.is_some() || self.stopped {
            return Vec::new();
        }
        tracing::error!("Join rejected: {}", reason);
        self.stopped = true;
        vec![ViewAction::JoinRejected { reason }]
    }

    /// The local failure detector started suspecting `member`
    pub fn handle_suspected(&mut self, member: MemberIdentifier, reason: String) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }
        let (Some(installed), Some(coordinator)) = (self.installed.clone(), self.coordinator()) else {
            return actions;
        };
        if coordinator == self.local {
            return actions;
        }

        let recipients = if coordinator == member {
            // Everyone needs to know when the coordinator itself is in doubt
            Recipients::List(installed.peers(&self.local).cloned().collect())
        } else {
            Recipients::Single(coordinator)
        };
        actions.push(ViewAction::Send(Message::suspect_members(
            recipients,
            self.local.clone(),
            vec![member],
            reason,
        )));
        actions
    }

    /// The local failure detector confirmed `member` dead
    pub fn handle_confirmed_dead(&mut self, member: MemberIdentifier, reason: &str, now: Instant) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped || member == self.local {
            return actions;
        }
        let Some(installed) = self.installed.clone() else {
            return actions;
        };
        if !installed.contains(&member) {
            return actions;
        }

        self.presumed_dead.insert(member.clone());

        if self.coordinating {
            self.enqueue_departure(member, true, now, &mut actions);
            return actions;
        }

        match self.coordinator() {
            Some(coordinator) if coordinator == self.local => {}
            Some(coordinator) => {
                actions.push(ViewAction::Send(Message::remove_member(coordinator, member, reason)));
            }
            None => {}
        }
        self.reconcile(now, &mut actions);
        actions
    }

    /// A peer reported its installed view number, e.g. in a heartbeat
    pub fn observe_peer_view(&mut self, sender: MemberIdentifier, view_number: u64) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }
        if let Some(installed) = &self.installed {
            if view_number > installed.view_number() && installed.contains(&sender) {
                self.request_resync(sender, view_number, &mut actions);
            }
        }
        actions
    }

    /// Ask to leave the cluster
    pub fn request_leave(&mut self, now: Instant) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }
        self.leaving = true;

        if self.installed.is_none() {
            self.stopped = true;
            actions.push(ViewAction::Left);
            return actions;
        }

        if self.coordinating {
            let local = self.local.clone();
            self.enqueue_departure(local, false, now, &mut actions);
        } else if let Some(coordinator) = self.coordinator() {
            actions.push(ViewAction::Send(Message::leave_request(
                coordinator,
                self.local.clone(),
                "shutdown",
            )));
        }
        actions
    }

    /// Retry unacknowledged prepares whose deadline passed
    pub fn tick(&mut self, now: Instant) -> Vec<ViewAction> {
        let mut actions = Vec::new();
        if self.stopped {
            return actions;
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let Some(installation) = self.installation.as_mut() else {
            return actions;
        };
        if now < installation.deadline {
            return actions;
        }

        let unacked = installation.unacked();
        let attempt = installation.attempts;
        let exhausted = attempt >= max_attempts;
        let view_number = installation.candidate.view_number();

        if exhausted && !installation.suspected {
            installation.suspected = true;
            let error = MembershipError::AckTimeout {
                view_number,
                pending: unacked.len(),
            };
            tracing::warn!("{}", error);
            actions.push(ViewAction::Suspect {
                members: unacked.clone(),
                reason: error.to_string(),
            });
        }

        if !unacked.is_empty() {
            tracing::debug!(
                "Retrying prepare of view {} to {} members (attempt {})",
                view_number,
                unacked.len(),
                attempt + 1
            );
            actions.push(ViewAction::Send(Message::view(
                Recipients::List(unacked),
                ViewPhase::Prepare,
                self.local.clone(),
                installation.candidate.clone(),
            )));
        }

        installation.attempts = attempt + 1;
        installation.deadline = now + self.policy.backoff(attempt.min(max_attempts));

        self.try_commit(now, exhausted, &mut actions);
        actions
    }

    fn acknowledge(
        &self,
        coordinator: MemberIdentifier,
        view_number: u64,
        accepted: bool,
        installed: u64,
        prepared: Option<View>,
        actions: &mut Vec<ViewAction>,
    ) {
        actions.push(ViewAction::Send(Message::new(
            Recipients::Single(coordinator),
            MessageBody::ViewAck {
                sender: self.local.clone(),
                view_number,
                accepted,
                installed,
                prepared,
            },
        )));
    }

    /// The prepared view when it is a different candidate for the same
    /// number that `sender` alone cannot replace
    fn competing_prepare(&self, sender: &MemberIdentifier, view: &View) -> Option<&View> {
        let prepared = self.prepared.as_ref()?;
        let replaceable = prepared.view_number() != view.view_number()
            || prepared == view
            || self.prepared_by.iter().all(|proposer| proposer == sender);
        if replaceable {
            None
        } else {
            Some(prepared)
        }
    }

    fn record_prepared(&mut self, sender: MemberIdentifier, view: View) {
        if self.prepared.as_ref() != Some(&view) {
            self.prepared = Some(view);
            self.prepared_by.clear();
        }
        self.prepared_by.insert(sender);
    }

    /// Replace the pending candidate with one `reporter` already accepted
    /// from another coordinator; the local changes wait for the next view
    fn adopt(&mut self, reporter: MemberIdentifier, candidate: View, now: Instant, actions: &mut Vec<ViewAction>) {
        let (Some(base), Some(aborted)) = (self.installed.clone(), self.installation.take()) else {
            return;
        };
        tracing::warn!(
            "{} already accepted a different view {}, adopting it",
            reporter,
            candidate.view_number()
        );
        self.queued.merge(aborted.batch);

        let batch = Batch::between(&base, &candidate);
        self.start_installation(candidate, batch, aborted.takeover, now, actions);
    }

    fn request_resync(&mut self, target: MemberIdentifier, seen: u64, actions: &mut Vec<ViewAction>) {
        if self.resync_requested.map_or(false, |requested| requested >= seen) {
            return;
        }
        self.resync_requested = Some(seen);

        let installed = self.installed.as_ref().map(|view| view.view_number()).unwrap_or(0);
        actions.push(ViewAction::Send(Message::new(
            Recipients::Single(target),
            MessageBody::ViewResyncRequest {
                requester: self.local.clone(),
                installed,
            },
        )));
    }

    /// Whether `sender` may drive the installation of `view` on top of
    /// `installed`: it is the coordinator, or the candidate drops the
    /// coordinator and `sender` is next in line.
    fn accepts_from(&self, installed: &View, sender: &MemberIdentifier, view: &View) -> bool {
        if self.presumed_dead.contains(sender) {
            return false;
        }
        if installed.is_coordinator(sender) {
            return true;
        }
        match installed.coordinator() {
            Some(coordinator) if !view.contains(coordinator) => {
                let departed: HashSet<MemberIdentifier> = installed
                    .members()
                    .iter()
                    .filter(|member| !view.contains(member))
                    .cloned()
                    .collect();
                installed.coordinator_excluding(&departed).as_ref() == Some(sender)
            }
            _ => false,
        }
    }

    fn enqueue_departure(&mut self, member: MemberIdentifier, removal: bool, now: Instant, actions: &mut Vec<ViewAction>) {
        let supersede = self
            .installation
            .as_ref()
            .map_or(false, |installation| {
                installation.awaits(&member) && installation.candidate.contains(&member)
            });

        if removal {
            self.queued.removals.insert(member.clone());
        } else {
            self.queued.leaves.insert(member.clone());
        }

        if supersede {
            if let Some(superseded) = self.installation.take() {
                tracing::info!(
                    "Superseding installation of view {}: {} departed while its ack was pending",
                    superseded.candidate.view_number(),
                    member
                );
                let mut batch = superseded.batch;
                batch.merge(std::mem::take(&mut self.queued));
                self.queued = batch;
            }
        }

        self.advance(now, actions);
    }

    /// Start the next installation if the local member coordinates, none is
    /// in progress and changes are queued
    fn advance(&mut self, now: Instant, actions: &mut Vec<ViewAction>) {
        if self.stopped || !self.coordinating || self.installation.is_some() || self.queued.is_empty() {
            return;
        }
        let Some(base) = self.installed.clone() else {
            return;
        };

        let mut batch = std::mem::take(&mut self.queued);

        let shunned: Vec<MemberIdentifier> = batch
            .joins
            .keys()
            .filter(|candidate| base.is_shunned(candidate))
            .cloned()
            .collect();
        for candidate in shunned {
            batch.joins.remove(&candidate);
            let reason = MembershipError::Shunned(candidate.to_string()).to_string();
            actions.push(ViewAction::Send(Message::new(
                Recipients::Single(candidate.clone()),
                MessageBody::JoinRejected { candidate, reason },
            )));
        }
        batch.joins.retain(|candidate, _| !base.contains(candidate));
        batch.leaves.retain(|member| base.contains(member));
        batch.removals.retain(|member| base.contains(member));

        if batch.is_empty() {
            return;
        }

        let joins: Vec<MemberIdentifier> = batch.joins.keys().cloned().collect();
        let leaves: Vec<MemberIdentifier> = batch.leaves.iter().cloned().collect();
        let removals: Vec<MemberIdentifier> = batch.removals.iter().cloned().collect();

        let candidate = match base.next_view(&joins, &leaves, &removals) {
            Ok(candidate) => candidate,
            Err(MembershipError::EmptyView) => {
                tracing::warn!(
                    "Keeping view {}: applying {} leaves and {} removals would leave it empty",
                    base.view_number(),
                    leaves.len(),
                    removals.len()
                );
                if self.leaving && batch.leaves.contains(&self.local) {
                    tracing::info!("Last member {} leaving", self.local);
                    self.stopped = true;
                    actions.push(ViewAction::Left);
                }
                return;
            }
            Err(error) => {
                self.disconnect(error, actions);
                return;
            }
        };

        tracing::info!(
            "Preparing view {} ({} joins, {} leaves, {} removals)",
            candidate.view_number(),
            joins.len(),
            leaves.len(),
            removals.len()
        );
        self.start_installation(candidate, batch, self.takeover, now, actions);
    }

    /// Send the prepare of `candidate` and wait for acknowledgments
    fn start_installation(
        &mut self,
        candidate: View,
        batch: Batch,
        takeover: bool,
        now: Instant,
        actions: &mut Vec<ViewAction>,
    ) {
        let Some(base) = self.installed.clone() else {
            return;
        };

        let recipients: BTreeSet<MemberIdentifier> = base
            .members()
            .iter()
            .chain(candidate.members())
            .filter(|member| **member != self.local)
            .cloned()
            .collect();

        let mut acked = HashSet::new();
        if candidate.contains(&self.local) {
            acked.insert(self.local.clone());
        }
        self.record_prepared(self.local.clone(), candidate.clone());

        if !recipients.is_empty() {
            actions.push(ViewAction::Send(Message::view(
                Recipients::List(recipients.iter().cloned().collect()),
                ViewPhase::Prepare,
                self.local.clone(),
                candidate.clone(),
            )));
        }

        self.installation = Some(Installation {
            candidate,
            batch,
            recipients,
            acked,
            attempts: 1,
            deadline: now + self.policy.backoff(0),
            takeover,
            suspected: false,
        });

        self.try_commit(now, false, actions);
    }

    fn try_commit(&mut self, now: Instant, exhausted: bool, actions: &mut Vec<ViewAction>) {
        let Some(installation) = &self.installation else {
            return;
        };

        let majority = installation.candidate_acks() >= installation.candidate.majority();
        let all_reachable = installation
            .recipients
            .iter()
            .filter(|member| !self.presumed_dead.contains(*member))
            .all(|member| installation.acked.contains(member));

        let ready = match (self.policy.ack_policy, installation.takeover) {
            (AckPolicy::Majority, false) => majority,
            _ => all_reachable || (exhausted && majority),
        };
        if !ready {
            return;
        }

        if let Some(installation) = self.installation.take() {
            let view = Arc::new(installation.candidate);
            tracing::info!(
                "Committing view {} with {} acknowledgments",
                view.view_number(),
                installation.acked.len()
            );

            if !installation.recipients.is_empty() {
                actions.push(ViewAction::Send(Message::view(
                    Recipients::List(installation.recipients.into_iter().collect()),
                    ViewPhase::Install,
                    self.local.clone(),
                    (*view).clone(),
                )));
            }
            self.takeover = false;
            self.install(view, now, actions);
        }
    }

    fn install(&mut self, view: Arc<View>, now: Instant, actions: &mut Vec<ViewAction>) {
        let number = view.view_number();

        if !view.contains(&self.local) {
            self.stopped = true;
            self.installation = None;
            if self.leaving {
                tracing::info!("{} left the cluster at view {}", self.local, number);
                actions.push(ViewAction::Left);
            } else {
                let error = MembershipError::forced_disconnect(format!(
                    "{} is not a member of view {}",
                    self.local, number
                ));
                tracing::error!("{}", error);
                actions.push(ViewAction::Disconnected(error));
            }
            return;
        }

        let diff = match &self.installed {
            Some(previous) => view.diff(previous),
            None => ViewDiff {
                joined: view.members().to_vec(),
                ..ViewDiff::default()
            },
        };

        tracing::info!("Installed {}", view);
        self.installed = Some(view.clone());
        if self.prepared.as_ref().map_or(false, |prepared| prepared.view_number() <= number) {
            self.prepared = None;
            self.prepared_by.clear();
        }
        if self.resync_requested.map_or(false, |requested| requested <= number) {
            self.resync_requested = None;
        }
        self.presumed_dead.retain(|member| view.contains(member));

        actions.push(ViewAction::Installed { view, diff });
        self.reconcile(now, actions);
    }

    /// Adjust the local role to the acting coordinator
    fn reconcile(&mut self, now: Instant, actions: &mut Vec<ViewAction>) {
        if self.stopped {
            return;
        }
        let Some(installed) = self.installed.clone() else {
            return;
        };

        match self.coordinator() {
            None => self.disconnect(MembershipError::NoEligibleCoordinator, actions),
            Some(coordinator) if coordinator == self.local => {
                if !self.coordinating {
                    self.coordinating = true;
                    self.take_over(&installed, now, actions);
                }
                self.advance(now, actions);
            }
            Some(coordinator) => {
                if self.coordinating {
                    tracing::info!("Handing coordination of view {} to {}", installed.view_number(), coordinator);
                    self.coordinating = false;
                    self.takeover = false;
                    if let Some(aborted) = self.installation.take() {
                        self.queued.merge(aborted.batch);
                    }
                    self.forward_queued(coordinator, actions);
                }
            }
        }
    }

    /// Become coordinator of `installed`. On failover a prepared candidate is
    /// finished unchanged before the dead members are removed, since the
    /// failed coordinator may have committed it.
    fn take_over(&mut self, installed: &View, now: Instant, actions: &mut Vec<ViewAction>) {
        let failover = !installed.is_coordinator(&self.local);
        tracing::info!(
            "{} is now coordinator of view {}{}",
            self.local,
            installed.view_number(),
            if failover { " (failover)" } else { "" }
        );
        if !failover {
            return;
        }
        self.takeover = true;

        for dead in &self.presumed_dead {
            if installed.contains(dead) {
                self.queued.removals.insert(dead.clone());
            }
        }

        if let Some(prepared) = self.prepared.clone() {
            if prepared.view_number() == installed.view_number() + 1 {
                tracing::info!("Resuming installation of prepared view {}", prepared.view_number());
                let batch = Batch::between(installed, &prepared);
                self.start_installation(prepared, batch, true, now, actions);
            }
        }
    }

    fn forward_queued(&mut self, coordinator: MemberIdentifier, actions: &mut Vec<ViewAction>) {
        let batch = std::mem::take(&mut self.queued);
        for (candidate, credentials) in batch.joins {
            actions.push(ViewAction::Send(Message::join_request(
                Recipients::Single(coordinator.clone()),
                candidate,
                credentials,
            )));
        }
        for member in batch.leaves {
            actions.push(ViewAction::Send(Message::leave_request(coordinator.clone(), member, "forwarded")));
        }
        for target in batch.removals {
            actions.push(ViewAction::Send(Message::remove_member(coordinator.clone(), target, "forwarded")));
        }
    }

    fn disconnect(&mut self, error: MembershipError, actions: &mut Vec<ViewAction>) {
        tracing::error!("Membership lost: {}", error);
        self.stopped = true;
        self.coordinating = false;
        self.installation = None;
        actions.push(ViewAction::Disconnected(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberRole;
    use std::collections::{HashMap, VecDeque};
    use std::net::SocketAddr;

    fn member(port: u16) -> MemberIdentifier {
        MemberIdentifier::with_start_time(SocketAddr::from(([10, 2, 0, 1], port)), 500).with_name(format!("m{}", port))
    }

    fn policy() -> InstallationPolicy {
        InstallationPolicy {
            ack_timeout: Duration::from_millis(100),
            max_attempts: 3,
            max_backoff: Duration::from_millis(400),
            jitter: Duration::ZERO,
            ack_policy: AckPolicy::Majority,
        }
    }

    /// Deterministic message-passing cluster of view managers
    struct Sim {
        now: Instant,
        nodes: BTreeMap<MemberIdentifier, ViewManager>,
        outcomes: HashMap<MemberIdentifier, Vec<ViewAction>>,
        history: HashMap<MemberIdentifier, Vec<Arc<View>>>,
        queue: VecDeque<(MemberIdentifier, MemberIdentifier, Message)>,
        isolated: HashSet<MemberIdentifier>,
        delivered: Vec<(MemberIdentifier, Message)>,
        sent: usize,
    }

    impl Sim {
        fn new() -> Self {
            Self {
                now: Instant::now(),
                nodes: BTreeMap::new(),
                outcomes: HashMap::new(),
                history: HashMap::new(),
                queue: VecDeque::new(),
                isolated: HashSet::new(),
                delivered: Vec::new(),
                sent: 0,
            }
        }

        fn add(&mut self, id: &MemberIdentifier) {
            self.nodes.insert(id.clone(), ViewManager::new(id.clone(), policy()));
        }

        fn cluster(ports: &[u16]) -> Self {
            let mut sim = Self::new();
            let founder = member(ports[0]);
            sim.add(&founder);
            sim.input(&founder, |m, now| m.found(now).unwrap());
            for port in &ports[1..] {
                let joiner = member(*port);
                sim.add(&joiner);
                sim.send(&joiner, Message::join_request(Recipients::Single(founder.clone()), joiner.clone(), None));
                sim.run();
            }
            sim
        }

        fn input(&mut self, id: &MemberIdentifier, f: impl FnOnce(&mut ViewManager, Instant) -> Vec<ViewAction>) {
            let now = self.now;
            let actions = f(self.nodes.get_mut(id).unwrap(), now);
            self.apply(id, actions);
        }

        fn send(&mut self, from: &MemberIdentifier, message: Message) {
            self.apply(from, vec![ViewAction::Send(message)]);
        }

        fn apply(&mut self, from: &MemberIdentifier, actions: Vec<ViewAction>) {
            for action in actions {
                match action {
                    ViewAction::Send(message) => {
                        let targets: Vec<MemberIdentifier> = match message.recipients.members() {
                            Some(members) => members.to_vec(),
                            None => self.nodes[from]
                                .installed()
                                .map(|view| view.peers(from).cloned().collect())
                                .unwrap_or_default(),
                        };
                        for to in targets {
                            self.sent += 1;
                            self.queue.push_back((from.clone(), to, message.clone()));
                        }
                    }
                    ViewAction::Installed { view, .. } => {
                        self.history.entry(from.clone()).or_default().push(view);
                    }
                    other => self.outcomes.entry(from.clone()).or_default().push(other),
                }
            }
        }

        fn run(&mut self) {
            while let Some((from, to, message)) = self.queue.pop_front() {
                if self.isolated.contains(&from) || self.isolated.contains(&to) {
                    continue;
                }
                self.delivered.push((to.clone(), message.clone()));
                let actions = match self.nodes.get_mut(&to) {
                    Some(node) => node.handle_message(message.body, self.now),
                    None => continue,
                };
                self.apply(&to, actions);
            }
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            let ids: Vec<MemberIdentifier> = self.nodes.keys().cloned().collect();
            for id in ids {
                if !self.isolated.contains(&id) {
                    self.input(&id, |m, now| m.tick(now));
                }
            }
            self.run();
        }

        fn view(&self, id: &MemberIdentifier) -> Arc<View> {
            self.nodes[id].installed().cloned().unwrap()
        }

        fn outcomes(&self, id: &MemberIdentifier) -> &[ViewAction] {
            self.outcomes.get(id).map(Vec::as_slice).unwrap_or_default()
        }

        fn assert_agreement(&self, ids: &[MemberIdentifier]) {
            let reference = self.view(&ids[0]);
            for id in &ids[1..] {
                assert_eq!(*self.view(id), *reference, "{} disagrees", id);
            }
        }

        fn assert_consecutive(&self, id: &MemberIdentifier) {
            let history = &self.history[id];
            for pair in history.windows(2) {
                assert_eq!(pair[1].view_number(), pair[0].view_number() + 1, "{} skipped a view", id);
            }
        }
    }

    #[test]
    fn test_founding_and_joining() {
        let sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        sim.assert_agreement(&[a.clone(), b.clone(), c.clone()]);
        let view = sim.view(&a);
        assert_eq!(view.view_number(), 3);
        assert_eq!(view.members(), &[a.clone(), b.clone(), c.clone()]);
        assert_eq!(view.coordinator(), Some(&a));

        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorStable);
        assert_eq!(sim.nodes[&b].state(), ManagerState::NotCoordinator);
        sim.assert_consecutive(&a);
        sim.assert_consecutive(&b);
    }

    #[test]
    fn test_admin_removal_shuns_member() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        sim.send(&c, Message::remove_member(a.clone(), b.clone(), "admin request"));
        sim.run();

        sim.assert_agreement(&[a.clone(), c.clone()]);
        let view = sim.view(&a);
        assert_eq!(view.view_number(), 4);
        assert_eq!(view.members(), &[a.clone(), c.clone()]);
        assert_eq!(view.coordinator(), Some(&a));
        assert!(view.is_shunned(&b));

        assert!(sim.nodes[&b].is_stopped());
        assert!(matches!(
            sim.outcomes(&b),
            [ViewAction::Disconnected(MembershipError::ForcedDisconnect(_))]
        ));

        // Same identity is turned away
        let actions = sim.nodes.get_mut(&a).unwrap().handle_join(b.clone(), None, sim.now);
        assert!(matches!(
            actions.as_slice(),
            [ViewAction::Send(Message { body: MessageBody::JoinRejected { .. }, .. })]
        ));

        // A restarted process is a new member
        let restarted = b.restarted();
        sim.add(&restarted);
        sim.send(&restarted, Message::join_request(Recipients::Single(a.clone()), restarted.clone(), None));
        sim.run();

        let view = sim.view(&a);
        assert_eq!(view.view_number(), 5);
        assert!(view.contains(&restarted));
        sim.assert_agreement(&[a, c, restarted]);
    }

    #[test]
    fn test_rejected_joiner_stops() {
        let mut sim = Sim::cluster(&[1, 2]);
        let (a, b) = (member(1), member(2));
        sim.send(&a, Message::remove_member(a.clone(), b.clone(), "admin request"));
        sim.run();

        let mut joiner = ViewManager::new(b.clone(), policy());
        let actions = joiner.handle_message(
            MessageBody::JoinRejected {
                candidate: b.clone(),
                reason: MembershipError::Shunned(b.to_string()).to_string(),
            },
            sim.now,
        );
        assert!(matches!(actions.as_slice(), [ViewAction::JoinRejected { .. }]));
        assert!(joiner.is_stopped());
    }

    #[test]
    fn test_removing_sole_member_keeps_view() {
        let mut sim = Sim::cluster(&[1]);
        let a = member(1);

        sim.input(&a, |m, now| m.handle_removal(a.clone(), "admin request", now));
        sim.run();

        let view = sim.view(&a);
        assert_eq!(view.view_number(), 1);
        assert_eq!(view.members(), &[a.clone()]);
        assert!(!sim.nodes[&a].is_stopped());
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorStable);
    }

    #[test]
    fn test_duplicate_removals_coalesce() {
        let mut sim = Sim::cluster(&[1, 2, 3, 4]);
        let (a, d) = (member(1), member(4));
        sim.isolated.insert(d.clone());

        sim.input(&a, |m, now| m.handle_confirmed_dead(d.clone(), "silent", now));
        sim.send(&member(2), Message::remove_member(a.clone(), d.clone(), "silent"));
        sim.send(&member(3), Message::remove_member(a.clone(), d.clone(), "silent"));
        sim.input(&a, |m, now| m.handle_removal(d.clone(), "admin request", now));
        sim.run();
        sim.advance(Duration::from_secs(1));

        let view = sim.view(&a);
        assert_eq!(view.view_number(), 5);
        assert!(!view.contains(&d));
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorStable);
        sim.assert_agreement(&[a, member(2), member(3)]);
    }

    #[test]
    fn test_member_leave() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        sim.input(&b, |m, now| m.request_leave(now));
        sim.run();

        let view = sim.view(&a);
        assert_eq!(view.members(), &[a.clone(), c.clone()]);
        assert!(!view.is_shunned(&b));
        assert!(matches!(sim.outcomes(&b), [ViewAction::Left]));
        sim.assert_agreement(&[a, c]);
    }

    #[test]
    fn test_coordinator_leave_hands_over() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        sim.input(&a, |m, now| m.request_leave(now));
        sim.run();

        assert!(matches!(sim.outcomes(&a), [ViewAction::Left]));
        let view = sim.view(&b);
        assert_eq!(view.view_number(), 4);
        assert_eq!(view.coordinator(), Some(&b));
        assert_eq!(sim.nodes[&b].state(), ManagerState::CoordinatorStable);
        sim.assert_agreement(&[b, c]);
    }

    #[test]
    fn test_last_member_leaves() {
        let mut sim = Sim::cluster(&[1]);
        let a = member(1);
        sim.input(&a, |m, now| m.request_leave(now));
        assert!(matches!(sim.outcomes(&a), [ViewAction::Left]));
    }

    #[test]
    fn test_stale_prepare_is_nacked() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b) = (member(1), member(2));
        let old = sim.history[&b][0].clone();

        let actions = sim.nodes.get_mut(&b).unwrap().handle_view(ViewPhase::Prepare, a.clone(), (*old).clone(), sim.now);
        match actions.as_slice() {
            [ViewAction::Send(Message {
                body:
                    MessageBody::ViewAck {
                        accepted, installed, ..
                    },
                ..
            })] => {
                assert!(!accepted);
                assert_eq!(*installed, 3);
            }
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(sim.view(&b).view_number(), 3);
    }

    #[test]
    fn test_gap_triggers_resync() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, c) = (member(1), member(3));

        // C misses two views
        sim.isolated.insert(c.clone());
        for port in [4, 5] {
            let joiner = member(port);
            sim.add(&joiner);
            sim.send(&joiner, Message::join_request(Recipients::Single(a.clone()), joiner.clone(), None));
            sim.run();
        }
        assert_eq!(sim.view(&a).view_number(), 5);
        assert_eq!(sim.view(&c).view_number(), 3);

        sim.isolated.remove(&c);
        let joiner = member(6);
        sim.add(&joiner);
        sim.send(&joiner, Message::join_request(Recipients::Single(a.clone()), joiner.clone(), None));
        sim.run();

        assert!(sim
            .delivered
            .iter()
            .any(|(to, m)| *to == a && matches!(m.body, MessageBody::ViewResyncRequest { installed: 3, .. })));
        assert_eq!(sim.view(&a).view_number(), 6);
        sim.assert_agreement(&[a, member(2), c.clone(), member(4), member(5), member(6)]);

        // The view number jumped through a resync, never through a gap install
        let numbers: Vec<u64> = sim.history[&c].iter().map(|v| v.view_number()).collect();
        assert_eq!(numbers, vec![3, 5, 6]);
    }

    #[test]
    fn test_heartbeat_view_number_triggers_resync() {
        let mut sim = Sim::cluster(&[1, 2]);
        let (a, b) = (member(1), member(2));

        let actions = sim.nodes.get_mut(&b).unwrap().observe_peer_view(a.clone(), 7);
        assert!(matches!(
            actions.as_slice(),
            [ViewAction::Send(Message { body: MessageBody::ViewResyncRequest { installed: 2, .. }, .. })]
        ));

        // Only once per observed number
        assert!(sim.nodes.get_mut(&b).unwrap().observe_peer_view(a, 7).is_empty());
    }

    #[test]
    fn test_nack_with_newer_view_aborts_and_resyncs() {
        let mut sim = Sim::cluster(&[1, 2]);
        let (a, b, c) = (member(1), member(2), member(3));
        sim.isolated.insert(b.clone());
        sim.isolated.insert(c.clone());

        sim.input(&a, |m, now| m.handle_join(c.clone(), None, now));
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorInstalling);

        let actions = sim.nodes.get_mut(&a).unwrap().handle_ack(b.clone(), 3, false, 5, None, sim.now);
        assert!(matches!(
            actions.as_slice(),
            [ViewAction::Send(Message { body: MessageBody::ViewResyncRequest { installed: 2, .. }, .. })]
        ));
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorStable);
    }

    #[test]
    fn test_ack_timeout_suspects_non_responders() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c, d) = (member(1), member(2), member(3), member(4));
        sim.isolated.insert(b.clone());
        sim.isolated.insert(c.clone());
        sim.add(&d);

        sim.send(&d, Message::join_request(Recipients::Single(a.clone()), d.clone(), None));
        sim.run();
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorInstalling);

        for _ in 0..3 {
            sim.advance(Duration::from_millis(500));
        }

        let suspects: Vec<&Vec<MemberIdentifier>> = sim
            .outcomes(&a)
            .iter()
            .filter_map(|action| match action {
                ViewAction::Suspect { members, .. } => Some(members),
                _ => None,
            })
            .collect();
        assert_eq!(suspects, vec![&vec![b.clone(), c.clone()]]);

        // Retries continue after the suspicion
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorInstalling);
        let before = sim.sent;
        sim.advance(Duration::from_secs(1));
        assert!(sim.sent > before);

        // Once the failure detector removes them the change goes through
        sim.input(&a, |m, now| m.handle_confirmed_dead(b.clone(), "ack timeout", now));
        sim.input(&a, |m, now| m.handle_confirmed_dead(c.clone(), "ack timeout", now));
        sim.run();

        let view = sim.view(&a);
        assert_eq!(view.members(), &[a.clone(), d.clone()]);
        assert_eq!(view.view_number(), 4);
        sim.assert_agreement(&[a, d]);
    }

    #[test]
    fn test_removal_supersedes_pending_installation() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c, d) = (member(1), member(2), member(3), member(4));
        sim.isolated.insert(c.clone());
        sim.add(&d);

        // D joins but D and C are unreachable: waiting on acks
        sim.isolated.insert(d.clone());
        sim.input(&a, |m, now| m.handle_join(d.clone(), None, now));
        sim.run();
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorInstalling);
        assert_eq!(sim.nodes[&b].prepared().map(View::view_number), Some(4));

        sim.input(&a, |m, now| m.handle_removal(c.clone(), "admin request", now));
        sim.run();

        let view = sim.view(&a);
        assert_eq!(view.view_number(), 4, "corrected candidate keeps the number");
        assert!(view.is_shunned(&c));
        assert!(view.contains(&d));
        assert_eq!(view.members().len(), 3);
        sim.assert_agreement(&[a, b]);
    }

    #[test]
    fn test_coordinator_failure_mid_installation() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c, d) = (member(1), member(2), member(3), member(4));
        sim.add(&d);

        // A prepares view 4 adding D, then dies before collecting acks
        sim.input(&a, |m, now| m.handle_join(d.clone(), None, now));
        let prepares: Vec<_> = sim.queue.drain(..).collect();
        sim.isolated.insert(a.clone());
        for (_, to, message) in prepares {
            let now = sim.now;
            let actions = sim.nodes.get_mut(&to).unwrap().handle_message(message.body, now);
            sim.apply(&to, actions);
        }
        sim.run();
        assert_eq!(sim.nodes[&b].prepared().map(View::view_number), Some(4));
        assert_eq!(sim.view(&b).view_number(), 3);

        // B detects the death, finishes A's view 4 unchanged, then removes A
        sim.input(&b, |m, now| m.handle_confirmed_dead(a.clone(), "silent", now));
        sim.run();

        let finished = sim.history[&b].iter().find(|view| view.view_number() == 4).unwrap().clone();
        assert_eq!(finished.members(), &[a.clone(), b.clone(), c.clone(), d.clone()]);

        let view = sim.view(&b);
        assert_eq!(view.view_number(), 5);
        assert_eq!(view.coordinator(), Some(&b));
        assert!(view.contains(&d));
        assert!(view.is_shunned(&a));
        sim.assert_agreement(&[b.clone(), c.clone(), d.clone()]);
        sim.assert_consecutive(&b);
        sim.assert_consecutive(&c);
        sim.assert_consecutive(&d);

        // The stale coordinator can no longer drive C
        let stale = View::initial(a.clone()).unwrap();
        let actions = sim.nodes.get_mut(&c).unwrap().handle_view(ViewPhase::Install, a, stale, sim.now);
        assert!(actions.is_empty());
        assert_eq!(sim.view(&c).view_number(), 5);
    }

    #[test]
    fn test_member_accepts_one_candidate_per_view_number() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        // A prepares view 4 without B; B never sees it and C's ack is delayed
        sim.input(&a, |m, now| m.handle_removal(b.clone(), "admin request", now));
        let to_c = sim
            .queue
            .drain(..)
            .find(|(_, to, _)| *to == c)
            .map(|(_, _, message)| message)
            .unwrap();
        let now = sim.now;
        let delayed_ack = sim.nodes.get_mut(&c).unwrap().handle_message(to_c.body, now);

        // B wrongly confirms A dead and prepares its own view 4
        sim.isolated.insert(a.clone());
        sim.input(&b, |m, now| m.handle_confirmed_dead(a.clone(), "silent", now));
        sim.run();
        assert!(sim.delivered.iter().any(|(to, m)| *to == b
            && matches!(
                &m.body,
                MessageBody::ViewAck {
                    accepted: false,
                    prepared: Some(_),
                    ..
                }
            )));

        // A was alive all along and gets C's ack
        sim.isolated.remove(&a);
        sim.apply(&c, delayed_ack);
        sim.run();

        let mut installed: HashMap<u64, Vec<MemberIdentifier>> = HashMap::new();
        for views in sim.history.values() {
            for view in views {
                let members = installed
                    .entry(view.view_number())
                    .or_insert_with(|| view.members().to_vec());
                assert_eq!(members.as_slice(), view.members(), "two versions of view {}", view.view_number());
            }
        }

        let view = sim.view(&a);
        assert_eq!(view.view_number(), 4);
        assert_eq!(view.members(), &[a.clone(), c.clone()]);
        assert!(view.is_shunned(&b));
        sim.assert_agreement(&[a, c]);
        assert!(sim.nodes[&b].is_stopped());
        assert!(matches!(
            sim.outcomes(&b),
            [ViewAction::Disconnected(MembershipError::ForcedDisconnect(_))]
        ));
    }

    #[test]
    fn test_same_coordinator_may_replace_its_candidate() {
        let mut sim = Sim::cluster(&[1, 2]);
        let (a, b) = (member(1), member(2));
        let base = sim.view(&a);
        let first = base.next_view(&[member(3)], &[], &[]).unwrap();
        let second = base.next_view(&[member(4)], &[], &[]).unwrap();

        let node = sim.nodes.get_mut(&b).unwrap();
        node.handle_view(ViewPhase::Prepare, a.clone(), first.clone(), sim.now);
        let actions = node.handle_view(ViewPhase::Prepare, a, second.clone(), sim.now);
        assert!(matches!(
            actions.as_slice(),
            [ViewAction::Send(Message { body: MessageBody::ViewAck { accepted: true, .. }, .. })]
        ));
        assert_eq!(node.prepared(), Some(&second));
    }

    #[test]
    fn test_sync_requires_sender_in_view() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));
        let outsider = member(9);
        let ahead = View::from_parts(7, Some(a.clone()), vec![a.clone(), b.clone(), c], BTreeSet::new()).unwrap();

        let node = sim.nodes.get_mut(&b).unwrap();
        assert!(node.handle_view(ViewPhase::Sync, outsider, ahead.clone(), sim.now).is_empty());
        assert_eq!(sim.view(&b).view_number(), 3);

        let node = sim.nodes.get_mut(&b).unwrap();
        let actions = node.handle_view(ViewPhase::Sync, a, ahead, sim.now);
        assert!(actions.iter().any(|action| matches!(action, ViewAction::Installed { .. })));
        assert_eq!(sim.view(&b).view_number(), 7);
    }

    #[test]
    fn test_removal_of_coordinator_goes_to_successor() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));
        sim.isolated.insert(a.clone());

        let actions = sim.nodes.get_mut(&c).unwrap().handle_removal(a.clone(), "admin request", sim.now);
        match actions.as_slice() {
            [ViewAction::Send(message)] => {
                assert_eq!(message.recipients, Recipients::Single(b.clone()));
                assert!(matches!(&message.body, MessageBody::RemoveMember { target, .. } if *target == a));
            }
            other => panic!("unexpected actions {:?}", other),
        }
        sim.apply(&c, actions);
        sim.run();

        let view = sim.view(&b);
        assert_eq!(view.view_number(), 4);
        assert_eq!(view.members(), &[b.clone(), c.clone()]);
        assert_eq!(view.coordinator(), Some(&b));
        assert!(view.is_shunned(&a));
        sim.assert_agreement(&[b, c]);
    }

    #[test]
    fn test_suspicion_routing() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, b, c) = (member(1), member(2), member(3));

        let actions = sim.nodes.get_mut(&b).unwrap().handle_suspected(c.clone(), "missed".into());
        match actions.as_slice() {
            [ViewAction::Send(message)] => assert_eq!(message.recipients, Recipients::Single(a.clone())),
            other => panic!("unexpected {:?}", other),
        }

        let actions = sim.nodes.get_mut(&b).unwrap().handle_suspected(a.clone(), "missed".into());
        match actions.as_slice() {
            [ViewAction::Send(message)] => {
                assert_eq!(message.recipients, Recipients::List(vec![a.clone(), c.clone()]))
            }
            other => panic!("unexpected {:?}", other),
        }

        // Coordinator keeps its own suspicions local
        assert!(sim.nodes.get_mut(&a).unwrap().handle_suspected(b, "missed".into()).is_empty());
    }

    #[test]
    fn test_no_eligible_coordinator_is_fatal() {
        let mut sim = Sim::new();
        let a = member(1);
        let observer = member(2).with_role(MemberRole::Observer);
        sim.add(&a);
        sim.add(&observer);
        sim.input(&a, |m, now| m.found(now).unwrap());
        sim.send(&observer, Message::join_request(Recipients::Single(a.clone()), observer.clone(), None));
        sim.run();
        assert_eq!(sim.view(&observer).view_number(), 2);

        sim.input(&observer, |m, now| m.handle_confirmed_dead(a.clone(), "silent", now));
        assert!(matches!(
            sim.outcomes(&observer),
            [ViewAction::Disconnected(MembershipError::NoEligibleCoordinator)]
        ));
        assert!(MembershipError::NoEligibleCoordinator.is_fatal());
    }

    #[test]
    fn test_observer_cannot_found() {
        let mut manager = ViewManager::new(member(1).with_role(MemberRole::Observer), policy());
        assert!(matches!(
            manager.found(Instant::now()),
            Err(MembershipError::NoEligibleCoordinator)
        ));
    }

    #[test]
    fn test_all_reachable_waits_for_everyone() {
        let mut sim = Sim::cluster(&[1, 2, 3]);
        let (a, c, d) = (member(1), member(3), member(4));
        sim.nodes.get_mut(&a).unwrap().policy.ack_policy = AckPolicy::AllReachable;
        sim.isolated.insert(c.clone());
        sim.add(&d);

        sim.send(&d, Message::join_request(Recipients::Single(a.clone()), d.clone(), None));
        sim.run();
        // Majority (A, B, D) is there but C has not answered
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorInstalling);

        for _ in 0..3 {
            sim.advance(Duration::from_millis(500));
        }
        assert_eq!(sim.nodes[&a].state(), ManagerState::CoordinatorStable);
        assert_eq!(sim.view(&a).view_number(), 4);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(400));

        let jittered = InstallationPolicy {
            jitter: Duration::from_millis(50),
            ..policy
        };
        let delay = jittered.backoff(0);
        assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
    }
}
