//! Membership views
//!
//! A [`View`] is an immutable snapshot of the member set. Every change
//! produces a new view through [`View::next_view`]; installed views are
//! shared as `Arc<View>` and never edited in place.

use crate::error::{MembershipError, Result};
use crate::member::MemberIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Numbered snapshot of the cluster membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawView")]
pub struct View {
    view_number: u64,
    coordinator: Option<MemberIdentifier>,
    members: Vec<MemberIdentifier>,
    shunned: BTreeSet<MemberIdentifier>,
}

/// Unchecked wire form of a [`View`]
#[derive(Deserialize)]
struct RawView {
    view_number: u64,
    coordinator: Option<MemberIdentifier>,
    members: Vec<MemberIdentifier>,
    shunned: BTreeSet<MemberIdentifier>,
}

impl TryFrom<RawView> for View {
    type Error = MembershipError;

    fn try_from(raw: RawView) -> Result<Self> {
        View::from_parts(raw.view_number, raw.coordinator, raw.members, raw.shunned)
    }
}

/// Membership difference between two consecutive views
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDiff {
    pub joined: Vec<MemberIdentifier>,
    pub departed: Vec<MemberIdentifier>,
    /// Departed members that were shunned by this view
    pub removed: Vec<MemberIdentifier>,
}

impl ViewDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

impl View {
    /// First view of a new cluster, containing only its founder
    pub fn initial(founder: MemberIdentifier) -> Result<Self> {
        if !founder.can_coordinate() {
            return Err(MembershipError::NoEligibleCoordinator);
        }

        Ok(Self {
            view_number: 1,
            coordinator: Some(founder.clone()),
            members: vec![founder],
            shunned: BTreeSet::new(),
        })
    }

    /// Rebuild a view received from a peer, checking its invariants
    pub fn from_parts(
        view_number: u64,
        coordinator: Option<MemberIdentifier>,
        members: Vec<MemberIdentifier>,
        shunned: BTreeSet<MemberIdentifier>,
    ) -> Result<Self> {
        let mut seen = HashSet::with_capacity(members.len());
        for member in &members {
            if !seen.insert(member) {
                return Err(MembershipError::malformed(format!(
                    "view {} lists member {} twice",
                    view_number, member
                )));
            }
            if shunned.contains(member) {
                return Err(MembershipError::malformed(format!(
                    "view {} lists shunned member {}",
                    view_number, member
                )));
            }
        }

        match &coordinator {
            Some(coordinator) if !seen.contains(coordinator) => {
                return Err(MembershipError::malformed(format!(
                    "view {} coordinator {} is not a member",
                    view_number, coordinator
                )));
            }
            None if !members.is_empty() => {
                return Err(MembershipError::malformed(format!(
                    "view {} has members but no coordinator",
                    view_number
                )));
            }
            _ => {}
        }

        Ok(Self {
            view_number,
            coordinator,
            members,
            shunned,
        })
    }

    /// Compute the successor of this view.
    ///
    /// Joins are deduplicated and appended in identifier order; members
    /// already present, shunned or departing in the same batch are skipped.
    /// Removed members are shunned. The coordinator survives if it is still
    /// a member, otherwise the first eligible member takes over. The result
    /// depends only on the arguments.
    pub fn next_view(
        &self,
        joins: &[MemberIdentifier],
        leaves: &[MemberIdentifier],
        removals: &[MemberIdentifier],
    ) -> Result<View> {
        let departing: HashSet<&MemberIdentifier> = leaves.iter().chain(removals.iter()).collect();

        let mut shunned = self.shunned.clone();
        for removed in removals {
            if self.contains(removed) || joins.contains(removed) {
                shunned.insert(removed.clone());
            }
        }

        let mut members: Vec<MemberIdentifier> = self
            .members
            .iter()
            .filter(|member| !departing.contains(member))
            .cloned()
            .collect();

        let mut candidates: Vec<&MemberIdentifier> = joins
            .iter()
            .filter(|candidate| {
                !self.contains(candidate) && !shunned.contains(*candidate) && !departing.contains(*candidate)
            })
            .collect();
        candidates.sort();
        candidates.dedup();
        members.extend(candidates.into_iter().cloned());

        if members.is_empty() {
            return Err(MembershipError::EmptyView);
        }

        let coordinator = match &self.coordinator {
            Some(current) if members.contains(current) => current.clone(),
            _ => select_coordinator(&members).ok_or(MembershipError::NoEligibleCoordinator)?,
        };

        Ok(View {
            view_number: self.view_number + 1,
            coordinator: Some(coordinator),
            members,
            shunned,
        })
    }

    pub fn view_number(&self) -> u64 {
        self.view_number
    }

    pub fn coordinator(&self) -> Option<&MemberIdentifier> {
        self.coordinator.as_ref()
    }

    pub fn members(&self) -> &[MemberIdentifier] {
        &self.members
    }

    pub fn shunned(&self) -> &BTreeSet<MemberIdentifier> {
        &self.shunned
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &MemberIdentifier) -> bool {
        self.members.contains(member)
    }

    pub fn is_shunned(&self, member: &MemberIdentifier) -> bool {
        self.shunned.contains(member)
    }

    pub fn is_coordinator(&self, member: &MemberIdentifier) -> bool {
        self.coordinator.as_ref() == Some(member)
    }

    /// Member as recorded in this view (with its name and role)
    pub fn member(&self, member: &MemberIdentifier) -> Option<&MemberIdentifier> {
        self.members.iter().find(|m| *m == member)
    }

    /// Number of acknowledgments forming a majority of this view
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Members other than `local`
    pub fn peers<'a>(&'a self, local: &'a MemberIdentifier) -> impl Iterator<Item = &'a MemberIdentifier> + 'a {
        self.members.iter().filter(move |member| *member != local)
    }

    /// Who would coordinate if `excluded` were gone from this view
    pub fn coordinator_excluding(&self, excluded: &HashSet<MemberIdentifier>) -> Option<MemberIdentifier> {
        match &self.coordinator {
            Some(current) if !excluded.contains(current) => Some(current.clone()),
            _ => {
                let remaining: Vec<MemberIdentifier> = self
                    .members
                    .iter()
                    .filter(|member| !excluded.contains(member))
                    .cloned()
                    .collect();
                select_coordinator(&remaining)
            }
        }
    }

    /// Changes from `previous` to this view
    pub fn diff(&self, previous: &View) -> ViewDiff {
        let joined = self
            .members
            .iter()
            .filter(|member| !previous.contains(member))
            .cloned()
            .collect();

        let departed: Vec<MemberIdentifier> = previous
            .members
            .iter()
            .filter(|member| !self.contains(member))
            .cloned()
            .collect();

        let removed = departed
            .iter()
            .filter(|member| self.is_shunned(member))
            .cloned()
            .collect();

        ViewDiff {
            joined,
            departed,
            removed,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View[{}]{{", self.view_number)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
            if self.is_coordinator(member) {
                write!(f, "(coord)")?;
            }
        }
        write!(f, "}}")?;
        if !self.shunned.is_empty() {
            write!(f, " shunned={}", self.shunned.len())?;
        }
        Ok(())
    }
}

/// First member by role preference, ties broken by view (join) order
fn select_coordinator(members: &[MemberIdentifier]) -> Option<MemberIdentifier> {
    members
        .iter()
        .enumerate()
        .filter_map(|(index, member)| member.role().coordinator_rank().map(|rank| (rank, index, member)))
        .min_by_key(|(rank, index, _)| (*rank, *index))
        .map(|(_, _, member)| member.clone())
}
