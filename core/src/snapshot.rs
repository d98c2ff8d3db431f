//! Workforce snapshot — the per-year aggregate view of accumulated state.
//!
//! One snapshot is taken for every completed year. It is what checkpoints
//! carry as summary metrics and what reports print. It is a summary only:
//! resuming always reads the full accumulated state from the store.

use crate::{
    event::{Event, EventType},
    money::{BasisPoints, Cents},
    state::AccumulatedState,
    types::SimulationYear,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub hires:            i64,
    pub terminations:     i64,
    pub promotions:       i64,
    pub raises:           i64,
    pub enrollments:      i64,
    pub deferral_changes: i64,
    pub contributions:    i64,
}

impl EventCounts {
    pub fn from_events(events: &[Event]) -> Self {
        let mut c = Self::default();
        for e in events {
            let slot = match e.event_type {
                EventType::Hire           => &mut c.hires,
                EventType::Termination    => &mut c.terminations,
                EventType::Promotion      => &mut c.promotions,
                EventType::Raise          => &mut c.raises,
                EventType::Enrollment     => &mut c.enrollments,
                EventType::DeferralChange => &mut c.deferral_changes,
                EventType::Contribution   => &mut c.contributions,
            };
            *slot += 1;
        }
        c
    }

    pub fn total(&self) -> i64 {
        self.hires
            + self.terminations
            + self.promotions
            + self.raises
            + self.enrollments
            + self.deferral_changes
            + self.contributions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkforceSnapshot {
    pub simulation_year:      SimulationYear,
    pub active_headcount:     i64,
    pub terminated_headcount: i64,
    pub enrolled_headcount:   i64,
    /// Enrolled share of active employees.
    pub participation_rate:   BasisPoints,
    pub active_compensation:  Cents,
    pub ytd_deferrals:        Cents,
    pub ytd_match:            Cents,
    pub total_balance:        Cents,
    pub events:               EventCounts,
}

impl WorkforceSnapshot {
    pub fn take(state: &AccumulatedState, events: &[Event]) -> Self {
        let t = state.totals();
        let participation_rate = if t.active_headcount > 0 {
            BasisPoints((t.enrolled_headcount * 10_000 / t.active_headcount) as u32)
        } else {
            BasisPoints::ZERO
        };
        Self {
            simulation_year:      state.simulation_year,
            active_headcount:     t.active_headcount,
            terminated_headcount: t.terminated_headcount,
            enrolled_headcount:   t.enrolled_headcount,
            participation_rate,
            active_compensation:  t.active_compensation,
            ytd_deferrals:        t.ytd_deferrals,
            ytd_match:            t.ytd_match,
            total_balance:        t.total_balance,
            events:               EventCounts::from_events(events),
        }
    }
}
