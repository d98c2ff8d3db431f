//! The event log record — every workforce and plan change.
//!
//! RULE: Events are immutable once created. They are never mutated or
//! deleted; accumulated state is always derived from them.
//! RULE: Event order is (year, effective_date, type priority, event_uuid).
//! Every consumer that replays events uses `order_key`.

use crate::{
    money::{BasisPoints, Cents},
    types::{EmployeeId, SimulationYear},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kinds. Variants are only ever appended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Hire,
    Promotion,
    Raise,
    Enrollment,
    DeferralChange,
    Contribution,
    Termination,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::Hire,
        Self::Promotion,
        Self::Raise,
        Self::Enrollment,
        Self::DeferralChange,
        Self::Contribution,
        Self::Termination,
    ];

    /// Tie-break priority for events sharing an effective date (lowest first).
    /// Hires open the record, contributions land after enrollment changes,
    /// terminations close the record last.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Hire           => 0,
            Self::Promotion      => 1,
            Self::Raise          => 2,
            Self::Enrollment     => 3,
            Self::DeferralChange => 4,
            Self::Contribution   => 5,
            Self::Termination    => 6,
        }
    }

    /// Stable string name, used for the event_type column.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hire           => "hire",
            Self::Promotion      => "promotion",
            Self::Raise          => "raise",
            Self::Enrollment     => "enrollment",
            Self::DeferralChange => "deferral_change",
            Self::Contribution   => "contribution",
            Self::Termination    => "termination",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Hire {
        level:        u8,
        compensation: Cents,
    },
    Promotion {
        from_level:       u8,
        to_level:         u8,
        new_compensation: Cents,
    },
    Raise {
        previous_compensation: Cents,
        new_compensation:      Cents,
    },
    Enrollment {
        deferral_rate: BasisPoints,
    },
    DeferralChange {
        from_rate: BasisPoints,
        to_rate:   BasisPoints,
    },
    Contribution {
        employee_amount: Cents,
        employer_match:  Cents,
    },
    Termination {
        voluntary: bool,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Hire { .. }           => EventType::Hire,
            Self::Promotion { .. }      => EventType::Promotion,
            Self::Raise { .. }          => EventType::Raise,
            Self::Enrollment { .. }     => EventType::Enrollment,
            Self::DeferralChange { .. } => EventType::DeferralChange,
            Self::Contribution { .. }   => EventType::Contribution,
            Self::Termination { .. }    => EventType::Termination,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_uuid:      Uuid,
    pub employee_id:     EmployeeId,
    pub event_type:      EventType,
    pub simulation_year: SimulationYear,
    pub effective_date:  NaiveDate,
    pub payload:         EventPayload,
}

/// Sort key for replay: (year, effective date, priority, uuid).
pub type EventOrderKey = (SimulationYear, NaiveDate, u8, Uuid);

impl Event {
    pub fn new(
        event_uuid: Uuid,
        employee_id: impl Into<EmployeeId>,
        simulation_year: SimulationYear,
        effective_date: NaiveDate,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_uuid,
            employee_id: employee_id.into(),
            event_type: payload.event_type(),
            simulation_year,
            effective_date,
            payload,
        }
    }

    pub fn order_key(&self) -> EventOrderKey {
        (
            self.simulation_year,
            self.effective_date,
            self.event_type.priority(),
            self.event_uuid,
        )
    }
}

/// Put events into replay order in place.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by_key(Event::order_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(uuid: u128, day: u32, payload: EventPayload) -> Event {
        let date = NaiveDate::from_ymd_opt(2025, 3, day).unwrap();
        Event::new(Uuid::from_u128(uuid), "EMP_1", 2025, date, payload)
    }

    #[test]
    fn same_day_events_order_by_priority_then_uuid() {
        let mut events = vec![
            ev(1, 5, EventPayload::Termination { voluntary: true }),
            ev(9, 5, EventPayload::Hire { level: 1, compensation: Cents(100) }),
            ev(3, 5, EventPayload::Raise { previous_compensation: Cents(100), new_compensation: Cents(110) }),
            ev(2, 5, EventPayload::Raise { previous_compensation: Cents(100), new_compensation: Cents(120) }),
            ev(7, 1, EventPayload::Termination { voluntary: false }),
        ];
        sort_events(&mut events);
        let order: Vec<u128> = events.iter().map(|e| e.event_uuid.as_u128()).collect();
        assert_eq!(order, vec![7, 9, 2, 3, 1]);
    }

    #[test]
    fn event_type_names_round_trip() {
        for t in EventType::ALL {
            assert_eq!(EventType::from_name(t.name()), Some(t));
        }
        assert_eq!(EventType::from_name("bonus"), None);
    }
}
