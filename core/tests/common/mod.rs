//! Shared test generators.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use workforce_core::{
    config::SimConfig,
    error::SimResult,
    event::{Event, EventPayload, EventType},
    generator::{EventGenerator, RuleBasedGenerator},
    money::Cents,
    rng::RngBank,
    state::AccumulatedState,
    types::SimulationYear,
};

/// Adds a contribution in `year` for an active employee who is not
/// enrolled and stays that way all year. Records which employee it picked.
pub struct OrphanContribution {
    inner:  RuleBasedGenerator,
    year:   SimulationYear,
    target: Arc<Mutex<Option<String>>>,
}

impl OrphanContribution {
    pub fn new(inner: RuleBasedGenerator, year: SimulationYear, target: Arc<Mutex<Option<String>>>) -> Self {
        Self { inner, year, target }
    }
}

impl EventGenerator for OrphanContribution {
    fn name(&self) -> &'static str {
        "orphan_contribution"
    }

    fn generate(
        &self,
        year: SimulationYear,
        prior: &AccumulatedState,
        config: &SimConfig,
        rng: &RngBank,
    ) -> SimResult<Vec<Event>> {
        let mut events = self.inner.generate(year, prior, config, rng)?;
        if year != self.year {
            return Ok(events);
        }
        let touched: BTreeSet<&str> = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::Enrollment | EventType::Termination))
            .map(|e| e.employee_id.as_str())
            .collect();
        let target = prior
            .employees
            .values()
            .find(|r| r.is_active() && !r.enrollment.enrolled && !touched.contains(r.employee_id.as_str()))
            .map(|r| r.employee_id.clone())
            .expect("an unenrolled employee");
        let date = chrono::NaiveDate::from_ymd_opt(year, 12, 31).unwrap();
        events.push(Event::new(
            uuid::Uuid::from_u128(0xBAD_C0DE),
            target.clone(),
            year,
            date,
            EventPayload::Contribution { employee_amount: Cents(10_000), employer_match: Cents(5_000) },
        ));
        *self.target.lock().unwrap() = Some(target);
        Ok(events)
    }
}
