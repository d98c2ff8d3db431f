//! Event generation — the collaborator that decides what happens in a year.
//!
//! The orchestrator treats a generator as a pure function of
//! (year, prior state, config, seed): invoked once per year, it returns
//! that year's events. The rule-based default below runs its stages in a
//! fixed order, each on its own (stage, year) random stream:
//!
//!   1. Termination     4. Raise            7. Contribution
//!   2. Hiring          5. Enrollment
//!   3. Promotion       6. Deferral change
//!
//! RULE: A generator reads only the prior state it is given. It never
//! touches the store, the cache or the wall clock.
//! RULE: Employees are visited in employee_id order within every stage.

use crate::{
    calendar::{self, date_in_year, months_until, year_end, year_start},
    config::{RaiseStrategy, SimConfig},
    error::SimResult,
    event::{sort_events, Event, EventPayload},
    money::{BasisPoints, Cents},
    rng::{RngBank, StageRng, StageSlot},
    state::{AccumulatedState, Census, CensusRecord},
    types::{EmployeeId, SimulationYear},
};
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::BTreeMap;

/// The contract every event generator must fulfil.
pub trait EventGenerator: Send + Sync {
    /// Unique stable name for this generator.
    fn name(&self) -> &'static str;

    /// Produce the events of `year`, given the accumulated state at the
    /// end of the previous year. Output is in replay order.
    fn generate(
        &self,
        year: SimulationYear,
        prior: &AccumulatedState,
        config: &SimConfig,
        rng: &RngBank,
    ) -> SimResult<Vec<Event>>;
}

/// Annual salary for a level: base × multiplier^(level - 1).
pub fn band_compensation(config: &SimConfig, level: u8) -> Cents {
    let w = &config.workforce;
    let steps = level.saturating_sub(1) as i32;
    Cents::from_dollars(w.base_compensation * w.level_multiplier.powi(steps))
}

// ── Census ───────────────────────────────────────────────────────────────

/// Synthetic baseline population: `baseline_headcount` employees hired
/// before the first simulated year.
pub fn generate_census(config: &SimConfig, rng: &RngBank) -> Census {
    let start = config.horizon.start_year;
    let mut r = rng.for_stage(StageSlot::Census, start);
    let w = &config.workforce;
    let p = &config.plan;
    let max_level = w.max_level.max(1) as u64;

    let records = (1..=w.baseline_headcount)
        .map(|n| {
            let tenure = 1 + r.next_u64_below(20) as i32;
            let hire_year = start - tenure;
            let hire_date = date_in_year(hire_year, r.next_u64_below(365) as u32);
            // Two draws, keep the lower: junior levels dominate.
            let level = 1 + r.next_u64_below(max_level).min(r.next_u64_below(max_level)) as u8;
            let compensation = band_compensation(config, level).scale(r.around(1.0, 0.10));
            let enrolled = r.chance(p.baseline_participation_rate);
            let deferral_rate = if enrolled {
                draw_deferral_rate(&mut r, config)
            } else {
                BasisPoints::ZERO
            };
            let opening_balance = compensation
                .apply_rate(deferral_rate)
                .scale(tenure as f64 * (1.0 + p.match_rate));
            CensusRecord {
                employee_id: format!("EMP_{n:06}"),
                hire_date,
                level,
                compensation,
                enrolled,
                deferral_rate,
                opening_balance,
            }
        })
        .collect();
    Census { records }
}

fn draw_deferral_rate(r: &mut StageRng, config: &SimConfig) -> BasisPoints {
    let p = &config.plan;
    let rate = r.around(p.default_deferral_rate, 0.02).clamp(0.01, p.max_deferral_rate);
    BasisPoints::from_fraction(rate)
}

// ── Rule-based generator ─────────────────────────────────────────────────

/// What the generator expects each employee to look like at year end.
/// Later stages read it so contributions match the year's final rates.
#[derive(Debug, Clone)]
struct Projection {
    level:           u8,
    compensation:    Cents,
    hire_date:       NaiveDate,
    termination:     Option<NaiveDate>,
    enrolled:        bool,
    enrollment_date: Option<NaiveDate>,
    deferral_rate:   BasisPoints,
    new_hire:        bool,
}

pub struct RuleBasedGenerator;

impl RuleBasedGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleBasedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGenerator for RuleBasedGenerator {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    fn generate(
        &self,
        year: SimulationYear,
        prior: &AccumulatedState,
        config: &SimConfig,
        rng: &RngBank,
    ) -> SimResult<Vec<Event>> {
        let mut book: BTreeMap<EmployeeId, Projection> = prior
            .employees
            .values()
            .filter(|rec| rec.is_active())
            .map(|rec| {
                (
                    rec.employee_id.clone(),
                    Projection {
                        level:           rec.workforce.level,
                        compensation:    rec.workforce.compensation,
                        hire_date:       rec.workforce.hire_date,
                        termination:     None,
                        enrolled:        rec.enrollment.enrolled,
                        enrollment_date: rec.enrollment.enrollment_date,
                        deferral_rate:   rec.enrollment.deferral_rate,
                        new_hire:        false,
                    },
                )
            })
            .collect();

        let mut events = Vec::new();
        terminations(year, config, rng, &mut book, &mut events);
        hires(year, config, rng, &mut book, &mut events);
        promotions(year, config, rng, &mut book, &mut events);
        raises(year, config, rng, &mut book, &mut events);
        enrollments(year, config, rng, &mut book, &mut events);
        deferral_changes(year, config, rng, &mut book, &mut events);
        contributions(year, config, rng, &book, &mut events);

        sort_events(&mut events);
        log::debug!("generator: year {year} produced {} events", events.len());
        Ok(events)
    }
}

fn random_date(r: &mut StageRng, year: SimulationYear) -> NaiveDate {
    date_in_year(year, r.next_u64_below(calendar::days_in_year(year) as u64) as u32)
}

fn terminations(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Termination, year);
    for (id, p) in book.iter_mut() {
        if !r.chance(config.workforce.termination_rate) {
            continue;
        }
        let date = random_date(&mut r, year);
        let voluntary = r.chance(0.7);
        p.termination = Some(date);
        events.push(Event::new(r.next_uuid(), id.clone(), year, date, EventPayload::Termination { voluntary }));
    }
}

fn hires(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Hiring, year);
    let active_start = book.len() as f64;
    let leaving = book.values().filter(|p| p.termination.is_some()).count() as f64;
    let target = (active_start * (1.0 + config.workforce.target_growth_rate)).round();
    let needed = (target - (active_start - leaving)).max(0.0) as u64;
    let entry_levels = (config.workforce.max_level as u64).min(2);

    for seq in 1..=needed {
        let id = format!("NH_{year}_{seq:06}");
        let date = random_date(&mut r, year);
        let level = 1 + r.next_u64_below(entry_levels) as u8;
        let compensation = band_compensation(config, level).scale(r.around(1.0, 0.05));
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            date,
            EventPayload::Hire { level, compensation },
        ));
        book.insert(
            id,
            Projection {
                level,
                compensation,
                hire_date: date,
                termination: None,
                enrolled: false,
                enrollment_date: None,
                deferral_rate: BasisPoints::ZERO,
                new_hire: true,
            },
        );
    }
}

/// Promotions take effect on January 1 for employees who stay all year.
fn promotions(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Promotion, year);
    let w = &config.workforce;
    for (id, p) in book.iter_mut() {
        if p.new_hire || p.termination.is_some() || p.level >= w.max_level {
            continue;
        }
        if !r.chance(w.promotion_rate) {
            continue;
        }
        let new_compensation = p
            .compensation
            .scale(1.0 + w.promotion_increase)
            .max(band_compensation(config, p.level + 1));
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            year_start(year),
            EventPayload::Promotion { from_level: p.level, to_level: p.level + 1, new_compensation },
        ));
        p.level += 1;
        p.compensation = new_compensation;
    }
}

/// Annual merit cycle, effective April 1.
fn raises(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Raise, year);
    let c = &config.compensation;
    let date = NaiveDate::from_ymd_opt(year, 4, 1).unwrap_or_else(|| year_start(year));
    for (id, p) in book.iter_mut() {
        if p.new_hire || p.termination.is_some() {
            continue;
        }
        let rate = match c.raise_strategy {
            RaiseStrategy::Legacy => c.merit_rate,
            RaiseStrategy::Realistic => {
                let seniority = 1.0 + 0.05 * (p.level.saturating_sub(1)) as f64;
                (r.around(c.merit_rate, c.merit_spread) * seniority).max(0.0) + c.cola_rate
            }
        };
        let new_compensation = p.compensation.scale(1.0 + rate);
        if new_compensation == p.compensation {
            continue;
        }
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            date,
            EventPayload::Raise { previous_compensation: p.compensation, new_compensation },
        ));
        p.compensation = new_compensation;
    }
}

fn enrollments(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Enrollment, year);
    let plan = &config.plan;
    for (id, p) in book.iter_mut() {
        if p.enrolled || p.termination.is_some() {
            continue;
        }
        let (join, rate, date) = if plan.auto_enroll && p.new_hire {
            let date = (p.hire_date + Duration::days(30)).min(year_end(year));
            let stays = !r.chance(plan.auto_enroll_opt_out_rate);
            (stays, BasisPoints::from_fraction(plan.default_deferral_rate), date)
        } else {
            let joins = r.chance(plan.voluntary_enroll_rate);
            let earliest = p.hire_date.max(year_start(year));
            let span = (year_end(year) - earliest).num_days().max(0) as u64;
            let date = earliest + Duration::days(r.next_u64_below(span + 1) as i64);
            (joins, draw_deferral_rate(&mut r, config), date)
        };
        if !join {
            continue;
        }
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            date,
            EventPayload::Enrollment { deferral_rate: rate },
        ));
        p.enrolled = true;
        p.enrollment_date = Some(date);
        p.deferral_rate = rate;
    }
}

/// Automatic escalation on January 1 for employees enrolled in a prior year.
fn deferral_changes(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &mut BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let plan = &config.plan;
    if !plan.escalation_enabled {
        return;
    }
    let mut r = rng.for_stage(StageSlot::DeferralChange, year);
    let cap = BasisPoints::from_fraction(plan.escalation_cap);
    let step = BasisPoints::from_fraction(plan.escalation_increment);
    for (id, p) in book.iter_mut() {
        let enrolled_before = p.enrolled && p.enrollment_date.map_or(true, |d| d.year() < year);
        if !enrolled_before || p.termination.is_some() || p.deferral_rate >= cap {
            continue;
        }
        let to_rate = BasisPoints((p.deferral_rate.0 + step.0).min(cap.0));
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            year_start(year),
            EventPayload::DeferralChange { from_rate: p.deferral_rate, to_rate },
        ));
        p.deferral_rate = to_rate;
    }
}

/// One contribution per enrolled employee, dated December 31, prorated by
/// the months the employee was both employed and enrolled.
fn contributions(
    year: SimulationYear,
    config: &SimConfig,
    rng: &RngBank,
    book: &BTreeMap<EmployeeId, Projection>,
    events: &mut Vec<Event>,
) {
    let mut r = rng.for_stage(StageSlot::Contribution, year);
    let plan = &config.plan;
    let match_rate = BasisPoints::from_fraction(plan.match_rate);
    let match_cap = BasisPoints::from_fraction(plan.match_cap);
    for (id, p) in book {
        if !p.enrolled {
            continue;
        }
        let mut first_month = 1;
        if p.new_hire {
            first_month = first_month.max(p.hire_date.month());
        }
        if let Some(d) = p.enrollment_date.filter(|d| d.year() == year) {
            first_month = first_month.max(d.month());
        }
        let last_month = p.termination.map_or(12, months_until);
        if last_month < first_month {
            continue;
        }
        let eligible_pay = p.compensation.prorate(last_month - first_month + 1, 12);
        let employee_amount = eligible_pay.apply_rate(p.deferral_rate);
        let employer_match = eligible_pay
            .apply_rate(p.deferral_rate.min(match_cap))
            .apply_rate(match_rate);
        if employee_amount == Cents::ZERO && employer_match == Cents::ZERO {
            continue;
        }
        events.push(Event::new(
            r.next_uuid(),
            id.clone(),
            year,
            year_end(year),
            EventPayload::Contribution { employee_amount, employer_match },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    #[test]
    fn census_is_reproducible_and_sized() {
        let config = SimConfig::default_test().with_headcount(50);
        let a = generate_census(&config, &RngBank::new(7));
        let b = generate_census(&config, &RngBank::new(7));
        assert_eq!(a, b);
        assert_eq!(a.records.len(), 50);
        assert_eq!(a.records[0].employee_id, "EMP_000001");
    }

    #[test]
    fn new_hires_are_hired_before_any_other_event() {
        let config = SimConfig::default_test().with_headcount(120);
        let bank = RngBank::new(config.random_seed);
        let census = generate_census(&config, &bank);
        let prior = AccumulatedState::from_census(&census, 2024, "s", "p");
        let events = RuleBasedGenerator::new().generate(2025, &prior, &config, &bank).unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::Hire));
        for e in events.iter().filter(|e| e.employee_id.starts_with("NH_")) {
            let hire = events
                .iter()
                .find(|h| h.employee_id == e.employee_id && h.event_type == EventType::Hire)
                .unwrap();
            assert!(hire.order_key() <= e.order_key());
        }
    }
}
