//! Shared primitive types used across the entire simulation.

/// A simulation year. One year = one unit of advancement.
pub type SimulationYear = i32;

/// A stable, unique identifier for an employee.
pub type EmployeeId = String;

/// The canonical run identifier.
pub type RunId = String;

/// Hex-encoded SHA-256 over every input of a reproducible computation.
pub type Fingerprint = String;
