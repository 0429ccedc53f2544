//! Risk classification of schema changes

pub mod assessor;
pub mod compat;

pub use assessor::{AdvancedRiskAssessor, AssessedChange, FnRiskRule, RiskRule, RiskSummary};
pub use compat::{TypeCompatibility, TypeCompatibilityChecker};
pub use crate::types::RiskLevel;
