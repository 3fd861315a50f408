mod logic;
pub mod verification;

pub use logic::RestoreSummary;
pub use verification::{VerificationOutcome, VerificationReport};
