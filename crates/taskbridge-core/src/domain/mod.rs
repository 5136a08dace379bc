pub mod constants;
pub mod dates;
pub mod duplicates;
pub mod hungarian;
pub mod identity;
pub mod matching;
pub mod reconcile;
pub mod taskline;
