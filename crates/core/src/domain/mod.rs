pub mod expense;
pub mod rule;
