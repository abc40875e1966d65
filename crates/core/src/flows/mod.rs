pub mod engine;
pub mod states;

pub use engine::{
    applied_transition_event, rejected_transition_event, transition, ExpenseTransitionError,
};
pub use states::{ExpenseAction, ExpenseEvent, TransitionOutcome};
