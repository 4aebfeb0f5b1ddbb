pub mod machine;
pub mod states;

pub use machine::{TurnMachine, TurnTransitionError};
pub use states::{TurnSignal, TurnState, TurnTransition};
