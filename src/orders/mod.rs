pub mod schema;
pub mod store;

pub use schema::{OrderState, OrderTicket, OrderType, Side, TransitionError};
pub use store::{OrderError, OrderStore};
