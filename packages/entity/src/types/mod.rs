mod edu;
mod event;
mod state;
mod transaction;

pub use edu::{Edu, TypingContent};
pub use event::{Event, HeaderedEvent};
pub use state::{RemoteStateIds, StateSnapshot, StateTuple};
pub use transaction::{
    MissingEventsRequest, MissingEventsResponse, PduResult, Transaction, TransactionResponse,
};
