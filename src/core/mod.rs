pub mod error;
pub mod state;

pub use error::{Result, SessionError};
pub use state::{DATETIME_FORMAT, SessionState, merge_states, parse_datetime};
