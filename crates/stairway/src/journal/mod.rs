//! Durable journal: the flight/log store behind every engine instance.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJournal;
pub use postgres::PostgresJournal;
pub use store::{
    FlightPage, FlightRow, FlightState, FlightSummary, Journal, JournalError, LogEntry,
};
