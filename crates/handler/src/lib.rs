//! psych-handler: core runtime for the psych market-sentiment feed handler.
//!
//! On an aligned wall-clock cadence the scheduler drives one cycle: fetch
//! every configured resource over HTTP, parse the bulletins, map rows onto
//! item streams and publish unsolicited refreshes through the downstream
//! provider sessions.

pub mod bulletin;
pub mod error;
pub mod fetch;
pub mod mapper;
pub mod metrics;
pub mod provider;
pub mod pump;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod wire;

pub use bulletin::Bulletin;
pub use error::{FetchError, ParseError, WireError};
pub use fetch::{Connection, Fetcher, FetchFlags};
pub use mapper::QueryVector;
pub use provider::{ItemStream, Provider};
pub use pump::EventPump;
pub use runner::Runner;
pub use scheduler::Scheduler;
pub use server::{create_router, run_server, ServerState};
pub use session::{LoginState, Session};
