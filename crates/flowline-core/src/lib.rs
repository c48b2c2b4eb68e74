//! Flowline Core -- a discrete-event engine for material-flow lines.
//!
//! Active stages (sources, machines, sinks) exchange discrete items through
//! passive edges: bounded buffers and conveyor belts. Everything runs on a
//! single thread against a virtual clock.
//!
//! # Reservation protocol
//!
//! Every edge separates *reserving* from *committing*:
//!
//! ```rust,ignore
//! let get = cx.reserve_get(upstream)?;   // later: Signal::Granted(get)
//! let put = cx.reserve_put(downstream)?; // later: Signal::Granted(put)
//! let item = cx.commit_get(get)?;
//! cx.commit_put(put, item)?;
//! ```
//!
//! Grants are issued strictly in request order per edge, and a granted get
//! is bound to one specific item until it is committed or cancelled.
//!
//! # Key Types
//!
//! - [`store::ReservableStore`] -- bounded FIFO/LIFO store with
//!   reserve/commit/cancel on both sides.
//! - [`transport::Belt`] -- conveyor with two-phase transit, interruption
//!   accounting and accumulating/non-accumulating stall disciplines.
//! - [`edge::Edge`] -- closed variant over the two edge kinds.
//! - [`engine::Environment`] -- clock, edges and processes; delivers
//!   wakeups in time order.
//! - [`engine::Process`] -- the suspendable task trait stages implement.
//! - [`time::SimTime`] -- Q32.32 fixed-point virtual time.

pub mod config;
pub mod edge;
pub mod engine;
pub mod id;
pub mod reservation;
pub mod sim;
pub mod stats;
pub mod store;
pub mod time;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
