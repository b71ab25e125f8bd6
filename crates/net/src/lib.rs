//! Network operation orchestration for PortalSync.
//!
//! A [`Net`] session enumerates a [`Workload`] into [`Operation`]s, runs them
//! through an [`OperationQueue`] bounded by `max_connections`, and feeds each
//! finished exchange to its item callback on the session's actor. The first
//! fatal error is latched, the graph is rolled back, every other operation is
//! cancelled, and the completion fires once after the last one drained.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use portalsync_graph::ObjectGraph;
//! use portalsync_net::{HttpTransport, Net, NetConfig, Session, Signal, Workload};
//! use portalsync_protocol::{NetError, Request};
//!
//! struct Ping;
//!
//! impl Workload for Ping {
//!     fn download(&mut self, session: &mut Session) -> Result<(), NetError> {
//!         let url = session.url("ping");
//!         session.add_data(Request::get(url), |_, _| Signal::Done);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), NetError> {
//! let config = NetConfig::new("https://portal.example/api");
//! let transport = Arc::new(HttpTransport::new(config.timeout())?);
//! let net = Net::new(config, transport, ObjectGraph::in_memory(), Ping, |err| {
//!     println!("finished: {err:?}");
//! });
//! net.download();
//! net.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fault;
pub mod net;
pub mod operation;
pub mod progress;
pub mod queue;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{FaultConfig, FaultMode, NetConfig, RetryPolicy, encode_segment};
pub use fault::FaultInjector;
pub use net::{Completion, Direction, Net, Workload};
pub use operation::{Failed, Finished, Operation, OperationState};
pub use progress::{ChannelReporter, ProgressEvent};
pub use queue::{OperationQueue, Outcome};
pub use session::{ItemCallback, Session, Signal};
pub use transport::{
    BoxFuture, BytesBody, HttpTransport, Response, ResponseBody, Transport, classify_reqwest,
};
