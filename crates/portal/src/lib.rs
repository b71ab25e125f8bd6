//! PortalSync workloads.
//!
//! Each workload enumerates its exchanges onto a [`portalsync_net::Session`]
//! and maps the portal's payloads into graph nodes through the entity
//! [`schema`].
//!
//! # Jobs
//!
//! - **Consent videos**: delta the video listing, stream new videos to disk
//!   and acknowledge each verified file
//! - **Patient sketches**: paged sketch listing per patient
//! - **Consent forms**: upload locally created forms and their documents

pub mod account;
pub mod forms;
pub mod job;
pub mod payload;
pub mod sketches;
pub mod videos;

// Re-export primary types for convenience.
pub use account::Account;
pub use forms::ConsentForms;
pub use job::{PortalJob, start};
pub use payload::schema;
pub use sketches::PatientSketches;
pub use videos::ConsentVideos;

#[cfg(test)]
mod test_support {
    use std::sync::Arc;

    use portalsync_graph::ObjectGraph;
    use portalsync_net::testing::ScriptedTransport;
    use portalsync_net::{Net, NetConfig, RetryPolicy, Workload};
    use portalsync_protocol::NetError;
    use tokio::sync::oneshot;

    use crate::payload::schema;

    pub const BASE: &str = "http://portal";

    /// One connection so scripted replies are consumed in enumeration order.
    pub fn config() -> NetConfig {
        NetConfig {
            max_connections: 1,
            retry: RetryPolicy::immediate(2),
            ..NetConfig::new(BASE)
        }
    }

    async fn run(
        workload: impl Workload,
        transport: Arc<ScriptedTransport>,
        graph: ObjectGraph,
        upload: bool,
    ) -> (Option<NetError>, ObjectGraph) {
        let (tx, rx) = oneshot::channel();
        let net = Net::new(config(), transport, graph, workload, move |err| {
            let _ = tx.send(err);
        })
        .with_hook(schema());
        let started = if upload { net.upload() } else { net.download() };
        assert!(started);
        let err = rx.await.unwrap();
        let graph = net.wait().await.unwrap();
        (err, graph)
    }

    pub async fn run_download(
        workload: impl Workload,
        transport: Arc<ScriptedTransport>,
        graph: ObjectGraph,
    ) -> (Option<NetError>, ObjectGraph) {
        run(workload, transport, graph, false).await
    }

    pub async fn run_upload(
        workload: impl Workload,
        transport: Arc<ScriptedTransport>,
        graph: ObjectGraph,
    ) -> (Option<NetError>, ObjectGraph) {
        run(workload, transport, graph, true).await
    }
}
