//! The set of jobs a portal session can run.

use std::sync::Arc;

use portalsync_graph::ObjectGraph;
use portalsync_net::{Direction, Net, NetConfig, Session, Transport, Workload};
use portalsync_protocol::NetError;

use crate::account::Account;
use crate::forms::ConsentForms;
use crate::payload::schema;
use crate::sketches::PatientSketches;
use crate::videos::ConsentVideos;

#[derive(Debug, Clone)]
pub enum PortalJob {
    ConsentVideos(ConsentVideos),
    PatientSketches(PatientSketches),
    ConsentForms(ConsentForms),
}

impl PortalJob {
    pub fn direction(&self) -> Direction {
        match self {
            PortalJob::ConsentVideos(_) | PortalJob::PatientSketches(_) => Direction::Download,
            PortalJob::ConsentForms(_) => Direction::Upload,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PortalJob::ConsentVideos(_) => "consent-videos",
            PortalJob::PatientSketches(_) => "patient-sketches",
            PortalJob::ConsentForms(_) => "consent-forms",
        }
    }

    /// Binds this job to a session authenticated as `account`, with the
    /// portal entity schema as its node hook. The session is not started.
    pub fn session(
        self,
        config: NetConfig,
        transport: Arc<dyn Transport>,
        graph: ObjectGraph,
        account: &Account,
        completion: impl FnOnce(Option<NetError>) + Send + 'static,
    ) -> Net {
        let (name, value) = account.authorization();
        Net::new(config, transport, graph, self, completion)
            .with_hook(schema())
            .with_header(name, value)
    }
}

/// Starts `net` in `direction`.
pub fn start(net: &Net, direction: Direction) -> bool {
    match direction {
        Direction::Download => net.download(),
        Direction::Upload => net.upload(),
    }
}

impl Workload for PortalJob {
    fn download(&mut self, session: &mut Session) -> Result<(), NetError> {
        match self {
            PortalJob::ConsentVideos(job) => job.download(session),
            PortalJob::PatientSketches(job) => job.download(session),
            PortalJob::ConsentForms(job) => job.download(session),
        }
    }

    fn upload(&mut self, session: &mut Session) -> Result<(), NetError> {
        match self {
            PortalJob::ConsentVideos(job) => job.upload(session),
            PortalJob::PatientSketches(job) => job.upload(session),
            PortalJob::ConsentForms(job) => job.upload(session),
        }
    }
}
