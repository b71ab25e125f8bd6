//! Patient sketch download.
//!
//! Sketches are listed per patient, one page per request. Each page upserts
//! the `Patient` node, replaces same-id members of `Patient.sketches`, and
//! enqueues the next page from its own callback.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use portalsync_graph::NodeId;
use portalsync_net::{Finished, Session, Workload, encode_segment};
use portalsync_protocol::{Classify, ErrorCode, NetError, Request};

use crate::payload::{PATIENT, SKETCH, identifier};

/// Relation of a `Patient` node holding its sketches.
pub const SKETCHES: &str = "sketches";

#[derive(Debug, Clone, Default)]
pub struct PatientSketches {
    patients: Vec<String>,
}

impl PatientSketches {
    pub fn new<I, S>(patients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patients: patients.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patients(&self) -> &[String] {
        &self.patients
    }
}

impl Workload for PatientSketches {
    fn download(&mut self, session: &mut Session) -> Result<(), NetError> {
        session.description(&format!("Fetching sketches for {} patients", self.patients.len()));
        for patient in &self.patients {
            fetch_page(session, patient.clone(), 1);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SketchPage {
    sketches: Vec<Map<String, Value>>,
    #[serde(default)]
    next_page: Option<u32>,
}

fn fetch_page(session: &mut Session, patient: String, page: u32) -> bool {
    let url = session.url(&format!(
        "patients/{}/sketches?page={page}",
        encode_segment(&patient)
    ));
    session.add_data(Request::get(url), move |s, finished| {
        page_received(s, &patient, page, &finished).into()
    })
}

fn page_received(
    session: &mut Session,
    patient: &str,
    page: u32,
    finished: &Finished,
) -> Result<(), NetError> {
    let body: SketchPage = serde_json::from_value(finished.json()?).map_err(Classify::classify)?;
    let owner = upsert_patient(session, patient)?;

    for sketch in &body.sketches {
        identifier(sketch, "id")?;
        let node = session.new_node(SKETCH, sketch)?;
        session.update_set(owner, SKETCHES, "id", node)?;
    }
    debug!(patient, page, sketches = body.sketches.len(), next = ?body.next_page, "sketch page stored");

    match body.next_page {
        Some(next) if next > page => {
            fetch_page(session, patient.to_string(), next);
            Ok(())
        }
        Some(next) => Err(NetError::new(
            ErrorCode::Json,
            format!("patient {patient}: page {next} does not follow page {page}"),
        )),
        None => Ok(()),
    }
}

fn upsert_patient(session: &mut Session, patient: &str) -> Result<NodeId, NetError> {
    let id = Value::String(patient.to_string());
    if let Some(node) = session.graph().find(PATIENT, "id", &id) {
        return Ok(node);
    }
    let mut fields = Map::new();
    fields.insert("id".into(), id);
    session.new_node(PATIENT, &fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BASE, run_download};
    use portalsync_graph::ObjectGraph;
    use portalsync_net::testing::{Reply, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn page_url(patient: &str, page: u32) -> String {
        format!("{BASE}/patients/{patient}/sketches?page={page}")
    }

    fn sketch_versions(graph: &ObjectGraph, patient: &str) -> Vec<(String, i64)> {
        let owner = graph.find(PATIENT, "id", &json!(patient)).unwrap();
        let mut out: Vec<(String, i64)> = graph
            .related(owner, SKETCHES)
            .into_iter()
            .filter_map(|id| graph.get(id))
            .map(|n| {
                (
                    n.str_attr("id").unwrap_or_default().to_string(),
                    n.attr("version").and_then(Value::as_i64).unwrap_or_default(),
                )
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn follows_pages_and_replaces_existing_sketches() {
        let mut graph = ObjectGraph::in_memory();
        let p1 = graph.insert(PATIENT, json!({"id": "p1"}).as_object().unwrap().clone());
        let old = graph.insert(
            SKETCH,
            json!({"id": "s1", "version": 1}).as_object().unwrap().clone(),
        );
        graph.link(p1, SKETCHES, old).unwrap();
        graph.save().unwrap();

        let transport = Arc::new(
            ScriptedTransport::new()
                .route(
                    page_url("p1", 1),
                    Reply::json(json!({
                        "sketches": [{"id": "s1", "version": 2}, {"id": "s2", "version": 1}],
                        "next_page": 2
                    })),
                )
                .route(
                    page_url("p1", 2),
                    Reply::json(json!({"sketches": [{"id": "s3", "version": 1}], "next_page": null})),
                )
                .route(
                    page_url("p2", 1),
                    Reply::json(json!({"sketches": [{"id": "t1", "version": 4}]})),
                ),
        );

        let (err, graph) = run_download(
            PatientSketches::new(["p1", "p2"]),
            transport.clone(),
            graph,
        )
        .await;

        assert!(err.is_none(), "{err:?}");
        assert_eq!(
            sketch_versions(&graph, "p1"),
            vec![("s1".into(), 2), ("s2".into(), 1), ("s3".into(), 1)]
        );
        assert_eq!(sketch_versions(&graph, "p2"), vec![("t1".into(), 4)]);
        assert_eq!(graph.nodes_of(PATIENT).count(), 2);
        assert_eq!(graph.nodes_of(SKETCH).count(), 4);
        assert_eq!(transport.count(&page_url("p1", 2)), 1);
    }

    #[tokio::test]
    async fn non_advancing_page_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new().route(
            page_url("p1", 1),
            Reply::json(json!({"sketches": [], "next_page": 1})),
        ));

        let (err, graph) = run_download(
            PatientSketches::new(["p1"]),
            transport.clone(),
            ObjectGraph::in_memory(),
        )
        .await;

        assert_eq!(err.unwrap().code(), ErrorCode::Json);
        assert_eq!(transport.count(&page_url("p1", 1)), 1);
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn patient_ids_are_encoded_in_the_path() {
        let transport = Arc::new(ScriptedTransport::new().route(
            format!("{BASE}/patients/a%2Fb/sketches?page=1"),
            Reply::json(json!({"sketches": []})),
        ));

        let (err, graph) = run_download(
            PatientSketches::new(["a/b"]),
            transport,
            ObjectGraph::in_memory(),
        )
        .await;

        assert!(err.is_none(), "{err:?}");
        assert!(graph.find(PATIENT, "id", &json!("a/b")).is_some());
    }

    #[tokio::test]
    async fn missing_sketch_list_is_a_json_error() {
        let transport = Arc::new(
            ScriptedTransport::new().route(page_url("p1", 1), Reply::json(json!({"page": 1}))),
        );

        let (err, _) = run_download(
            PatientSketches::new(["p1"]),
            transport,
            ObjectGraph::in_memory(),
        )
        .await;
        assert_eq!(err.unwrap().code(), ErrorCode::Json);
    }
}
