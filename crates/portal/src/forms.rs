//! Consent form upload.
//!
//! Every `ConsentForm` node not yet marked `uploaded` is posted to the
//! portal. The portal answers with the form's remote id, which is recorded
//! on the node; a form with a `document_path` then has the document bytes
//! PUT under that id. `uploaded` is set only after the whole chain succeeded.
//! A form that already carries a remote id skips the POST.

use serde_json::{Map, Value};
use tracing::debug;

use portalsync_graph::NodeId;
use portalsync_net::{Finished, Session, Workload, encode_segment};
use portalsync_protocol::{Classify, ErrorCode, NetError, Request};

use crate::payload::{CONSENT_FORM, identifier};

pub const UPLOADED: &str = "uploaded";
pub const REMOTE_ID: &str = "remote_id";
pub const DOCUMENT_PATH: &str = "document_path";

/// Attributes that never leave the device.
const LOCAL_ONLY: [&str; 3] = [UPLOADED, REMOTE_ID, DOCUMENT_PATH];

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsentForms;

impl Workload for ConsentForms {
    fn upload(&mut self, session: &mut Session) -> Result<(), NetError> {
        let pending: Vec<(NodeId, Map<String, Value>)> = session
            .graph()
            .nodes_of(CONSENT_FORM)
            .filter(|n| n.attr(UPLOADED) != Some(&Value::Bool(true)))
            .map(|n| (n.id(), n.attrs().clone()))
            .collect();
        session.description(&format!("Uploading {} consent forms", pending.len()));

        for (node, attrs) in pending {
            match attrs.get(REMOTE_ID).and_then(Value::as_str) {
                Some(remote) => {
                    let remote = remote.to_string();
                    upload_document(session, node, &remote, &attrs)?;
                }
                None => post_form(session, node, attrs),
            }
        }
        Ok(())
    }
}

fn post_form(session: &mut Session, node: NodeId, attrs: Map<String, Value>) {
    let body: Map<String, Value> = attrs
        .iter()
        .filter(|(key, _)| !LOCAL_ONLY.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let url = session.url("consent_forms");
    session.add_data(Request::post(url).json(Value::Object(body)), move |s, finished| {
        form_created(s, node, &attrs, &finished).into()
    });
}

fn form_created(
    session: &mut Session,
    node: NodeId,
    attrs: &Map<String, Value>,
    finished: &Finished,
) -> Result<(), NetError> {
    let receipt = finished.json_object()?;
    let remote = identifier(&receipt, "id")?;
    debug!(node = %node, remote = %remote, "consent form created");

    session
        .graph_mut()?
        .set_attr(node, REMOTE_ID, Value::String(remote.clone()))
        .map_err(Classify::classify)?;
    upload_document(session, node, &remote, attrs)
}

fn upload_document(
    session: &mut Session,
    node: NodeId,
    remote: &str,
    attrs: &Map<String, Value>,
) -> Result<(), NetError> {
    let Some(path) = attrs.get(DOCUMENT_PATH).and_then(Value::as_str) else {
        return mark_uploaded(session, node);
    };
    let data = std::fs::read(path).map_err(|e| {
        NetError::with_source(ErrorCode::File, format!("cannot read {path}: {e}"), e)
    })?;
    let url = session.url(&format!("consent_forms/{}/document", encode_segment(remote)));
    session.add_upload(Request::put(url), data, move |s, _| {
        mark_uploaded(s, node).into()
    });
    Ok(())
}

fn mark_uploaded(session: &mut Session, node: NodeId) -> Result<(), NetError> {
    session
        .graph_mut()?
        .set_attr(node, UPLOADED, Value::Bool(true))
        .map_err(Classify::classify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BASE, run_upload};
    use portalsync_graph::ObjectGraph;
    use portalsync_net::testing::{Reply, ScriptedTransport};
    use portalsync_protocol::{Method, RequestBody};
    use serde_json::json;
    use std::sync::Arc;

    fn form(graph: &mut ObjectGraph, fields: Value) -> NodeId {
        graph.insert(CONSENT_FORM, fields.as_object().unwrap().clone())
    }

    #[tokio::test]
    async fn posts_pending_forms_then_their_documents() {
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("f1.pdf");
        std::fs::write(&document, b"%PDF-1.4 signed").unwrap();

        let mut graph = ObjectGraph::in_memory();
        let f1 = form(
            &mut graph,
            json!({"title": "Surgery", "uploaded": false, "document_path": document.to_str()}),
        );
        let f2 = form(&mut graph, json!({"title": "Old", "uploaded": true}));
        let f3 = form(&mut graph, json!({"title": "Imaging", "uploaded": false}));
        graph.save().unwrap();

        let transport = Arc::new(
            ScriptedTransport::new()
                .route(format!("{BASE}/consent_forms"), Reply::json(json!({"id": "r1"})))
                .route(format!("{BASE}/consent_forms"), Reply::json(json!({"id": "r3"})))
                .route(format!("{BASE}/consent_forms/r1/document"), Reply::ok("")),
        );

        let (err, graph) = run_upload(ConsentForms, transport.clone(), graph).await;
        assert!(err.is_none(), "{err:?}");

        for (node, remote) in [(f1, "r1"), (f3, "r3")] {
            let n = graph.get(node).unwrap();
            assert_eq!(n.attr(UPLOADED), Some(&json!(true)));
            assert_eq!(n.str_attr(REMOTE_ID), Some(remote));
        }
        assert_eq!(graph.get(f2).unwrap().str_attr(REMOTE_ID), None);

        let requests = transport.requests();
        let posts: Vec<_> = requests.iter().filter(|r| r.method == Method::Post).collect();
        assert_eq!(posts.len(), 2);
        match &posts[0].body {
            RequestBody::Json(body) => {
                assert_eq!(body, &json!({"title": "Surgery"}));
            }
            other => panic!("unexpected body {other:?}"),
        }

        let put = requests.iter().find(|r| r.method == Method::Put).unwrap();
        assert_eq!(put.url, format!("{BASE}/consent_forms/r1/document"));
        assert_eq!(put.body.to_bytes(), b"%PDF-1.4 signed");
    }

    #[tokio::test]
    async fn recorded_remote_id_skips_the_post() {
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("doc.pdf");
        std::fs::write(&document, b"doc").unwrap();

        let mut graph = ObjectGraph::in_memory();
        let f = form(
            &mut graph,
            json!({"title": "T", "remote_id": "r9", "document_path": document.to_str()}),
        );
        graph.save().unwrap();

        let transport = Arc::new(
            ScriptedTransport::new().route(format!("{BASE}/consent_forms/r9/document"), Reply::ok("")),
        );
        let (err, graph) = run_upload(ConsentForms, transport.clone(), graph).await;

        assert!(err.is_none(), "{err:?}");
        assert_eq!(transport.count(&format!("{BASE}/consent_forms")), 0);
        assert_eq!(graph.get(f).unwrap().attr(UPLOADED), Some(&json!(true)));
    }

    #[tokio::test]
    async fn failed_document_upload_leaves_form_pending() {
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("f1.pdf");
        std::fs::write(&document, b"doc").unwrap();

        let mut graph = ObjectGraph::in_memory();
        let f1 = form(
            &mut graph,
            json!({"title": "Surgery", "uploaded": false, "document_path": document.to_str()}),
        );
        graph.save().unwrap();

        let transport = Arc::new(
            ScriptedTransport::new()
                .route(format!("{BASE}/consent_forms"), Reply::json(json!({"id": "r1"})))
                .route(
                    format!("{BASE}/consent_forms/r1/document"),
                    Reply::status(500, "storage offline"),
                ),
        );

        let (err, graph) = run_upload(ConsentForms, transport, graph).await;
        let err = err.unwrap();
        assert_eq!(err.code(), ErrorCode::Http);
        assert!(err.description().contains("storage offline"));

        let n = graph.get(f1).unwrap();
        assert_eq!(n.attr(UPLOADED), Some(&json!(false)));
        assert_eq!(n.str_attr(REMOTE_ID), None);
        assert_eq!(graph.rollback_count(), 1);
    }

    #[tokio::test]
    async fn unreadable_document_is_a_file_error() {
        let mut graph = ObjectGraph::in_memory();
        form(
            &mut graph,
            json!({"title": "T", "remote_id": "r1", "document_path": "/nonexistent/portalsync/doc.pdf"}),
        );
        graph.save().unwrap();

        let (err, _) = run_upload(
            ConsentForms,
            Arc::new(ScriptedTransport::new()),
            graph,
        )
        .await;
        assert_eq!(err.unwrap().code(), ErrorCode::File);
    }
}
