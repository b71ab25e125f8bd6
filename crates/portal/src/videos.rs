//! Consent video download.
//!
//! Fetches the portal's video listing, deltas it against the videos already
//! linked into the `Library` node, and streams every new or changed video to
//! `{media_dir}/{id}-{hash}.mp4`. A changed video lands in a new file, so the
//! committed node keeps pointing at intact media until its replacement is
//! committed. A video whose SHA-256 does not match the listing is fetched
//! again. Superseded files are removed and receipts acknowledged only after
//! the commit.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use portalsync_graph::NodeId;
use portalsync_net::{Finished, Session, Signal, Workload, encode_segment};
use portalsync_protocol::{Classify, ErrorCode, NetError, Request};
use portalsync_transfer::verify_file_checksum;

use crate::payload::{CONSENT_VIDEO, LIBRARY, identifier, objects};

/// Relation of the `Library` node holding its videos.
pub const VIDEOS: &str = "videos";

/// Table name used when acknowledging a received video.
pub const ACK_TABLE: &str = "consent_videos";

#[derive(Debug, Clone)]
pub struct ConsentVideos {
    media_dir: PathBuf,
}

impl ConsentVideos {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self {
            media_dir: media_dir.into(),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }
}

impl Workload for ConsentVideos {
    fn download(&mut self, session: &mut Session) -> Result<(), NetError> {
        std::fs::create_dir_all(&self.media_dir).map_err(Classify::classify)?;
        let library = library(session)?;

        session.description("Fetching consent video list");
        let media_dir = self.media_dir.clone();
        let url = session.url("consent_videos");
        session.add_data(Request::get(url), move |s, finished| {
            listing_received(s, library, &media_dir, &finished).into()
        });
        Ok(())
    }
}

/// The single `Library` node, created on first use.
fn library(session: &mut Session) -> Result<NodeId, NetError> {
    if let Some(node) = session.graph().nodes_of(LIBRARY).next() {
        return Ok(node.id());
    }
    session.new_node(LIBRARY, &Map::new())
}

fn listing_received(
    session: &mut Session,
    library: NodeId,
    media_dir: &Path,
    finished: &Finished,
) -> Result<(), NetError> {
    let mut videos = objects(finished.json_array()?, "consent_videos")?;
    let before = media_paths(session, library);
    let stale = session.delete_matches(library, VIDEOS, &mut videos, "id", "id", Some("hash"))?;
    info!(fetch = videos.len(), stale, "consent video listing received");

    let superseded: Vec<PathBuf> = before
        .into_iter()
        .filter(|(node, _)| !session.graph().contains(*node))
        .map(|(_, path)| path)
        .collect();
    if !superseded.is_empty() {
        session.after_commit(move |s| remove_unreferenced(s, superseded));
    }

    for video in videos {
        let id = identifier(&video, "id")?;
        let url = match video.get("url").and_then(Value::as_str) {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                url.to_string()
            }
            Some(path) => session.url(path),
            None => session.url(&format!("consent_videos/{}/file", encode_segment(&id))),
        };
        let path = media_file(media_dir, &id, video.get("hash").and_then(Value::as_str));
        debug!(id = %id, url = %url, path = %path.display(), "queueing video");

        session.add_file(Request::get(url), path.clone(), move |s, finished| {
            video_received(s, library, &id, &video, &path, finished)
        });
    }
    Ok(())
}

fn video_received(
    session: &mut Session,
    library: NodeId,
    id: &str,
    video: &Map<String, Value>,
    path: &Path,
    finished: Finished,
) -> Signal {
    if let Some(hash) = video.get("hash").and_then(Value::as_str) {
        if let Err(mismatch) = verify_file_checksum(path, hash) {
            finished.discard();
            return Signal::Retry(mismatch);
        }
    }
    store_video(session, library, id, video, path).into()
}

fn store_video(
    session: &mut Session,
    library: NodeId,
    id: &str,
    video: &Map<String, Value>,
    path: &Path,
) -> Result<(), NetError> {
    let path = path.to_str().ok_or_else(|| {
        NetError::new(
            ErrorCode::File,
            format!("media path is not UTF-8: {}", path.display()),
        )
    })?;
    let mut fields = video.clone();
    fields.insert("path".into(), Value::String(path.to_string()));

    let node = session.new_node(CONSENT_VIDEO, &fields)?;
    session.link(library, VIDEOS, node)?;

    let id = id.to_string();
    session.after_commit(move |s| {
        s.ack(ACK_TABLE, &id);
    });
    let file = PathBuf::from(path);
    session.after_rollback(move || remove_file(&file));
    Ok(())
}

/// Where a video is stored. The hash is part of the name so a new version
/// never overwrites the one the graph references.
fn media_file(media_dir: &Path, id: &str, hash: Option<&str>) -> PathBuf {
    match hash.filter(|h| !h.is_empty()) {
        Some(hash) => media_dir.join(format!(
            "{}-{}.mp4",
            encode_segment(id),
            encode_segment(hash)
        )),
        None => media_dir.join(format!("{}.mp4", encode_segment(id))),
    }
}

fn media_paths(session: &Session, library: NodeId) -> Vec<(NodeId, PathBuf)> {
    let graph = session.graph();
    graph
        .related(library, VIDEOS)
        .into_iter()
        .filter_map(|id| {
            let path = graph.get(id)?.str_attr("path")?;
            Some((id, PathBuf::from(path)))
        })
        .collect()
}

fn remove_unreferenced(session: &mut Session, paths: Vec<PathBuf>) {
    for path in paths {
        let referenced = path.to_str().is_some_and(|p| {
            session
                .graph()
                .nodes_of(CONSENT_VIDEO)
                .any(|n| n.str_attr("path") == Some(p))
        });
        if !referenced {
            remove_file(&path);
        }
    }
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "media file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove media file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::schema;
    use crate::test_support::{BASE, run_download};
    use portalsync_graph::ObjectGraph;
    use portalsync_net::testing::{Reply, ScriptedTransport};
    use portalsync_transfer::checksum_bytes;
    use serde_json::json;
    use std::sync::Arc;

    /// A committed library whose videos exist on disk under `dir`.
    fn graph_with_videos(dir: &Path, videos: &[(&str, &str)]) -> ObjectGraph {
        let mut graph = ObjectGraph::in_memory();
        let library = graph.insert(LIBRARY, Map::new());
        for (id, hash) in videos {
            let path = dir.join(format!("{id}.mp4"));
            std::fs::write(&path, format!("old cut of {id}")).unwrap();
            let fields = json!({"id": id, "title": id, "hash": hash, "path": path.to_str().unwrap()});
            let node = graph.insert(CONSENT_VIDEO, fields.as_object().unwrap().clone());
            graph.link(library, VIDEOS, node).unwrap();
        }
        graph.save().unwrap();
        graph
    }

    fn stored_path(graph: &ObjectGraph, id: &str) -> PathBuf {
        let node = graph.find(CONSENT_VIDEO, "id", &json!(id)).unwrap();
        PathBuf::from(graph.get(node).unwrap().str_attr("path").unwrap())
    }

    fn video_ids(graph: &ObjectGraph) -> Vec<String> {
        let mut ids: Vec<String> = graph
            .nodes_of(CONSENT_VIDEO)
            .filter_map(|n| n.str_attr("id").map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn downloads_only_new_and_changed_videos() {
        let dir = tempfile::tempdir().unwrap();
        let b = b"video b, second cut".to_vec();
        let d = b"video d".to_vec();

        let transport = Arc::new(
            ScriptedTransport::new()
                .route(
                    format!("{BASE}/consent_videos"),
                    Reply::json(json!([
                        {"id": "a", "title": "A", "hash": "h1", "url": "/media/a"},
                        {"id": "b", "title": "B", "hash": checksum_bytes(&b), "url": "/media/b"},
                        {"id": "d", "title": "D", "hash": checksum_bytes(&d), "url": "/media/d"},
                    ])),
                )
                .route(format!("{BASE}/media/b"), Reply::ok(b.clone()))
                .route(format!("{BASE}/media/d"), Reply::Chunks(vec![d.clone()]))
                .route(format!("{BASE}/ack/consent_videos/b"), Reply::ok(""))
                .route(format!("{BASE}/ack/consent_videos/d"), Reply::ok("")),
        );

        let graph = graph_with_videos(dir.path(), &[("a", "h1"), ("b", "h2"), ("c", "h3")]);
        let (err, graph) = run_download(
            ConsentVideos::new(dir.path()),
            transport.clone(),
            graph,
        )
        .await;

        assert!(err.is_none(), "{err:?}");
        assert_eq!(video_ids(&graph), vec!["a", "b", "d"]);
        assert_eq!(transport.count(&format!("{BASE}/media/a")), 0);
        assert_eq!(std::fs::read(stored_path(&graph, "b")).unwrap(), b);
        assert_eq!(std::fs::read(stored_path(&graph, "d")).unwrap(), d);
        assert_eq!(
            stored_path(&graph, "d"),
            dir.path().join(format!("d-{}.mp4", checksum_bytes(&d)))
        );
        assert_eq!(transport.count(&format!("{BASE}/ack/consent_videos/b")), 1);
        assert_eq!(transport.count(&format!("{BASE}/ack/consent_videos/d")), 1);

        // Unchanged media stays; replaced and dropped media is cleaned up.
        assert_eq!(stored_path(&graph, "a"), dir.path().join("a.mp4"));
        assert!(dir.path().join("a.mp4").exists());
        assert!(!dir.path().join("b.mp4").exists());
        assert!(!dir.path().join("c.mp4").exists());

        let library = graph.nodes_of(LIBRARY).next().unwrap().id();
        assert_eq!(graph.related(library, VIDEOS).len(), 3);
        let b_node = graph.find(CONSENT_VIDEO, "id", &json!("b")).unwrap();
        assert!(schema().check(CONSENT_VIDEO, graph.get(b_node).unwrap().attrs()).is_ok());
    }

    #[tokio::test]
    async fn failed_update_keeps_committed_media() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = b"video a, recut".to_vec();
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(
                    format!("{BASE}/consent_videos"),
                    Reply::json(json!([
                        {"id": "a", "title": "A", "hash": checksum_bytes(&fresh), "url": "/media/a"},
                        {"id": "b", "title": "B", "hash": "h2-new", "url": "/media/b"},
                    ])),
                )
                .route(format!("{BASE}/media/a"), Reply::ok(fresh.clone()))
                .route(format!("{BASE}/media/b"), Reply::status(404, "gone"))
                .route(format!("{BASE}/ack/consent_videos/a"), Reply::ok("")),
        );

        let graph = graph_with_videos(dir.path(), &[("a", "h1"), ("b", "h2")]);
        let (err, graph) = run_download(
            ConsentVideos::new(dir.path()),
            transport.clone(),
            graph,
        )
        .await;

        assert_eq!(err.unwrap().code(), ErrorCode::Http);
        assert_eq!(video_ids(&graph), vec!["a", "b"]);
        for id in ["a", "b"] {
            let path = stored_path(&graph, id);
            assert_eq!(path, dir.path().join(format!("{id}.mp4")));
            assert_eq!(std::fs::read_to_string(&path).unwrap(), format!("old cut of {id}"));
        }
        // Nothing from the failed run is left behind or acknowledged.
        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();
        assert_eq!(files, vec!["a.mp4", "b.mp4"]);
        assert_eq!(transport.count(&format!("{BASE}/ack/consent_videos/a")), 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_fetches_again() {
        let dir = tempfile::tempdir().unwrap();
        let good = b"the real video".to_vec();
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(
                    format!("{BASE}/consent_videos"),
                    Reply::json(json!([
                        {"id": 7, "title": "Seven", "hash": checksum_bytes(&good)},
                    ])),
                )
                .route(format!("{BASE}/consent_videos/7/file"), Reply::ok("truncated"))
                .route(format!("{BASE}/consent_videos/7/file"), Reply::ok(good.clone()))
                .route(format!("{BASE}/ack/consent_videos/7"), Reply::ok("")),
        );

        let (err, graph) = run_download(
            ConsentVideos::new(dir.path()),
            transport.clone(),
            ObjectGraph::in_memory(),
        )
        .await;

        assert!(err.is_none(), "{err:?}");
        assert_eq!(transport.count(&format!("{BASE}/consent_videos/7/file")), 2);
        let stored = dir.path().join(format!("7-{}.mp4", checksum_bytes(&good)));
        assert_eq!(std::fs::read(stored).unwrap(), good);
        assert_eq!(graph.nodes_of(CONSENT_VIDEO).count(), 1);
    }

    #[tokio::test]
    async fn persistent_mismatch_fails_and_keeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(
                    format!("{BASE}/consent_videos"),
                    Reply::json(json!([{"id": "v", "title": "V", "hash": "00ff"}])),
                )
                .route(format!("{BASE}/consent_videos/v/file"), Reply::ok("garbage")),
        );

        let (err, graph) = run_download(
            ConsentVideos::new(dir.path()),
            transport,
            ObjectGraph::in_memory(),
        )
        .await;

        let err = err.unwrap();
        assert_eq!(err.code(), ErrorCode::File);
        assert!(err.description().contains("checksum mismatch"));
        assert!(graph.is_empty());
        assert!(!dir.path().join("v-00ff.mp4").exists());
    }

    #[tokio::test]
    async fn malformed_listing_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new().route(
            format!("{BASE}/consent_videos"),
            Reply::json(json!([{"title": "no id"}])),
        ));

        let (err, _) = run_download(
            ConsentVideos::new(dir.path()),
            transport,
            ObjectGraph::in_memory(),
        )
        .await;
        assert_eq!(err.unwrap().code(), ErrorCode::Json);
    }

    #[tokio::test]
    async fn server_error_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new().route(
            format!("{BASE}/consent_videos"),
            Reply::json(json!({"error": "account suspended"})),
        ));

        let (err, _) = run_download(
            ConsentVideos::new(dir.path()),
            transport,
            ObjectGraph::in_memory(),
        )
        .await;
        let err = err.unwrap();
        assert_eq!(err.code(), ErrorCode::Server);
        assert_eq!(err.description(), "account suspended");
    }
}
