//! Storage graph collaborator
//!
//! The engine never rewires volume nodes itself. When a job finishes it asks
//! the graph to either present the target in place of the source or to put
//! the original presentation back.

use crate::error::{MirrorError, MirrorResult};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Node graph operations requested at job exit
#[async_trait]
pub trait StorageGraph: Send + Sync {
    /// Atomically present `target` in place of `source`
    ///
    /// Called only once no mirror operation is in flight and no chunk is
    /// dirty, with guest writes held off.
    async fn splice(&self, source: &str, target: &str) -> MirrorResult<()>;

    /// Remove the mirror overlay and keep presenting `source`
    async fn restore(&self, source: &str) -> MirrorResult<()>;
}

/// Graph request as seen by [`RecordingGraph`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    Splice { source: String, target: String },
    Restore { source: String },
}

/// Graph that records the requests it receives
///
/// Splice failures can be injected to exercise the error path.
#[derive(Debug, Default)]
pub struct RecordingGraph {
    events: Mutex<Vec<GraphEvent>>,
    fail_splice: AtomicBool,
}

impl RecordingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following splice fail
    pub fn fail_splices(&self) {
        self.fail_splice.store(true, Ordering::SeqCst);
    }

    /// Requests received so far
    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().clone()
    }

    /// Whether any splice was performed
    pub fn spliced(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| matches!(e, GraphEvent::Splice { .. }))
    }
}

#[async_trait]
impl StorageGraph for RecordingGraph {
    async fn splice(&self, source: &str, target: &str) -> MirrorResult<()> {
        if self.fail_splice.load(Ordering::SeqCst) {
            return Err(MirrorError::Splice(format!(
                "cannot replace {source} with {target}"
            )));
        }
        self.events.lock().push(GraphEvent::Splice {
            source: source.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }

    async fn restore(&self, source: &str) -> MirrorResult<()> {
        self.events.lock().push(GraphEvent::Restore {
            source: source.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_graph() {
        let graph = RecordingGraph::new();
        graph.splice("src", "dst").await.unwrap();
        graph.restore("src").await.unwrap();
        assert!(graph.spliced());
        assert_eq!(
            graph.events(),
            vec![
                GraphEvent::Splice {
                    source: "src".into(),
                    target: "dst".into()
                },
                GraphEvent::Restore {
                    source: "src".into()
                },
            ]
        );

        graph.fail_splices();
        assert!(graph.splice("src", "dst").await.unwrap_err().is_fatal());
    }
}
