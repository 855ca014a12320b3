//! ENINode resource watcher.
//!
//! Streams `ENINode` events from the API server into the node manager.
//! The watch reconnects with backoff on its own; errors are logged and the
//! stream continues.

use crate::error::ControllerError;
use crate::node_manager::NodeManager;
use crds::ENINode;
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Apply one watch event to the manager
pub async fn apply_event(manager: &NodeManager, event: Event<ENINode>) -> Result<(), ControllerError> {
    match event {
        Event::Apply(node) | Event::InitApply(node) => {
            debug!("ENINode {} changed", node.name_any());
            manager.upsert(node).await
        }
        Event::Delete(node) => {
            manager.delete(&node.name_any()).await;
            Ok(())
        }
        Event::Init => {
            debug!("ENINode watch (re)started");
            Ok(())
        }
        Event::InitDone => {
            info!("ENINode initial listing complete, {} nodes registered", manager.get_names().await.len());
            Ok(())
        }
    }
}

/// Watch all `ENINode` resources until the stream ends
pub async fn watch_nodes(api: Api<ENINode>, manager: Arc<NodeManager>) -> Result<(), ControllerError> {
    info!("Starting ENINode watcher");

    let mut events = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Err(e) = apply_event(&manager, event).await {
                    error!("Failed to apply ENINode event: {}", e);
                }
            }
            Err(e) => error!("ENINode watch error: {}", e),
        }
    }

    Err(ControllerError::Watch("ENINode watch stream ended".to_string()))
}
