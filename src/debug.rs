//! Debug server handler exposing layer state

use bucketstream_debug::{
    BucketCounts, ConnectionInfo as ConnectionSummary, DebugCommand, DebugHandler, DebugResponse, LayerInfo,
    ResponseData,
};

use crate::core::config::LayerCategory;
use crate::layer::DataLayer;
use crate::streaming::{BucketAddress, BucketState};

/// Answers debug commands against a set of layers
pub struct StreamingInspector {
    layers: Vec<DataLayer>,
}

impl StreamingInspector {
    pub fn new(layers: Vec<DataLayer>) -> Self {
        Self { layers }
    }

    fn layer(&self, name: &str) -> Option<&DataLayer> {
        self.layers.iter().find(|layer| layer.name() == name)
    }
}

fn state_name(state: BucketState) -> &'static str {
    match state {
        BucketState::Unrequested => "unrequested",
        BucketState::Requested => "requested",
        BucketState::Loaded => "loaded",
        BucketState::Missing => "missing",
        BucketState::Dirty => "dirty",
        BucketState::Pushing => "pushing",
    }
}

impl DebugHandler for StreamingInspector {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),

            DebugCommand::ListLayers => DebugResponse::ok(ResponseData::Layers {
                layers: self
                    .layers
                    .iter()
                    .map(|layer| LayerInfo {
                        name: layer.name().to_string(),
                        category: match layer.config().category {
                            LayerCategory::Color => "color".into(),
                            LayerCategory::Segmentation => "segmentation".into(),
                        },
                        bytes_per_voxel: layer.config().bytes_per_voxel,
                    })
                    .collect(),
            }),

            DebugCommand::GetLayerStats { layer } => {
                let Some(data_layer) = self.layer(&layer) else {
                    return DebugResponse::unknown_layer(&layer);
                };
                let stats = data_layer.stats();
                DebugResponse::ok(ResponseData::LayerStats {
                    layer,
                    buckets: BucketCounts {
                        total: stats.cube.total,
                        unrequested: stats.cube.unrequested,
                        requested: stats.cube.requested,
                        loaded: stats.cube.loaded,
                        missing: stats.cube.missing,
                        dirty: stats.cube.dirty,
                        pushing: stats.cube.pushing,
                        pending_load: stats.cube.pending_load,
                    },
                    queued_pulls: stats.queued_pulls,
                    in_flight_batches: stats.in_flight_batches,
                    pending_pushes: stats.pending_pushes,
                    state_saved: stats.state_saved,
                    save_error: stats.save_error,
                    connection: stats.connection.map(|c| ConnectionSummary {
                        round_trip_ms: c.round_trip_ms,
                        bandwidth: c.bandwidth,
                        requests: c.requests,
                        total_buckets: c.total_buckets,
                        total_bytes: c.total_bytes,
                    }),
                })
            }

            DebugCommand::GetBucketState {
                layer,
                x,
                y,
                z,
                zoom_step,
            } => {
                let Some(data_layer) = self.layer(&layer) else {
                    return DebugResponse::unknown_layer(&layer);
                };
                let address = BucketAddress::new(x, y, z, zoom_step);
                DebugResponse::ok(ResponseData::BucketState {
                    state: state_name(data_layer.bucket_state(&address)).into(),
                    address: address.to_array(),
                    layer,
                })
            }

            DebugCommand::ClearNormalPriorities { layer } => {
                let Some(data_layer) = self.layer(&layer) else {
                    return DebugResponse::unknown_layer(&layer);
                };
                data_layer.clear_normal_priorities();
                DebugResponse::updated(format!(
                    "{} pull requests left on {}",
                    data_layer.pull_queue().len(),
                    layer
                ))
            }

            DebugCommand::SchedulePush { layer } => {
                let Some(data_layer) = self.layer(&layer) else {
                    return DebugResponse::unknown_layer(&layer);
                };
                let pending = data_layer.push_queue().pending().len();
                let data_layer = data_layer.clone();
                tokio::spawn(async move {
                    if let Err(e) = data_layer.flush().await {
                        log::error!("Debug push on {} failed: {}", data_layer.name(), e);
                    }
                });
                DebugResponse::updated(format!("Pushing {} buckets of {}", pending, layer))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::config::{LayerConfig, StreamConfig};
    use crate::store::testing::{MockSaveQueue, MockSource};
    use crate::streaming::{BoundingBox, ConnectionInfo, QueueEntry, BUCKET_VOXELS};

    fn inspector(save: Arc<MockSaveQueue>) -> (StreamingInspector, DataLayer) {
        let layer = DataLayer::new(
            &StreamConfig::default(),
            LayerConfig::new("color", LayerCategory::Color, BoundingBox::new([0, 0, 0], [128, 128, 128])),
            Arc::new(MockSource::new(BUCKET_VOXELS, 1)),
            save,
            Arc::new(ConnectionInfo::new()),
        );
        (StreamingInspector::new(vec![layer.clone()]), layer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_unknown_layer() {
        let (mut inspector, _layer) = inspector(Arc::new(MockSaveQueue::default()));

        let response = inspector.handle_command(DebugCommand::ListLayers);
        let DebugResponse::Ok {
            data: ResponseData::Layers { layers },
        } = response
        else {
            panic!("unexpected response");
        };
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].category, "color");

        let response = inspector.handle_command(DebugCommand::GetLayerStats {
            layer: "segmentation".into(),
        });
        assert!(matches!(response, DebugResponse::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_state_and_stats() {
        let (mut inspector, layer) = inspector(Arc::new(MockSaveQueue::default()));
        let address = BucketAddress::new(1, 1, 1, 0);
        layer.request_buckets([QueueEntry::new(address, 0)]);
        layer.pull_queue().wait_idle().await;

        let response = inspector.handle_command(DebugCommand::GetBucketState {
            layer: "color".into(),
            x: 1,
            y: 1,
            z: 1,
            zoom_step: 0,
        });
        assert_eq!(
            response,
            DebugResponse::ok(ResponseData::BucketState {
                layer: "color".into(),
                address: [1, 1, 1, 0],
                state: "loaded".into(),
            })
        );

        let response = inspector.handle_command(DebugCommand::GetLayerStats { layer: "color".into() });
        let DebugResponse::Ok {
            data: ResponseData::LayerStats { buckets, connection, .. },
        } = response
        else {
            panic!("unexpected response");
        };
        assert_eq!(buckets.loaded, 1);
        assert_eq!(connection.map(|c| c.requests), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_push_flushes() {
        let save = Arc::new(MockSaveQueue::default());
        let (mut inspector, layer) = inspector(save.clone());
        let address = BucketAddress::new(0, 0, 0, 0);
        layer.request_buckets([QueueEntry::new(address, 0)]);
        layer.pull_queue().wait_idle().await;
        layer.write_bucket(address, |data| data[0] = 3).unwrap();

        inspector.handle_command(DebugCommand::SchedulePush { layer: "color".into() });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(save.actions().len(), 1);
        assert!(layer.state_saved());
    }
}
