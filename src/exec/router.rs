//! GRPC Router & Bridges
//!
//! A per-instance router multiplexes incoming row-batch frames to the
//! correct `GRPCSource` by `(query_id, destination_id)`. The bridge is the
//! transport seam: frames are bincode-encoded `RowBatchRequest`s, delivered
//! in order within one sink/source pair, with EOS signaled exactly once by
//! the final frame.

use super::{ExecError, ExecResult};
use crate::plan::{RowBatchData, RowBatchRequest, RowBatchResponse};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

type QueueKey = (Uuid, i64);

/// Routes row-batch frames to registered source queues. Queues are created
/// on first touch from either side, so data arriving before the executor
/// registers its sources is buffered rather than dropped.
#[derive(Default)]
pub struct GrpcRouter {
    queues: DashMap<QueueKey, (Sender<RowBatchData>, Receiver<RowBatchData>)>,
}

impl GrpcRouter {
    pub fn new() -> Self {
        GrpcRouter::default()
    }

    fn queue(&self, key: QueueKey) -> (Sender<RowBatchData>, Receiver<RowBatchData>) {
        self.queues.entry(key).or_insert_with(unbounded).clone()
    }

    /// The receiving end for one `(query, destination)` stream.
    pub fn register_source(&self, query_id: Uuid, destination_id: i64) -> Receiver<RowBatchData> {
        self.queue((query_id, destination_id)).1
    }

    /// Deliver one decoded request into the matching queue.
    pub fn deliver(&self, request: RowBatchRequest) -> RowBatchResponse {
        let key = (request.query_id, request.destination_id);
        trace!(destination = request.destination_id, rows = request.row_batch.num_rows, "routing row batch");
        match self.queue(key).0.send(request.row_batch) {
            Ok(()) => RowBatchResponse { success: true, message: String::new() },
            Err(_) => RowBatchResponse {
                success: false,
                message: format!("destination {} closed", request.destination_id),
            },
        }
    }

    /// Drop the queues of a finished query.
    pub fn release_query(&self, query_id: Uuid) {
        self.queues.retain(|(q, _), _| *q != query_id);
    }
}

/// The transport between a local `GRPCSink` and a remote router. Frames are
/// opaque bytes to the sink; order within a pair is preserved.
pub trait GrpcBridge: Send + Sync {
    fn send(&self, frame: &[u8]) -> ExecResult<RowBatchResponse>;
}

/// In-process transport: decodes the frame and hands it to the peer's
/// router directly. The byte round-trip keeps the wire contract honest.
pub struct LocalBridge {
    router: Arc<GrpcRouter>,
}

impl LocalBridge {
    pub fn new(router: Arc<GrpcRouter>) -> Self {
        LocalBridge { router }
    }
}

impl GrpcBridge for LocalBridge {
    fn send(&self, frame: &[u8]) -> ExecResult<RowBatchResponse> {
        let request: RowBatchRequest = bincode::deserialize(frame)
            .map_err(|e| ExecError::RemoteSinkFailed(format!("bad frame: {}", e)))?;
        Ok(self.router.deliver(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnWrapper;

    fn frame(query: Uuid, dest: i64, rows: Vec<i64>, eos: bool) -> Vec<u8> {
        let req = RowBatchRequest {
            address: "kelvin:59300".to_string(),
            destination_id: dest,
            query_id: query,
            row_batch: RowBatchData {
                num_rows: rows.len(),
                columns: vec![ColumnWrapper::Int64(rows)],
                eow: eos,
                eos,
            },
        };
        bincode::serialize(&req).unwrap()
    }

    #[test]
    fn test_routing_preserves_order() {
        let router = Arc::new(GrpcRouter::new());
        let bridge = LocalBridge::new(Arc::clone(&router));
        let query = Uuid::new_v4();

        let rx = router.register_source(query, 10);
        assert!(bridge.send(&frame(query, 10, vec![1], false)).unwrap().success);
        assert!(bridge.send(&frame(query, 10, vec![2], true)).unwrap().success);

        let first = rx.recv().unwrap();
        assert_eq!(first.columns[0], ColumnWrapper::Int64(vec![1]));
        assert!(!first.eos);
        let second = rx.recv().unwrap();
        assert!(second.eos);
    }

    #[test]
    fn test_delivery_before_registration_is_buffered() {
        let router = Arc::new(GrpcRouter::new());
        let bridge = LocalBridge::new(Arc::clone(&router));
        let query = Uuid::new_v4();

        assert!(bridge.send(&frame(query, 7, vec![42], true)).unwrap().success);
        let rx = router.register_source(query, 7);
        assert_eq!(rx.recv().unwrap().columns[0], ColumnWrapper::Int64(vec![42]));
    }

    #[test]
    fn test_streams_are_isolated_by_destination() {
        let router = Arc::new(GrpcRouter::new());
        let bridge = LocalBridge::new(Arc::clone(&router));
        let query = Uuid::new_v4();

        let rx9 = router.register_source(query, 9);
        let rx10 = router.register_source(query, 10);
        bridge.send(&frame(query, 10, vec![1], true)).unwrap();

        assert!(rx9.try_recv().is_err());
        assert!(rx10.try_recv().is_ok());
    }
}
