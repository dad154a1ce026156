//! Network Sink & Source
//!
//! The sink buffers rows into batches of configured size and ships them as
//! bincode frames over its bridge; the final frame carries EOS. A remote
//! failure acknowledgment fails the whole query. The source blocks on the
//! router queue until its producer closes the stream.

use super::{ExecError, ExecNode, ExecResult, ExecState};
use crate::plan::{OperatorPb, RowBatchData, RowBatchRequest};
use crate::table_store::RowBatch;
use crate::types::arrow_adapter::column_wrapper_from_array;
use crate::types::{ColumnWrapper, DataType};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::trace;

// ============================================================================
// GRPC sink
// ============================================================================

pub struct GrpcSinkNode {
    address: String,
    destination_id: i64,
    pending: Vec<ColumnWrapper>,
    pending_rows: usize,
    sent_eos: bool,
}

impl GrpcSinkNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::GrpcSink { address, destination_id } = op else {
            return Err(ExecError::Internal("expected GrpcSink".to_string()));
        };
        Ok(GrpcSinkNode {
            address: address.clone(),
            destination_id: *destination_id,
            pending: Vec::new(),
            pending_rows: 0,
            sent_eos: false,
        })
    }

    fn absorb(&mut self, rb: &RowBatch) -> ExecResult<()> {
        let incoming: Vec<ColumnWrapper> = rb
            .columns()
            .iter()
            .map(|c| {
                column_wrapper_from_array(c)
                    .map_err(|e| ExecError::BatchSchemaMismatch(e.to_string()))
            })
            .collect::<ExecResult<_>>()?;
        if self.pending.is_empty() {
            self.pending = incoming;
        } else {
            for (dst, src) in self.pending.iter_mut().zip(incoming.into_iter()) {
                extend_wrapper(dst, src);
            }
        }
        self.pending_rows += rb.num_rows();
        Ok(())
    }

    /// Remove the first `n` rows of the pending buffer as a frame payload.
    fn take_front(&mut self, n: usize) -> Vec<ColumnWrapper> {
        let taken: Vec<ColumnWrapper> = self
            .pending
            .iter()
            .map(|col| {
                let mut front = ColumnWrapper::with_capacity(col.data_type(), n);
                for i in 0..n.min(col.len()) {
                    front.push(col.get(i));
                }
                front
            })
            .collect();
        let remaining = self.pending_rows - n.min(self.pending_rows);
        let kept: Vec<ColumnWrapper> = self
            .pending
            .iter()
            .map(|col| {
                let mut rest = ColumnWrapper::with_capacity(col.data_type(), remaining);
                for i in n.min(col.len())..col.len() {
                    rest.push(col.get(i));
                }
                rest
            })
            .collect();
        self.pending = kept;
        self.pending_rows = remaining;
        taken
    }

    fn send_frame(&self, state: &ExecState, columns: Vec<ColumnWrapper>, rows: usize, eos: bool) -> ExecResult<()> {
        let request = RowBatchRequest {
            address: self.address.clone(),
            destination_id: self.destination_id,
            query_id: state.query_id,
            row_batch: RowBatchData { columns, num_rows: rows, eow: eos, eos },
        };
        let frame = bincode::serialize(&request)
            .map_err(|e| ExecError::RemoteSinkFailed(e.to_string()))?;
        let bridge = state.bridges.get(&self.address).ok_or_else(|| {
            ExecError::RemoteSinkFailed(format!("no route to '{}'", self.address))
        })?;
        let response = bridge.send(&frame)?;
        if !response.success {
            return Err(ExecError::RemoteSinkFailed(response.message));
        }
        trace!(destination = self.destination_id, rows, eos, "sink shipped frame");
        Ok(())
    }
}

impl ExecNode for GrpcSinkNode {
    fn consume(&mut self, state: &ExecState, rb: RowBatch, _slot: usize) -> ExecResult<Vec<RowBatch>> {
        let eos = rb.eos();
        self.absorb(&rb)?;
        while self.pending_rows >= state.batch_size {
            let n = state.batch_size;
            let columns = self.take_front(n);
            self.send_frame(state, columns, n, false)?;
        }
        if eos {
            let rows = self.pending_rows;
            let columns = std::mem::take(&mut self.pending);
            self.pending_rows = 0;
            self.send_frame(state, columns, rows, true)?;
            self.sent_eos = true;
        }
        Ok(vec![])
    }

    fn close(&mut self, state: &ExecState) -> ExecResult<()> {
        // A cancelled query closes the stream without a data EOS; send an
        // explicit empty final frame so the peer does not hang.
        if !self.sent_eos && state.is_cancelled() {
            let _ = self.send_frame(state, Vec::new(), 0, true);
            self.sent_eos = true;
        }
        Ok(())
    }
}

fn extend_wrapper(dst: &mut ColumnWrapper, src: ColumnWrapper) {
    match (dst, src) {
        (ColumnWrapper::Boolean(d), ColumnWrapper::Boolean(s)) => d.extend(s),
        (ColumnWrapper::Int64(d), ColumnWrapper::Int64(s)) => d.extend(s),
        (ColumnWrapper::Uint128(d), ColumnWrapper::Uint128(s)) => d.extend(s),
        (ColumnWrapper::Float64(d), ColumnWrapper::Float64(s)) => d.extend(s),
        (ColumnWrapper::String(d), ColumnWrapper::String(s)) => d.extend(s),
        (ColumnWrapper::Time64Ns(d), ColumnWrapper::Time64Ns(s)) => d.extend(s),
        _ => panic!("sink buffer column type drifted"),
    }
}

// ============================================================================
// GRPC source
// ============================================================================

/// Blocks waiting for frames routed from the GRPC router; EOS is signaled
/// when the producer has closed.
pub struct GrpcSourceNode {
    source_id: i64,
    column_types: Vec<DataType>,
    receiver: Option<Receiver<RowBatchData>>,
    done: bool,
}

impl GrpcSourceNode {
    pub fn new(op: &OperatorPb) -> ExecResult<Self> {
        let OperatorPb::GrpcSource { source_id, column_types, .. } = op else {
            return Err(ExecError::Internal("expected GrpcSource".to_string()));
        };
        Ok(GrpcSourceNode {
            source_id: *source_id,
            column_types: column_types.clone(),
            receiver: None,
            done: false,
        })
    }
}

impl ExecNode for GrpcSourceNode {
    fn is_source(&self) -> bool {
        true
    }

    fn open(&mut self, state: &ExecState) -> ExecResult<()> {
        self.receiver = Some(state.router.register_source(state.query_id, self.source_id));
        Ok(())
    }

    fn generate_next(&mut self, state: &ExecState) -> ExecResult<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }
        let receiver = self.receiver.as_ref().expect("opened");
        loop {
            if state.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            if state.timed_out() {
                return Err(ExecError::QueryTimeout);
            }
            match receiver.recv_timeout(Duration::from_millis(50)) {
                Ok(data) => {
                    if data.eos {
                        self.done = true;
                    }
                    let rb = data.into_row_batch()?;
                    if rb.desc().types() != self.column_types.as_slice() && rb.num_rows() > 0 {
                        return Err(ExecError::BatchSchemaMismatch(format!(
                            "source {} expected {:?}",
                            self.source_id, self.column_types
                        )));
                    }
                    return Ok(Some(rb));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{EvaluatorKind, GrpcRouter, LocalBridge};
    use crate::table_store::TableStore;
    use crate::types::arrow_adapter::column_wrapper_to_array;
    use crate::udf::Registry;
    use std::sync::Arc;
    use uuid::Uuid;

    fn linked_state(batch_size: usize) -> (ExecState, Arc<GrpcRouter>) {
        let router = Arc::new(GrpcRouter::new());
        let mut state = ExecState::new(
            Uuid::new_v4(),
            Arc::new(TableStore::new()),
            Arc::new(Registry::with_builtins()),
            Arc::clone(&router),
            EvaluatorKind::VectorNative,
            batch_size,
        );
        state.bridges.insert(
            "kelvin:59300".to_string(),
            Arc::new(LocalBridge::new(Arc::clone(&router))) as Arc<dyn crate::exec::GrpcBridge>,
        );
        (state, router)
    }

    fn int_batch(vals: Vec<i64>, eos: bool) -> RowBatch {
        let mut rb =
            RowBatch::from_columns(vec![column_wrapper_to_array(&ColumnWrapper::Int64(vals))])
                .unwrap();
        rb.set_eos(eos);
        rb
    }

    fn sink_op() -> OperatorPb {
        OperatorPb::GrpcSink {
            address: "kelvin:59300".to_string(),
            destination_id: 10,
        }
    }

    #[test]
    fn test_sink_batches_by_configured_size() {
        let (state, router) = linked_state(2);
        let rx = router.register_source(state.query_id, 10);

        let mut sink = GrpcSinkNode::new(&sink_op()).unwrap();
        sink.consume(&state, int_batch(vec![1, 2, 3], false), 0).unwrap();
        sink.consume(&state, int_batch(vec![4, 5], true), 0).unwrap();

        // 5 rows at size 2: two full frames, one final EOS frame.
        let frames: Vec<RowBatchData> = rx.try_iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].num_rows, 2);
        assert!(!frames[0].eos);
        assert_eq!(frames[1].num_rows, 2);
        assert_eq!(frames[2].num_rows, 1);
        assert!(frames[2].eos);
    }

    #[test]
    fn test_sink_without_route_fails() {
        let (mut state, _router) = linked_state(2);
        state.bridges.clear();
        let mut sink = GrpcSinkNode::new(&sink_op()).unwrap();
        let err = sink.consume(&state, int_batch(vec![1], true), 0).unwrap_err();
        assert!(matches!(err, ExecError::RemoteSinkFailed(_)));
    }

    #[test]
    fn test_source_receives_in_order_until_eos() {
        let (state, router) = linked_state(16);
        let mut source = GrpcSourceNode::new(&OperatorPb::GrpcSource {
            source_id: 10,
            column_names: vec!["v".to_string()],
            column_types: vec![DataType::Int64],
        })
        .unwrap();
        source.open(&state).unwrap();

        let mut sink = GrpcSinkNode::new(&sink_op()).unwrap();
        sink.consume(&state, int_batch(vec![1, 2], false), 0).unwrap();
        sink.consume(&state, int_batch(vec![3], true), 0).unwrap();

        let first = source.generate_next(&state).unwrap().unwrap();
        assert_eq!(first.num_rows(), 3);
        assert!(first.eos());
        assert!(source.generate_next(&state).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_source_returns_cancelled() {
        let (state, _router) = linked_state(16);
        let mut source = GrpcSourceNode::new(&OperatorPb::GrpcSource {
            source_id: 99,
            column_names: vec!["v".to_string()],
            column_types: vec![DataType::Int64],
        })
        .unwrap();
        source.open(&state).unwrap();
        state.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(source.generate_next(&state), Err(ExecError::Cancelled)));
    }

    #[test]
    fn test_expired_deadline_times_out_stalled_source() {
        let (mut state, _router) = linked_state(16);
        state.set_deadline(Some(std::time::Instant::now()));
        let mut source = GrpcSourceNode::new(&OperatorPb::GrpcSource {
            source_id: 99,
            column_names: vec!["v".to_string()],
            column_types: vec![DataType::Int64],
        })
        .unwrap();
        source.open(&state).unwrap();
        assert!(matches!(source.generate_next(&state), Err(ExecError::QueryTimeout)));
    }
}
