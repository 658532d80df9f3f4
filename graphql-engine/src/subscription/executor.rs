use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::ExecutionEngine;
use crate::engine::ExecutionOptions;
use crate::error::ExecutionError;
use crate::error::SubscriptionError;
use crate::graphql::Request;
use crate::query_planner::OperationKind;

const MAX_POOLED_BUFFERS: usize = 64;

/// Hands out executors for the operations started on a connection.
pub trait ExecutorPool: Send + Sync {
    /// Builds an executor for a request. Invalid requests fail here, before anything runs.
    fn get(&self, request: Request) -> Result<Box<dyn Executor>, SubscriptionError>;
}

/// Runs one operation, as many times as needed.
#[async_trait]
pub trait Executor: Send + Sync {
    fn operation_kind(&self) -> OperationKind;

    fn request(&self) -> &Request;

    /// Executes the operation once and returns the serialized response.
    async fn execute(&mut self, cancellation: &CancellationToken) -> Result<Bytes, ExecutionError>;
}

/// An [`ExecutorPool`] running operations on an [`ExecutionEngine`].
///
/// Result buffers are recycled once an executor is dropped.
#[derive(Clone)]
pub struct EngineExecutorPool {
    engine: ExecutionEngine,
    options: ExecutionOptions,
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[buildstructor::buildstructor]
impl EngineExecutorPool {
    #[builder(visibility = "pub")]
    fn new(engine: ExecutionEngine, options: Option<ExecutionOptions>) -> Self {
        Self {
            engine,
            options: options.unwrap_or_default(),
            buffers: Default::default(),
        }
    }
}

impl ExecutorPool for EngineExecutorPool {
    fn get(&self, mut request: Request) -> Result<Box<dyn Executor>, SubscriptionError> {
        self.engine.prepare(&mut request)?;
        let operation_kind = request.operation_kind()?;
        let buffer = self.buffers.lock().pop().unwrap_or_default();
        Ok(Box::new(EngineExecutor {
            engine: self.engine.clone(),
            options: self.options.clone(),
            request,
            operation_kind,
            buffer,
            buffers: self.buffers.clone(),
        }))
    }
}

struct EngineExecutor {
    engine: ExecutionEngine,
    options: ExecutionOptions,
    request: Request,
    operation_kind: OperationKind,
    buffer: Vec<u8>,
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl Executor for EngineExecutor {
    fn operation_kind(&self) -> OperationKind {
        self.operation_kind
    }

    fn request(&self) -> &Request {
        &self.request
    }

    async fn execute(&mut self, cancellation: &CancellationToken) -> Result<Bytes, ExecutionError> {
        let mut options = self.options.clone();
        options.cancellation = Some(cancellation.clone());
        let plan = self.engine.plan_request(&self.request, &options).await?;
        self.buffer.clear();
        self.engine
            .resolve_plan(&self.request, &plan, &options, &mut self.buffer)
            .await?;
        Ok(Bytes::copy_from_slice(&self.buffer))
    }
}

impl Drop for EngineExecutor {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }
}
