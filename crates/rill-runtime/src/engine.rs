//! Node engine assembly: buffer pool, query manager, network manager, and
//! the deployment of pipeline specs into running queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rill_core::buffer::BufferManager;
use rill_core::config::{PipelineSpec, RuntimeSpec, SinkSpec, SourceSpec};
use rill_core::error::{EngineError, Result};
use rill_core::reconfig::{PipelineMessage, TerminationKind};
use rill_core::schema::Schema;
use rill_core::sink::run_sink;
use rill_core::source::{DataSource, GatheringMode, SourceHandle};
use rill_core::QueryId;
use rill_net::{ChannelPartition, NetworkManager, NetworkSink, NodeLocation};

use crate::query::{QueryManager, QueryStatus};

pub struct NodeEngine {
    buffers: BufferManager,
    query_manager: Arc<QueryManager>,
    network: Option<Arc<NetworkManager>>,
}

impl NodeEngine {
    /// An engine without an inter-worker listener.
    pub fn new(runtime: &RuntimeSpec) -> Self {
        let buffers = BufferManager::new(runtime.buffer_size_bytes, runtime.num_buffers);
        let query_manager = QueryManager::new(runtime.workers, runtime.pool_mode, buffers.clone());
        Self {
            buffers,
            query_manager,
            network: None,
        }
    }

    /// An engine that also accepts inter-worker channels on `listen`.
    pub async fn with_network(runtime: &RuntimeSpec, listen: NodeLocation) -> Result<Self> {
        let mut engine = Self::new(runtime);
        engine.network = Some(NetworkManager::bind(listen).await?);
        Ok(engine)
    }

    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }

    pub fn network_manager(&self) -> Option<&Arc<NetworkManager>> {
        self.network.as_ref()
    }

    /// Deploys a source-to-sink pipeline spec as one query.
    pub async fn deploy(&self, query_id: QueryId, spec: &PipelineSpec) -> Result<RunningQuery> {
        let schema = Schema::new(spec.schema.clone());
        if schema.record_size_bytes() == 0 {
            return Err(EngineError::config("pipeline spec has an empty schema"));
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut sink_inputs: HashMap<String, mpsc::Sender<PipelineMessage>> = HashMap::new();

        for sink_spec in &spec.sinks {
            let (tx, rx) = mpsc::channel::<PipelineMessage>(64);
            sink_inputs.insert(sink_spec.id().to_string(), tx);
            let sink = self.build_sink(sink_spec, schema.clone())?;
            let sink_cancel = cancel.child_token();
            tasks.push(tokio::spawn(run_sink(sink, rx, sink_cancel)));
        }

        let mut source_handles = Vec::new();
        for (index, source_spec) in spec.sources.iter().enumerate() {
            let successors: Vec<_> = spec
                .edges
                .iter()
                .filter(|(from, _)| from == source_spec.id())
                .map(|(_, to)| {
                    sink_inputs.get(to).cloned().ok_or_else(|| {
                        EngineError::config(format!("edge target {to:?} is not a sink"))
                    })
                })
                .collect::<Result<_>>()?;
            if successors.is_empty() {
                return Err(EngineError::config(format!(
                    "source {:?} has no outgoing edge",
                    source_spec.id()
                )));
            }
            let out = fan_out(successors, &mut tasks);

            let connector = rill_io::create_source_connector(source_spec, schema.clone())?;
            let (gathering, buffers_to_produce) = gathering_of(source_spec);
            let source = DataSource::new(
                connector,
                index as u64 + 1,
                gathering,
                buffers_to_produce,
                self.buffers.clone(),
                out,
                query_id,
                1,
            );
            source_handles.push(source.handle());
            tasks.push(tokio::spawn(source.run()));
        }

        self.query_manager
            .register_query(query_id, spec.sources.len() + spec.sinks.len());
        info!(
            query = query_id,
            name = %spec.name,
            sources = spec.sources.len(),
            sinks = spec.sinks.len(),
            "query deployed"
        );
        Ok(RunningQuery {
            query_id,
            cancel,
            source_handles,
            tasks,
            manager: self.query_manager.clone(),
        })
    }

    fn build_sink(
        &self,
        spec: &SinkSpec,
        schema: Arc<Schema>,
    ) -> Result<Box<dyn rill_core::DataSink>> {
        if let SinkSpec::Network {
            id,
            host,
            port,
            operator_id,
            subplan_id,
            wait_time_ms,
            retry_times,
        } = spec
        {
            let sender = self
                .network
                .as_ref()
                .map(|n| n.local_location().clone())
                .unwrap_or_else(|| NodeLocation::new("local", 0));
            let partition = ChannelPartition {
                operator_id: *operator_id,
                subplan_id: *subplan_id,
                sender,
                receiver: NodeLocation::new(host.clone(), *port),
            };
            return Ok(Box::new(NetworkSink::new(
                id.clone(),
                partition,
                *subplan_id,
                schema.record_size_bytes(),
                Duration::from_millis(*wait_time_ms),
                *retry_times,
            )));
        }
        match rill_io::create_sink(spec, schema)? {
            Some(sink) => Ok(sink),
            None => Err(EngineError::config(format!(
                "sink {:?} cannot be constructed here",
                spec.id()
            ))),
        }
    }
}

fn gathering_of(spec: &SourceSpec) -> (GatheringMode, Option<u64>) {
    match spec {
        SourceSpec::Csv(csv) => (
            GatheringMode::Interval(Duration::from_millis(csv.gathering_interval_ms.max(1))),
            csv.buffers_to_produce,
        ),
        // Socket-backed sources pace themselves on I/O and flush intervals.
        _ => (GatheringMode::Interval(Duration::from_millis(1)), None),
    }
}

/// One outgoing edge when there is one successor; a relay task otherwise.
fn fan_out(
    successors: Vec<mpsc::Sender<PipelineMessage>>,
    tasks: &mut Vec<tokio::task::JoinHandle<Result<()>>>,
) -> mpsc::Sender<PipelineMessage> {
    if successors.len() == 1 {
        return successors.into_iter().next().expect("one successor");
    }
    let (tx, mut rx) = mpsc::channel::<PipelineMessage>(64);
    tasks.push(tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            for successor in &successors {
                if successor.send(message.clone()).await.is_err() {
                    warn!("fan-out successor closed");
                }
            }
        }
        Ok(())
    }));
    tx
}

/// A deployed query's handles: stop it, then await its terminal status.
pub struct RunningQuery {
    query_id: QueryId,
    cancel: CancellationToken,
    source_handles: Vec<SourceHandle>,
    tasks: Vec<tokio::task::JoinHandle<Result<()>>>,
    manager: Arc<QueryManager>,
}

impl RunningQuery {
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn source_handles(&self) -> &[SourceHandle] {
        &self.source_handles
    }

    /// Requests termination. Graceful lets sources drain and end-of-stream
    /// flow; a hard stop also stops accepting new buffer deliveries and
    /// cancels the sink tasks.
    pub fn stop(&self, kind: TerminationKind) {
        for handle in &self.source_handles {
            handle.stop(kind);
        }
        if kind != TerminationKind::Graceful {
            self.manager.stop_accepting(self.query_id);
            self.cancel.cancel();
        }
    }

    /// Awaits every task of the query and reports the terminal status.
    pub async fn join(self) -> QueryStatus {
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {
                    self.manager
                        .notify_unit_completion(self.query_id, TerminationKind::Graceful);
                }
                Ok(Err(e)) => {
                    warn!(query = self.query_id, error = %e, "query task failed");
                    self.manager.fail_query(self.query_id, e.to_string());
                }
                Err(e) => {
                    warn!(query = self.query_id, error = %e, "query task panicked");
                    self.manager.fail_query(self.query_id, e.to_string());
                }
            }
        }
        self.manager
            .query_status(self.query_id)
            .unwrap_or(QueryStatus::Completed)
    }
}
