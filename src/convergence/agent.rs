//! Per-node convergence agent

use super::collector::Collector;
use super::executor::{ActionExecutor, Drivers, ExecutionReport, ExecutorConfig};
use super::planner;
use crate::driver::run_blocking;
use crate::error::{Result, RuneError};
use crate::model::{ClusterState, Deployment, NodeId, NodeState, Plan};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Drives convergence passes for one node
///
/// Only one pass runs at a time; a pass triggered while another is in
/// flight waits for it to finish and then plans from fresh observations.
/// A pass keeps running when the caller stops waiting for it, and holds
/// the pass lock until its last action has settled.
pub struct ConvergenceAgent {
    local: NodeId,
    collector: Collector,
    executor: ActionExecutor,
    passes: Arc<Mutex<u64>>,
}

impl ConvergenceAgent {
    /// Create an agent for `local`
    pub fn new(local: NodeId, drivers: Drivers, config: ExecutorConfig) -> Self {
        let collector = Collector::new(
            local.clone(),
            &config.namespace,
            drivers.containers.clone(),
            drivers.volumes.clone(),
        );
        Self {
            local,
            collector,
            executor: ActionExecutor::new(drivers, config),
            passes: Arc::new(Mutex::new(0)),
        }
    }

    /// Node this agent converges
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Observe the local node
    pub async fn discover(&self) -> Result<NodeState> {
        let collector = self.collector.clone();
        run_blocking(move || collector.collect()).await
    }

    /// Plan against `current` with the local entry replaced by a fresh observation
    pub async fn plan(&self, desired: &Deployment, current: &ClusterState) -> Result<Plan> {
        let mut current = current.clone();
        current.insert(self.discover().await?);
        planner::plan(desired, &current, &self.local)
    }

    /// Run one convergence pass
    ///
    /// Configuration errors are returned before any action runs; action
    /// failures are recorded in the report.
    pub async fn converge(
        &self,
        desired: &Deployment,
        current: &ClusterState,
    ) -> Result<ExecutionReport> {
        let mut passes = self.passes.clone().lock_owned().await;
        let local = self.local.clone();
        let collector = self.collector.clone();
        let executor = self.executor.clone();
        let desired = desired.clone();
        let mut current = current.clone();

        let pass = tokio::spawn(async move {
            *passes += 1;
            info!("Starting convergence pass {} on {}", *passes, local);

            current.insert(run_blocking(move || collector.collect()).await?);
            let plan = planner::plan(&desired, &current, &local)?;
            if plan.is_converged() {
                info!("{} is already converged", local);
            }
            Ok::<_, RuneError>(executor.execute(&plan).await)
        });

        pass.await
            .map_err(|e| RuneError::Internal(format!("Convergence pass aborted: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        ContainerDriver, ContainerSpec, FilesystemVolumeDriver, LocalContainerDriver, UnitState,
        VolumeDriver,
    };
    use crate::handoff::{HandoffReceiver, LocalTransport};
    use crate::model::{Action, Application, DockerImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Container driver whose creates take a while and are counted
    struct SlowCreate {
        inner: LocalContainerDriver,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ContainerDriver for SlowCreate {
        fn list_units(&self) -> Result<Vec<UnitState>> {
            self.inner.list_units()
        }

        fn create(&self, spec: &ContainerSpec) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let result = self.inner.create(spec);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn stop(&self, name: &str) -> Result<()> {
            self.inner.stop(name)
        }

        fn remove(&self, name: &str) -> Result<()> {
            self.inner.remove(name)
        }
    }

    struct TestNode {
        _dir: TempDir,
        containers: Arc<LocalContainerDriver>,
        volumes: Arc<FilesystemVolumeDriver>,
        agent: Arc<ConvergenceAgent>,
    }

    fn test_node(name: &str, transport: &Arc<LocalTransport>) -> TestNode {
        let dir = tempdir().unwrap();
        let containers = Arc::new(LocalContainerDriver::new(dir.path().join("units")).unwrap());
        let volumes = Arc::new(FilesystemVolumeDriver::new(dir.path().join("volumes")).unwrap());
        transport
            .register(
                NodeId::new(name),
                Arc::new(HandoffReceiver::new(NodeId::new(name), volumes.clone())),
            )
            .unwrap();

        let drivers = Drivers {
            containers: containers.clone(),
            volumes: volumes.clone(),
            transport: transport.clone(),
        };
        let config = ExecutorConfig {
            arrival_timeout: Duration::from_secs(10),
            arrival_poll_interval: Duration::from_millis(10),
            ..ExecutorConfig::default()
        };
        TestNode {
            _dir: dir,
            containers,
            volumes,
            agent: Arc::new(ConvergenceAgent::new(NodeId::new(name), drivers, config)),
        }
    }

    fn db() -> Application {
        Application::new("db", DockerImage::from_string("postgres:9.3").unwrap())
            .port(5432, 5432)
            .volume("/var/lib/postgresql/data")
    }

    async fn cluster(nodes: &[&TestNode]) -> ClusterState {
        let mut state = ClusterState::new();
        for node in nodes {
            state.insert(node.agent.discover().await.unwrap());
        }
        state
    }

    #[tokio::test]
    async fn test_fresh_start() {
        let transport = Arc::new(LocalTransport::new());
        let node1 = test_node("node1", &transport);
        let desired = Deployment::new([db()]).assign("node1", "db");

        let report = node1
            .agent
            .converge(&desired, &ClusterState::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.results.len(), 1);
        assert!(node1.volumes.list_volumes().unwrap().iter().any(|v| v.name == "db"));

        let current = cluster(&[&node1]).await;
        assert!(node1.agent.plan(&desired, &current).await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_relocation_between_nodes() {
        let transport = Arc::new(LocalTransport::new());
        let node1 = test_node("node1", &transport);
        let node2 = test_node("node2", &transport);

        let before = Deployment::new([db()]).assign("node1", "db").node("node2");
        node1.agent.converge(&before, &ClusterState::new()).await.unwrap();
        let data = node1.volumes.volume_path("db").join("PG_VERSION");
        std::fs::write(&data, b"9.3").unwrap();

        let after = Deployment::new([db()]).node("node1").assign("node2", "db");
        let current = cluster(&[&node1, &node2]).await;

        let source_plan = node1.agent.plan(&after, &current).await.unwrap();
        assert!(matches!(
            source_plan.actions().collect::<Vec<_>>()[..],
            [Action::StopApplication { .. }, Action::HandoffVolume { .. }]
        ));

        let (source, destination) = tokio::join!(
            node1.agent.converge(&after, &current),
            node2.agent.converge(&after, &current)
        );
        let source = source.unwrap();
        let destination = destination.unwrap();
        assert!(source.is_success(), "{:?}", source);
        assert!(destination.is_success(), "{:?}", destination);

        assert!(node1.containers.list_units().unwrap().is_empty());
        assert!(node1.volumes.list_volumes().unwrap().is_empty());
        assert_eq!(node2.containers.list_units().unwrap().len(), 1);
        assert_eq!(
            std::fs::read(node2.volumes.volume_path("db").join("PG_VERSION")).unwrap(),
            b"9.3"
        );

        let current = cluster(&[&node1, &node2]).await;
        assert!(node1.agent.plan(&after, &current).await.unwrap().is_converged());
        assert!(node2.agent.plan(&after, &current).await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_configuration_error_runs_nothing() {
        let transport = Arc::new(LocalTransport::new());
        let node1 = test_node("node1", &transport);
        let desired = Deployment::new([db()])
            .assign("node1", "db")
            .assign("node2", "db");

        let err = node1
            .agent
            .converge(&desired, &ClusterState::new())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(node1.containers.list_units().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_pass_keeps_the_lock() {
        let dir = tempdir().unwrap();
        let containers = Arc::new(SlowCreate {
            inner: LocalContainerDriver::new(dir.path().join("units")).unwrap(),
            delay: Duration::from_millis(300),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let volumes = Arc::new(FilesystemVolumeDriver::new(dir.path().join("volumes")).unwrap());
        let drivers = Drivers {
            containers: containers.clone(),
            volumes,
            transport: Arc::new(LocalTransport::new()),
        };
        let agent = ConvergenceAgent::new(NodeId::new("node1"), drivers, ExecutorConfig::default());
        let desired = Deployment::new([db()]).assign("node1", "db");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            agent.converge(&desired, &ClusterState::new()),
        )
        .await;
        assert!(abandoned.is_err());

        let report = agent.converge(&desired, &ClusterState::new()).await.unwrap();
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(containers.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(containers.inner.list_units().unwrap().len(), 1);
    }
}
