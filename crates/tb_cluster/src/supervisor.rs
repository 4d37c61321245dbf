//! Cluster bring-up
//!
//! Brings up one database container per host. The first configured host is
//! the seed; every other node is started pointing at the seed's resolved
//! address. Each step converges: re-running bring-up replaces same-named
//! containers and re-issues `IF NOT EXISTS` schema statements.

use crate::fleet::Fleet;
use crate::{ClusterError, WorkloadUnit};
use std::sync::Arc;
use std::time::Duration;
use tb_config::{CampaignConfig, SchemaConfig};
use tb_remote::{RemoteExec, shell_escape};
use tracing::{debug, info, instrument, warn};

/// Number of YCSB value columns in the benchmark table
const FIELD_COUNT: usize = 10;

/// Starts and verifies database nodes
pub struct ClusterSupervisor<'a> {
    exec: Arc<dyn RemoteExec>,
    config: &'a CampaignConfig,
    fleet: Fleet,
}

impl<'a> ClusterSupervisor<'a> {
    #[must_use]
    pub fn new(exec: Arc<dyn RemoteExec>, config: &'a CampaignConfig) -> Self {
        Self {
            exec,
            config,
            fleet: Fleet::new(config.connection.max_concurrent),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    /// Make sure the container runtime answers on `host`, starting the
    /// service once if it does not.
    ///
    /// # Errors
    /// Returns [`ClusterError::RuntimeUnavailable`] if docker stays unreachable.
    #[instrument(skip(self))]
    pub async fn ensure_runtime_ready(&self, host: &str) -> Result<(), ClusterError> {
        let check = "docker info --format '{{.ServerVersion}}'";
        let output = self.exec.execute(host, check, self.timeout()).await?;
        if output.success() {
            debug!(host = %host, version = %output.stdout.trim(), "Container runtime ready");
            return Ok(());
        }

        warn!(host = %host, "Container runtime not answering, starting service");
        self.exec
            .execute(host, "sudo -n systemctl start docker", self.timeout())
            .await?;

        let output = self.exec.execute(host, check, self.timeout()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ClusterError::RuntimeUnavailable {
                host: host.to_string(),
                reason: output.stderr.trim().to_string(),
            })
        }
    }

    /// Address other nodes should use to reach `host`.
    ///
    /// Falls back to the configured host name when the host cannot tell.
    ///
    /// # Errors
    /// Returns a [`ClusterError`] only for connection-level failures.
    #[instrument(skip(self))]
    pub async fn resolve_address(&self, host: &str) -> Result<String, ClusterError> {
        let probes = [
            "hostname -I",
            "ip -4 route get 1 | sed -n 's/.* src \\([0-9.]*\\).*/\\1/p'",
        ];
        for probe in probes {
            let output = self.exec.execute(host, probe, self.timeout()).await?;
            if let Some(addr) = output
                .success()
                .then(|| output.stdout.split_whitespace().next())
                .flatten()
            {
                info!(host = %host, address = %addr, "Resolved node address");
                return Ok(addr.to_string());
            }
        }

        let fallback = host.rsplit_once('@').map_or(host, |(_, h)| h);
        let fallback = fallback.split(':').next().unwrap_or(fallback);
        warn!(host = %host, address = %fallback, "Using configured host as node address");
        Ok(fallback.to_string())
    }

    /// (Re)create the node container on `host`.
    ///
    /// # Errors
    /// Returns a [`ClusterError`] if the container cannot be started.
    #[instrument(skip(self))]
    pub async fn start_node(
        &self,
        host: &str,
        address: &str,
        seed_address: &str,
        node_name: &str,
        volume_name: &str,
    ) -> Result<(), ClusterError> {
        let script = start_node_script(self.config, address, seed_address, node_name, volume_name);
        self.exec
            .execute_script(host, &script, &[], self.timeout())
            .await?
            .into_checked(host, "docker run")?;
        info!(host = %host, node = %node_name, seed = %seed_address, "Started node");
        Ok(())
    }

    /// Poll until the node answers CQL, at most `max_attempts` times.
    ///
    /// # Errors
    /// Returns [`ClusterError::ReadinessTimeout`] when attempts run out.
    #[instrument(skip(self, interval))]
    pub async fn wait_for_ready(
        &self,
        host: &str,
        node: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<u32, ClusterError> {
        let cmd = format!(
            "docker exec {} cqlsh -e 'DESCRIBE KEYSPACES'",
            shell_escape(node)
        );
        for attempt in 1..=max_attempts {
            match self.exec.execute(host, &cmd, self.timeout()).await {
                Ok(output) if output.success() => {
                    info!(host = %host, node = %node, attempt, "Node ready");
                    return Ok(attempt);
                }
                Ok(output) => {
                    debug!(host = %host, node = %node, attempt, exit_code = output.exit_code, "Node not ready yet");
                }
                Err(e) => {
                    debug!(host = %host, node = %node, attempt, error = %e, "Readiness probe error");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(ClusterError::ReadinessTimeout {
            host: host.to_string(),
            node: node.to_string(),
            attempts: max_attempts,
        })
    }

    /// Create keyspace and table if they do not exist.
    ///
    /// # Errors
    /// Returns a [`ClusterError`] if the CQL statements fail.
    #[instrument(skip(self, schema))]
    pub async fn ensure_schema(
        &self,
        host: &str,
        node: &str,
        schema: &SchemaConfig,
    ) -> Result<(), ClusterError> {
        let cql = schema_cql(schema);
        let cmd = format!(
            "docker exec {} cqlsh -e {}",
            shell_escape(node),
            shell_escape(&cql)
        );
        self.exec.execute_checked(host, &cmd, self.timeout()).await?;
        info!(host = %host, keyspace = %schema.keyspace, table = %schema.table, "Schema ensured");
        Ok(())
    }

    /// Check that every unit's container is running.
    ///
    /// # Errors
    /// Returns [`ClusterError::UnitMissing`] (or the remote error) for the
    /// first unit that is not running.
    pub async fn verify_units(&self, units: &[WorkloadUnit]) -> Result<(), ClusterError> {
        let summary = self
            .fleet
            .run("verify_units", units.to_vec(), |unit| async move {
                let cmd = format!(
                    "docker inspect --format '{{{{.State.Running}}}}' {}",
                    shell_escape(&unit.name)
                );
                let output = self.exec.execute(&unit.host, &cmd, self.timeout()).await?;
                if output.success() && output.stdout.trim() == "true" {
                    Ok(())
                } else {
                    Err(ClusterError::UnitMissing {
                        host: unit.host.clone(),
                        unit: unit.name.clone(),
                    })
                }
            })
            .await;
        first_failure(summary.into_all().map(|_| ()))
    }

    /// Full bring-up: runtime, addresses, seed first, then the rest, then
    /// schema on the seed.
    ///
    /// # Errors
    /// Returns the first [`ClusterError`] hit by any step.
    pub async fn bring_up(&self) -> Result<Vec<WorkloadUnit>, ClusterError> {
        self.config.validate_for_bringup()?;
        let hosts = self.config.cluster.hosts.clone();
        let units = WorkloadUnit::from_config(self.config);
        info!(hosts = hosts.len(), "Bringing up cluster");

        let runtime = self
            .fleet
            .run("ensure_runtime", hosts.clone(), |host| async move {
                self.ensure_runtime_ready(&host).await
            })
            .await;
        first_failure(runtime.into_all())?;

        let resolved = self
            .fleet
            .run("resolve_address", hosts.clone(), |host| async move {
                self.resolve_address(&host).await
            })
            .await;
        let addresses: Vec<String> = first_failure(resolved.into_all())?
            .into_iter()
            .map(|(_, addr)| addr)
            .collect();

        let seed_address = addresses[0].clone();
        let attempts = self.config.cluster.ready_attempts;
        let interval = self.config.ready_interval();

        let seed = &units[0];
        self.start_node(
            &seed.host,
            &seed_address,
            &seed_address,
            &seed.name,
            &self.config.volume_name(0),
        )
        .await?;
        self.wait_for_ready(&seed.host, &seed.name, attempts, interval)
            .await?;

        let others: Vec<usize> = (1..units.len()).collect();
        let started = self
            .fleet
            .run("start_nodes", others, |index| {
                let unit = &units[index];
                let address = &addresses[index];
                let seed_address = &seed_address;
                async move {
                    self.start_node(
                        &unit.host,
                        address,
                        seed_address,
                        &unit.name,
                        &self.config.volume_name(index),
                    )
                    .await?;
                    self.wait_for_ready(&unit.host, &unit.name, attempts, interval)
                        .await
                }
            })
            .await;
        first_failure(started.into_all())?;

        if self.config.cluster.skip_schema {
            info!("Skipping schema creation");
        } else {
            self.ensure_schema(&seed.host, &seed.name, &self.config.schema)
                .await?;
        }

        info!(nodes = units.len(), seed = %seed_address, "Cluster ready");
        Ok(units)
    }
}

fn first_failure<T, M>(result: Result<T, Vec<(M, ClusterError)>>) -> Result<T, ClusterError> {
    result.map_err(|failures| {
        failures
            .into_iter()
            .map(|(_, e)| e)
            .next()
            .unwrap_or_else(|| ClusterError::ParseError {
                host: String::new(),
                detail: "step failed without an error".to_string(),
            })
    })
}

/// Shell script that replaces any same-named container and starts a node
#[must_use]
pub fn start_node_script(
    config: &CampaignConfig,
    address: &str,
    seed_address: &str,
    node_name: &str,
    volume_name: &str,
) -> String {
    let name = shell_escape(node_name);
    format!(
        "docker rm -f {name} >/dev/null 2>&1 || true\n\
         docker run -d --name {name} --network host \\\n  \
         -v {volume}:/var/lib/cassandra \\\n  \
         -e CASSANDRA_CLUSTER_NAME={cluster} \\\n  \
         -e CASSANDRA_SEEDS={seed} \\\n  \
         -e CASSANDRA_LISTEN_ADDRESS={addr} \\\n  \
         -e CASSANDRA_BROADCAST_ADDRESS={addr} \\\n  \
         -e CASSANDRA_RPC_ADDRESS=0.0.0.0 \\\n  \
         -e CASSANDRA_BROADCAST_RPC_ADDRESS={addr} \\\n  \
         {image}\n",
        volume = shell_escape(volume_name),
        cluster = shell_escape(&config.cluster.cluster_name),
        seed = shell_escape(seed_address),
        addr = shell_escape(address),
        image = shell_escape(&config.cluster.image),
    )
}

/// CQL creating the keyspace and the YCSB table
#[must_use]
pub fn schema_cql(schema: &SchemaConfig) -> String {
    let fields: Vec<String> = (0..FIELD_COUNT).map(|i| format!("field{i} varchar")).collect();
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {ks} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': {rf}}}; \
         CREATE TABLE IF NOT EXISTS {ks}.{table} (y_id varchar PRIMARY KEY, {fields});",
        ks = schema.keyspace,
        rf = schema.replication_factor,
        table = schema.table,
        fields = fields.join(", "),
    )
}
