//! Connecting a tab to a coordinator

use std::fmt;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::environment::Environment;
use super::stub::ClientStub;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorHandle, ExecutorScript};
use crate::transport::{OriginPolicy, Port, TransportKind};

/// How a tab reached its coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectMode {
    /// One coordinator in a process shared by every tab
    Shared,
    /// One coordinator per tab; callbacks relayed and master elected over the broadcast channel
    Compat,
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectMode::Shared => f.write_str("shared"),
            ConnectMode::Compat => f.write_str("compat"),
        }
    }
}

/// A tab's live connection
pub struct Connection {
    client: ClientStub,
    coordinator: CoordinatorHandle,
    mode: ConnectMode,
}

impl Connection {
    pub fn client(&self) -> &ClientStub {
        &self.client
    }

    /// The coordinator this tab talks to (its own instance in compat mode)
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn mode(&self) -> ConnectMode {
        self.mode
    }

    /// Close the tab; in compat mode its coordinator instance stops too
    pub async fn close(self) -> Result<()> {
        debug!(client_id = %self.client.client_id(), mode = %self.mode, "Connection::close: called");
        self.client.shutdown().await;
        if self.mode == ConnectMode::Compat {
            self.coordinator.shutdown().await?;
        }
        Ok(())
    }
}

/// Connect a tab using the richest primitive `env` offers
///
/// A shared host is used unless it is missing or `transport.force-compat`
/// is set; otherwise the tab starts its own coordinator instance.
pub async fn connect(env: &Environment, script: &dyn ExecutorScript, config: &Config) -> Result<Connection> {
    let policy = OriginPolicy::new(env.origin());
    let start = |relay: bool| {
        Coordinator::new(
            config.coordinator.clone(),
            policy.clone(),
            env.channel().clone(),
            env.events().clone(),
        )
        .with_relay(relay)
        .start(script)
    };

    let (coordinator, mode, via) = match env.shared_host() {
        Some(host) if !config.transport.force_compat => (
            host.coordinator(|| start(false)),
            ConnectMode::Shared,
            TransportKind::MessagePort,
        ),
        _ => (start(true), ConnectMode::Compat, TransportKind::DedicatedWorker),
    };

    let client_id = Uuid::now_v7().to_string();
    let (to_coordinator, coordinator_rx) = Port::pair(via);
    let (to_client, client_rx) = Port::pair(via);
    coordinator
        .attach(&client_id, to_client, coordinator_rx)
        .await
        .context("Failed to attach to coordinator")?;

    let client = ClientStub::spawn(&client_id, to_coordinator, client_rx, policy, config.coordinator.client_buffer);
    info!(%client_id, %mode, instance_id = %coordinator.instance_id(), "Tab connected");

    Ok(Connection {
        client,
        coordinator,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{MethodRegistry, StartupHook};
    use serde_json::{Value, json};

    struct Echo;

    async fn echo(args: Vec<Value>) -> eyre::Result<Value> {
        Ok(Value::Array(args))
    }

    impl ExecutorScript for Echo {
        fn install(&self, methods: &mut MethodRegistry, _coordinator: CoordinatorHandle) -> StartupHook {
            methods.register_fn("echo", echo);
            Box::new(|_| {})
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.coordinator.election_window_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_tabs_share_one_coordinator() {
        let env = Environment::new("https://site.example");
        let config = fast_config();
        let a = connect(&env, &Echo, &config).await.unwrap();
        let b = connect(&env, &Echo, &config).await.unwrap();

        assert_eq!(a.mode(), ConnectMode::Shared);
        assert_eq!(a.coordinator().instance_id(), b.coordinator().instance_id());
        assert_eq!(b.client().invoke("echo", vec![json!(1)]).await.unwrap(), json!([1]));
    }

    #[tokio::test]
    async fn test_fallback_without_shared_host() {
        let env = Environment::without_shared_worker("https://site.example");
        let config = fast_config();
        let a = connect(&env, &Echo, &config).await.unwrap();
        let b = connect(&env, &Echo, &config).await.unwrap();

        assert_eq!(a.mode(), ConnectMode::Compat);
        assert_ne!(a.coordinator().instance_id(), b.coordinator().instance_id());

        let masters = [
            a.coordinator().wait_for_election().await.unwrap(),
            b.coordinator().wait_for_election().await.unwrap(),
        ];
        assert_eq!(masters.iter().filter(|m| **m).count(), 1);
        assert_eq!(a.client().invoke("echo", vec![]).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_force_compat() {
        let env = Environment::new("https://site.example");
        let mut config = fast_config();
        config.transport.force_compat = true;
        let conn = connect(&env, &Echo, &config).await.unwrap();
        assert_eq!(conn.mode(), ConnectMode::Compat);
        assert!(!env.shared_host().unwrap().is_started());
        conn.close().await.unwrap();
    }
}
