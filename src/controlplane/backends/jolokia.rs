//! Jolokia node management client
//!
//! Talks to the JMX-over-HTTP agent running in each Cassandra pod. Every call
//! is a single POST of a `read` or `exec` request to `/jolokia/`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::ports::{MembershipMode, NodeManagementClient, UpgradeSSTablesOptions};
use crate::error::{Error, Result};

const STORAGE_SERVICE: &str = "org.apache.cassandra.db:type=StorageService";
const COMPACTION_MANAGER: &str = "org.apache.cassandra.db:type=CompactionManager";
const STREAM_MANAGER: &str = "org.apache.cassandra.net:type=StreamManager";

/// Keyspaces owned by the node itself, never cleaned up
const LOCAL_KEYSPACES: &[&str] = &["system", "system_schema"];

/// Jolokia client configuration
#[derive(Debug, Clone)]
pub struct JolokiaConfig {
    pub port: u16,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for JolokiaConfig {
    fn default() -> Self {
        Self {
            port: 8778,
            timeout: Duration::from_secs(10),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JolokiaRequest<'a> {
    Read {
        mbean: &'a str,
        attribute: &'a str,
    },
    Exec {
        mbean: &'a str,
        operation: &'a str,
        arguments: Vec<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct JolokiaResponse {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// [`NodeManagementClient`] backed by Jolokia
pub struct JolokiaClient {
    http: Client,
    config: JolokiaConfig,
}

impl JolokiaClient {
    pub fn new(config: JolokiaConfig) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, host: &str) -> String {
        format!("http://{}:{}/jolokia/", host, self.config.port)
    }

    async fn call(&self, host: &str, request: &JolokiaRequest<'_>) -> Result<Value> {
        let mut builder = self.http.post(self.url(host)).json(request);
        if let Some(user) = &self.config.username {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(Error::ManagementEndpoint {
                host: host.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let body: JolokiaResponse = response.json().await?;
        match body.error.filter(|e| !e.is_empty()) {
            Some(error) => Err(Error::ManagementEndpoint {
                host: host.to_string(),
                reason: error,
            }),
            None => Ok(body.value),
        }
    }

    async fn read(&self, host: &str, mbean: &str, attribute: &str) -> Result<Value> {
        self.call(host, &JolokiaRequest::Read { mbean, attribute }).await
    }

    async fn exec(
        &self,
        host: &str,
        mbean: &str,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Result<Value> {
        debug!(host = %host, operation = %operation, "Jolokia exec");
        self.call(
            host,
            &JolokiaRequest::Exec {
                mbean,
                operation,
                arguments,
            },
        )
        .await
    }

    async fn keyspaces(&self, host: &str) -> Result<Vec<String>> {
        let value = self.read(host, STORAGE_SERVICE, "Keyspaces").await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A keyspace has data in `dc` when one of its token ranges has an endpoint there
    async fn keyspace_in_datacenter(&self, host: &str, keyspace: &str, dc: &str) -> Result<bool> {
        let ranges = self
            .exec(host, STORAGE_SERVICE, "describeRingJMX", vec![json!(keyspace)])
            .await?;
        let ranges: Vec<String> = serde_json::from_value(ranges)?;
        let needle = format!("datacenter:{}", dc);
        Ok(ranges.iter().any(|r| r.contains(&needle)))
    }

    async fn has_compactions_of(&self, host: &str, task_type: &str) -> Result<bool> {
        let value = self.read(host, COMPACTION_MANAGER, "Compactions").await?;
        Ok(compactions_include(&value, task_type))
    }

    async fn node_list_not_empty(&self, host: &str, attribute: &str) -> Result<bool> {
        let value = self.read(host, STORAGE_SERVICE, attribute).await?;
        Ok(value.as_array().is_some_and(|nodes| !nodes.is_empty()))
    }
}

/// Running compactions contain one of type `task_type`
fn compactions_include(value: &Value, task_type: &str) -> bool {
    value.as_array().is_some_and(|compactions| {
        compactions
            .iter()
            .any(|c| c.get("taskType").and_then(Value::as_str) == Some(task_type))
    })
}

fn is_local_keyspace(keyspace: &str) -> bool {
    LOCAL_KEYSPACES.contains(&keyspace)
}

#[async_trait]
impl NodeManagementClient for JolokiaClient {
    async fn membership_mode(&self, host: &str) -> Result<MembershipMode> {
        let value = self.read(host, STORAGE_SERVICE, "OperationMode").await?;
        Ok(value
            .as_str()
            .map(MembershipMode::parse)
            .unwrap_or(MembershipMode::Unknown))
    }

    async fn decommission(&self, host: &str, new_signature: bool) -> Result<()> {
        info!(host = %host, "Decommissioning node");
        if new_signature {
            self.exec(host, STORAGE_SERVICE, "decommission(boolean)", vec![json!(false)])
                .await?;
        } else {
            self.exec(host, STORAGE_SERVICE, "decommission", vec![]).await?;
        }
        Ok(())
    }

    async fn cleanup(&self, host: &str) -> Result<()> {
        for keyspace in self.non_local_keyspaces(host, None).await? {
            info!(host = %host, keyspace = %keyspace, "Cleaning up keyspace");
            self.exec(
                host,
                STORAGE_SERVICE,
                "forceKeyspaceCleanup(java.lang.String,[Ljava.lang.String;)",
                vec![json!(keyspace), json!([])],
            )
            .await?;
        }
        Ok(())
    }

    async fn upgrade_sstables(&self, host: &str, options: UpgradeSSTablesOptions) -> Result<()> {
        for keyspace in self.keyspaces(host).await? {
            info!(host = %host, keyspace = %keyspace, "Upgrading sstables");
            self.exec(
                host,
                STORAGE_SERVICE,
                "upgradeSSTables(java.lang.String,boolean,int,[Ljava.lang.String;)",
                vec![
                    json!(keyspace),
                    json!(options.exclude_current_version),
                    json!(options.jobs),
                    json!([]),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn rebuild(&self, host: &str, source_dc: &str) -> Result<()> {
        info!(host = %host, source_dc = %source_dc, "Rebuilding node");
        self.exec(
            host,
            STORAGE_SERVICE,
            "rebuild(java.lang.String)",
            vec![json!(source_dc)],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, host: &str, host_id: &str) -> Result<()> {
        info!(host = %host, host_id = %host_id, "Removing node");
        self.exec(host, STORAGE_SERVICE, "removeNode", vec![json!(host_id)])
            .await?;
        Ok(())
    }

    async fn non_local_keyspaces(&self, host: &str, datacenter: Option<&str>) -> Result<Vec<String>> {
        let mut keyspaces = Vec::new();
        for keyspace in self.keyspaces(host).await? {
            if is_local_keyspace(&keyspace) {
                continue;
            }
            if let Some(dc) = datacenter {
                if !self.keyspace_in_datacenter(host, &keyspace, dc).await? {
                    continue;
                }
            }
            keyspaces.push(keyspace);
        }
        Ok(keyspaces)
    }

    async fn host_id_map(&self, host: &str) -> Result<HashMap<String, String>> {
        let value = self.read(host, STORAGE_SERVICE, "HostIdMap").await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn has_cleanup_compactions(&self, host: &str) -> Result<bool> {
        self.has_compactions_of(host, "Cleanup").await
    }

    async fn has_upgrade_sstables_compactions(&self, host: &str) -> Result<bool> {
        self.has_compactions_of(host, "Upgrade sstables").await
    }

    async fn has_streaming_sessions(&self, host: &str) -> Result<bool> {
        let value = self.read(host, STREAM_MANAGER, "CurrentStreams").await?;
        Ok(value.as_array().is_some_and(|streams| !streams.is_empty()))
    }

    async fn has_leaving_nodes(&self, host: &str) -> Result<bool> {
        self.node_list_not_empty(host, "LeavingNodes").await
    }

    async fn has_joining_nodes(&self, host: &str) -> Result<bool> {
        self.node_list_not_empty(host, "JoiningNodes").await
    }
}
