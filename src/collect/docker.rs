//! Container adapter driving the `docker` CLI

use super::types::{ContainerDetails, ContainerSummary, LogOptions};
use super::{LineStream, LogSource, ResourceInspector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;

/// Log source, inspector and lifecycle control through the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Run a docker subcommand to completion and return its stdout
    async fn output(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Collection(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Collection(format!(
                "{} {} failed: {}",
                self.bin,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn start(&self, target: &str) -> Result<()> {
        self.output(&["start", target]).await.map(|_| ())
    }

    pub async fn stop(&self, target: &str) -> Result<()> {
        self.output(&["stop", target]).await.map(|_| ())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl LogSource for DockerCli {
    async fn follow(
        &self,
        target: &str,
        options: &LogOptions,
        cancel: CancellationToken,
    ) -> Result<LineStream> {
        let tail = options.tail.to_string();
        let mut args = vec!["logs", "--tail", tail.as_str()];
        if options.follow {
            args.push("--follow");
        }
        if options.timestamps {
            args.push("--timestamps");
        }
        args.push(target);

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Collection(format!("failed to run {} logs: {}", self.bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Collection("docker logs stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Collection("docker logs stderr unavailable".to_string()))?;

        // Containers write to both; interleave them as they arrive
        let mut lines = futures::stream::select(raw_lines(stdout), raw_lines(stderr));

        let target = target.to_string();
        let stream = async_stream::try_stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = lines.next() => Some(next),
                };
                match next {
                    None => break,
                    Some(Some(line)) => {
                        let line = line?;
                        yield line;
                    }
                    Some(None) => {
                        let status = child.wait().await.map_err(Error::from)?;
                        if !status.success() {
                            Err::<(), Error>(Error::Collection(format!(
                                "docker logs for {} exited with {}",
                                target, status
                            )))?;
                        }
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}

/// Split a pipe on newlines without requiring UTF-8.
///
/// Container output is arbitrary bytes; invalid sequences become U+FFFD
/// instead of ending the stream.
fn raw_lines<R>(reader: R) -> impl futures::Stream<Item = Result<String>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(reader, AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec())).map(|chunk| {
        chunk
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\r')
                    .to_string()
            })
            .map_err(|e| Error::Collection(format!("docker logs read failed: {}", e)))
    })
}

#[async_trait]
impl ResourceInspector for DockerCli {
    async fn describe(&self, target: &str) -> Result<ContainerDetails> {
        let raw = self
            .output(&["inspect", "--type", "container", target])
            .await?;
        let parsed: Vec<Value> = serde_json::from_str(&raw)?;
        parsed
            .first()
            .map(details_from_inspect)
            .ok_or_else(|| Error::Collection(format!("no such container: {}", target)))
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let raw = self
            .output(&["ps", "--all", "--no-trunc", "--format", "{{json .}}"])
            .await?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                let row: PsRow = serde_json::from_str(l)?;
                Ok(row.into())
            })
            .collect()
    }
}

/// One line of `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    status: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ports: String,
    #[serde(default)]
    created_at: String,
}

impl From<PsRow> for ContainerSummary {
    fn from(row: PsRow) -> Self {
        Self {
            id: row.id,
            name: row.names.split(',').next().unwrap_or_default().to_string(),
            image: row.image,
            status: row.status,
            state: row.state,
            ports: row
                .ports
                .split(", ")
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            created: row.created_at,
        }
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn details_from_inspect(value: &Value) -> ContainerDetails {
    let state = str_at(value, "/State/Status").to_string();
    let status = if value.pointer("/State/Running").and_then(Value::as_bool) == Some(true) {
        format!("Up since {}", str_at(value, "/State/StartedAt"))
    } else {
        let code = value
            .pointer("/State/ExitCode")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        format!("Exited ({})", code)
    };

    let mut ports = Vec::new();
    if let Some(bindings) = value.pointer("/NetworkSettings/Ports").and_then(Value::as_object) {
        for (container_port, hosts) in bindings {
            match hosts.as_array() {
                Some(hosts) if !hosts.is_empty() => {
                    for host in hosts {
                        ports.push(format!(
                            "{}:{}->{}",
                            str_at(host, "/HostIp"),
                            str_at(host, "/HostPort"),
                            container_port
                        ));
                    }
                }
                _ => ports.push(container_port.clone()),
            }
        }
    }
    ports.sort();

    // Default bridge address, else the first attached network
    let mut ip_address = str_at(value, "/NetworkSettings/IPAddress").to_string();
    if ip_address.is_empty() {
        if let Some(networks) = value
            .pointer("/NetworkSettings/Networks")
            .and_then(Value::as_object)
        {
            ip_address = networks
                .values()
                .map(|n| str_at(n, "/IPAddress"))
                .find(|ip| !ip.is_empty())
                .unwrap_or_default()
                .to_string();
        }
    }

    let labels: BTreeMap<String, String> = value
        .pointer("/Config/Labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();

    ContainerDetails {
        id: str_at(value, "/Id").to_string(),
        name: str_at(value, "/Name").trim_start_matches('/').to_string(),
        image: str_at(value, "/Config/Image").to_string(),
        status,
        state,
        ports,
        created: str_at(value, "/Created").to_string(),
        ip_address,
        pid: value
            .pointer("/State/Pid")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        labels,
    }
}
