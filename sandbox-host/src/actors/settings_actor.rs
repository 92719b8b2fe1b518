//! Settings Poller Actor
//!
//! Fetches the global allowed-module list from the backend at startup and on
//! every interval. A changed list replaces the shared default and is handed
//! to the installer. A failed poll keeps the previous list and is retried on
//! the next tick.

use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::installer_actor::InstallerMsg;
use crate::tool_execution::SharedDefaultModules;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("settings request failed: {0}")]
    Request(String),
    #[error("settings endpoint returned HTTP {0}")]
    Status(u16),
    #[error("settings response has no allowed module list")]
    Malformed,
}

/// Accepts either a bare JSON array of names or `{"allowed_modules": [...]}`.
pub fn parse_allowed_modules(body: &Value) -> Option<Vec<String>> {
    let list = match body {
        Value::Array(list) => list,
        Value::Object(map) => map.get("allowed_modules")?.as_array()?,
        _ => return None,
    };
    let mut seen = HashSet::new();
    let mut modules = Vec::with_capacity(list.len());
    for item in list {
        let name = item.as_str()?.trim();
        if !name.is_empty() && seen.insert(name.to_string()) {
            modules.push(name.to_string());
        }
    }
    Some(modules)
}

pub struct SettingsPollerActor {
    http: reqwest::Client,
    url: String,
    interval: Duration,
    default_modules: SharedDefaultModules,
    installer_tx: mpsc::Sender<InstallerMsg>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SettingsPollerActor {
    pub fn new(
        backend_url: &str,
        interval: Duration,
        request_timeout: Duration,
        default_modules: SharedDefaultModules,
        installer_tx: mpsc::Sender<InstallerMsg>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, PollError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PollError::Request(e.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}/sandbox/settings", backend_url.trim_end_matches('/')),
            interval,
            default_modules,
            installer_tx,
            shutdown_rx,
        })
    }

    /// Poll until shutdown is signalled
    pub async fn run(mut self) {
        tracing::info!(url = %self.url, interval_secs = self.interval.as_secs(), "settings poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "settings poll failed; keeping previous module list");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("settings poller stopped");
    }

    /// Fetch once; returns whether the default module list changed
    pub async fn poll_once(&self) -> Result<bool, PollError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PollError::Request(e.without_url().to_string()))?;
        if !response.status().is_success() {
            return Err(PollError::Status(response.status().as_u16()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| PollError::Request(e.without_url().to_string()))?;
        let modules = parse_allowed_modules(&body).ok_or(PollError::Malformed)?;

        {
            let mut current = self.default_modules.write().await;
            if *current == modules {
                return Ok(false);
            }
            *current = modules.clone();
        }
        tracing::info!(modules = modules.len(), "default allowed modules updated");

        if let Err(e) = self.installer_tx.try_send(InstallerMsg::Provision {
            modules,
            respond_to: None,
        }) {
            tracing::warn!(error = %e, "could not queue package provisioning");
        }
        Ok(true)
    }
}
