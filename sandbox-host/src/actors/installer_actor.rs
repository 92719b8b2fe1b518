//! Installer Actor - Serialized package provisioning
//!
//! Provisioning requests arrive from host startup and from the settings
//! poller. They are processed one at a time so two batches never run pip into
//! the package directory concurrently. The most recent report is published on
//! a watch channel for `/packages`.

use tokio::sync::{mpsc, oneshot, watch};

use crate::installer::{InstallReport, PackageInstaller};

/// Messages for the Installer Actor
pub enum InstallerMsg {
    /// Install every third-party module among `modules`
    Provision {
        modules: Vec<String>,
        respond_to: Option<oneshot::Sender<InstallReport>>,
    },
}

pub struct InstallerActor {
    msg_rx: mpsc::Receiver<InstallerMsg>,
    installer: PackageInstaller,
    report_tx: watch::Sender<Option<InstallReport>>,
}

impl InstallerActor {
    pub fn new(
        msg_rx: mpsc::Receiver<InstallerMsg>,
        installer: PackageInstaller,
        report_tx: watch::Sender<Option<InstallReport>>,
    ) -> Self {
        Self {
            msg_rx,
            installer,
            report_tx,
        }
    }

    /// Run until every sender is dropped
    pub async fn run(mut self) {
        tracing::info!(dir = ?self.installer.packages_dir(), "installer actor started");

        while let Some(msg) = self.msg_rx.recv().await {
            match msg {
                InstallerMsg::Provision { modules, respond_to } => {
                    let report = self.installer.install(&modules).await;
                    tracing::info!(
                        requested = modules.len(),
                        third_party = report.records.len(),
                        "provisioning finished"
                    );
                    self.report_tx.send_replace(Some(report.clone()));
                    if let Some(tx) = respond_to {
                        let _ = tx.send(report);
                    }
                }
            }
        }

        tracing::info!("installer actor stopped");
    }
}
