use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::config::Config;

#[derive(Parser)]
#[command(name = "rkp", version, about = "RK8s NFS volume provisioner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the provisioner daemon
    Start(StartArgs),
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// YAML config file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// NFS server address
    #[arg(long)]
    pub server: Option<String>,
    /// Exported directory on the NFS server
    #[arg(long)]
    pub server_path: Option<PathBuf>,
    /// Local mount point of the export
    #[arg(long)]
    pub mount_path: Option<PathBuf>,
    /// Provisioner name served by this instance
    #[arg(long)]
    pub provisioner: Option<String>,
    /// Run leader election so several replicas can be deployed
    #[arg(long)]
    pub leader_election: bool,
    /// Leader election identity, defaults to a random one
    #[arg(long)]
    pub identity: Option<String>,
    /// Number of reconcile workers
    #[arg(long)]
    pub workers: Option<usize>,
    /// Use a process local store instead of Xline
    #[arg(long)]
    pub in_memory: bool,
}

impl StartArgs {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(server) = &self.server {
            cfg.nfs.server = server.clone();
        }
        if let Some(path) = &self.server_path {
            cfg.nfs.server_path = path.clone();
        }
        if let Some(path) = &self.mount_path {
            cfg.nfs.mount_path = path.clone();
        }
        if let Some(provisioner) = &self.provisioner {
            cfg.provisioner = provisioner.clone();
        }
        if self.leader_election {
            cfg.leader_election.enabled = true;
        }
        if let Some(identity) = &self.identity {
            cfg.leader_election.identity = Some(identity.clone());
        }
        if let Some(workers) = self.workers {
            cfg.controller.workers = workers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "rkp",
            "start",
            "--server",
            "10.0.0.9",
            "--server-path",
            "/srv/nfs",
            "--leader-election",
            "--workers",
            "8",
        ]);
        let Commands::Start(args) = cli.command;
        assert!(args.config.is_none());
        assert!(!args.in_memory);

        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.nfs.server, "10.0.0.9");
        assert_eq!(cfg.nfs.server_path, PathBuf::from("/srv/nfs"));
        assert_eq!(cfg.nfs.mount_path, PathBuf::from("/mount"));
        assert!(cfg.leader_election.enabled);
        assert_eq!(cfg.controller.workers, 8);
    }
}
