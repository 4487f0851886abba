use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::message::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single node from the cluster config.
    Node(NodeArgs),
    /// Run every node of the cluster config inside this process.
    Cluster(ClusterArgs),
    /// Check a shared audit log for overlapping critical sections.
    Audit(AuditArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Path to the cluster config (JSON).
    #[arg(long)]
    pub config: PathBuf,

    /// Id of the node to run; must appear in the config.
    #[arg(long)]
    pub id: NodeId,
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Path to the cluster config (JSON).
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    /// Shared audit log written by a finished run.
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_command() {
        let cli = Cli::try_parse_from(["lamport_mutex", "node", "--config", "c.json", "--id", "3"])
            .expect("valid args");
        match cli.command {
            Command::Node(args) => {
                assert_eq!(args.id, 3);
                assert_eq!(args.config, PathBuf::from("c.json"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_audit_command() {
        let cli =
            Cli::try_parse_from(["lamport_mutex", "audit", "shared.log"]).expect("valid args");
        match cli.command {
            Command::Audit(args) => assert_eq!(args.path, PathBuf::from("shared.log")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_node_requires_id() {
        assert!(Cli::try_parse_from(["lamport_mutex", "node", "--config", "c.json"]).is_err());
    }
}
