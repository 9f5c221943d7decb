//! Bringing a topology up and down: `rigup up`.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use rigup::PathCategory;
use rigup::topology::{Registry, Topology};
use rigup::Cluster;

/// Parse `--keep`: comma-separated categories, or `none`.
pub fn parse_keep(keep: &str) -> Result<Vec<PathCategory>> {
    keep.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "none")
        .map(|s| s.parse::<PathCategory>())
        .collect()
}

pub async fn cmd_up(topology_path: &Path, timeout: u64, keep: &str, hold: bool) -> Result<()> {
    let keep = parse_keep(keep)?;
    let topology = Topology::load(topology_path)?;
    let mut cluster = topology.build(&Registry::builtin())?;

    if let Err(e) = bring_up(&mut cluster, Duration::from_secs(timeout)).await {
        error!(cluster = %cluster.name(), error = %e, "Bring-up failed: tearing down");
        cluster.stop(true).await;
        cluster.cleanup(&keep);
        return Err(e);
    }

    println!();
    println!("Cluster {} is operational", cluster.name());
    println!("Instance directory: {}", cluster.instance_path().display());
    for app in cluster.apps() {
        match app.pid() {
            Some(pid) => println!("  {} pid {}", app, pid),
            None => println!("  {}", app),
        }
    }
    println!();

    if hold {
        println!("Press Ctrl-C to stop the cluster");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!(cluster = %cluster.name(), "Interrupted");
    }

    cluster.stop(true).await;
    cluster.cleanup(&keep);
    println!("Cluster {} stopped", cluster.name());
    Ok(())
}

async fn bring_up(cluster: &mut Cluster, timeout: Duration) -> Result<()> {
    cluster.deploy().await.context("Deploy failed")?;
    cluster.start(Some(timeout)).await.context("Start failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_parsing() {
        assert_eq!(
            parse_keep("perm,log").unwrap(),
            vec![PathCategory::Permanent, PathCategory::Log]
        );
        assert!(parse_keep("none").unwrap().is_empty());
        assert!(parse_keep("").unwrap().is_empty());
        assert!(parse_keep("perm,junk").is_err());
    }
}
