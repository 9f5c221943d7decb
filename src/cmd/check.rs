//! Topology validation: `rigup check`.

use anyhow::Result;
use std::path::Path;

use rigup::topology::{Registry, Topology};

pub fn cmd_check(topology_path: &Path) -> Result<()> {
    let topology = Topology::load(topology_path)?;
    let cluster = topology.build(&Registry::builtin())?;

    println!();
    println!(
        "Cluster {} (instance {}): {} app(s)",
        cluster.name(),
        cluster.instance(),
        cluster.apps().len()
    );
    println!();

    for app in cluster.apps() {
        let ctx = app.context();
        let mut flags = Vec::new();
        if !ctx.autostart {
            flags.push("manual");
        }
        if !ctx.do_cleanup {
            flags.push("no-cleanup");
        }
        if flags.is_empty() {
            println!("{}", app);
        } else {
            println!("{} [{}]", app, flags.join(", "));
        }

        let mut entries: Vec<_> = app.config().iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in entries {
            println!("  {:<20} {}", key, value);
        }
        for cmd in ctx.deferred_commands() {
            println!("  {:<20} {}", "(post start)", cmd);
        }
        println!();
    }

    // Construction created sandboxes; a check leaves nothing behind.
    cluster.purge();

    println!("Topology OK");
    Ok(())
}
