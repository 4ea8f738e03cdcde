//! `nixos-operator known-hosts`: the admin procedure for the pinned
//! host-key store. Clearing a host is the only sanctioned way to recover
//! from a HostKeyMismatch condition.

use anyhow::Result;
use colored::Colorize;

use crate::config;
use crate::known_hosts::KnownHosts;

pub fn list() -> Result<()> {
    let config = config::load()?;
    let store = KnownHosts::open(config.known_hosts_path)?;
    let entries = store.entries();

    if entries.is_empty() {
        println!("{} no pinned host keys", "::".blue().bold());
        return Ok(());
    }
    println!("{}", "pinned host keys".bold());
    for (host, key_type) in entries {
        println!("  {} {}", host, key_type.dimmed());
    }
    Ok(())
}

pub fn clear(host: &str) -> Result<()> {
    let config = config::load()?;
    let store = KnownHosts::open(config.known_hosts_path)?;
    let removed = store.clear(host)?;

    if removed == 0 {
        println!("{} no pinned keys for {}", "!!".yellow().bold(), host);
    } else {
        println!(
            "{} removed {} pinned key(s) for {}",
            "ok".green().bold(),
            removed,
            host
        );
        println!(
            "{} the next connection will re-pin the host key (trust on first use)",
            "::".blue().bold()
        );
    }
    Ok(())
}
