//! Hardware facts.
//!
//! A vendored shell probe runs on the remote host and emits `key=value`
//! lines from a fixed key set. The parsed map lands in Machine status and,
//! canonically rendered, becomes the content of `hardwareFacts` file
//! injections, so rendering must be deterministic.

use std::collections::BTreeMap;

/// Shell probe executed on the remote host. POSIX sh only; every line of
/// output is `key=value`, unknown values are omitted rather than guessed.
pub const PROBE_SCRIPT: &str = r#"#!/bin/sh
set -u

emit() {
    [ -n "$2" ] && printf '%s=%s\n' "$1" "$2"
}

if [ -r /etc/os-release ]; then
    . /etc/os-release
    emit os.name "${PRETTY_NAME:-${NAME:-}}"
    emit os.id "${ID:-}"
fi
emit kernel.version "$(uname -r)"
emit architecture "$(uname -m)"
emit hostname "$(hostname 2>/dev/null)"

if [ -r /proc/uptime ]; then
    emit uptime.days "$(awk '{printf "%d", $1/86400}' /proc/uptime)"
fi

if [ -r /proc/cpuinfo ]; then
    emit cpu.model "$(awk -F': ' '/model name/{print $2; exit}' /proc/cpuinfo)"
    emit cpu.cores "$(grep -c ^processor /proc/cpuinfo)"
fi

if [ -r /proc/meminfo ]; then
    emit memory.mb "$(awk '/MemTotal/{printf "%d", $2/1024}' /proc/meminfo)"
fi

if command -v systemd-detect-virt >/dev/null 2>&1; then
    emit virtualization.type "$(systemd-detect-virt 2>/dev/null || echo none)"
fi

if command -v docker >/dev/null 2>&1; then
    emit container.engine docker
elif command -v podman >/dev/null 2>&1; then
    emit container.engine podman
fi

[ -r /sys/class/dmi/id/product_serial ] && \
    emit system.serial "$(cat /sys/class/dmi/id/product_serial 2>/dev/null)"
[ -r /sys/class/dmi/id/product_uuid ] && \
    emit system.uuid "$(cat /sys/class/dmi/id/product_uuid 2>/dev/null)"
[ -e /etc/localtime ] && \
    emit system.timezone "$(readlink /etc/localtime 2>/dev/null | sed 's|.*/zoneinfo/||')"

for disk in /sys/block/*; do
    name=$(basename "$disk")
    case "$name" in
        loop*|ram*|zram*) continue ;;
    esac
    size=$(cat "$disk/size" 2>/dev/null)
    [ -n "$size" ] && emit "disk.$name" "$((size * 512 / 1024 / 1024))mb"
done

for iface in /sys/class/net/*; do
    name=$(basename "$iface")
    [ "$name" = lo ] && continue
    addr=$(cat "$iface/address" 2>/dev/null)
    emit "interface.$name" "$addr"
done
"#;

/// Keys the probe may emit with a fixed name.
pub const FIXED_KEYS: &[&str] = &[
    "os.name",
    "os.id",
    "kernel.version",
    "architecture",
    "hostname",
    "uptime.days",
    "cpu.model",
    "cpu.cores",
    "memory.mb",
    "virtualization.type",
    "container.engine",
    "system.serial",
    "system.uuid",
    "system.timezone",
];

/// Parse probe output into the canonical fact map.
///
/// Unknown fixed-form keys are dropped; `disk.<name>` and
/// `interface.<name>` entries are kept as-is. Malformed lines are ignored.
pub fn parse(output: &str) -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let accepted = FIXED_KEYS.contains(&key)
            || key.starts_with("disk.")
            || key.starts_with("interface.");
        if accepted {
            facts.insert(key.to_string(), value.to_string());
        }
    }
    facts
}

/// Render the fact map as sorted `key=value` lines, each `\n`-terminated.
/// This is the byte content of a `hardwareFacts` file injection.
pub fn render_canonical(facts: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in facts {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_and_prefixed_keys() {
        let output = "\
os.name=NixOS 24.05 (Uakari)
os.id=nixos
kernel.version=6.6.32
architecture=x86_64
cpu.cores=8
memory.mb=32042
disk.sda=476940mb
interface.eth0=52:54:00:aa:bb:cc
bogus line
unknown.key=dropped
";
        let facts = parse(output);
        assert_eq!(facts.get("os.id").map(String::as_str), Some("nixos"));
        assert_eq!(facts.get("cpu.cores").map(String::as_str), Some("8"));
        assert_eq!(
            facts.get("disk.sda").map(String::as_str),
            Some("476940mb")
        );
        assert_eq!(
            facts.get("interface.eth0").map(String::as_str),
            Some("52:54:00:aa:bb:cc")
        );
        assert!(!facts.contains_key("unknown.key"));
    }

    #[test]
    fn empty_values_are_omitted() {
        let facts = parse("os.id=\ncpu.cores=4\n");
        assert!(!facts.contains_key("os.id"));
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn canonical_rendering_is_sorted_and_newline_terminated() {
        let mut facts = BTreeMap::new();
        facts.insert("os.id".to_string(), "nixos".to_string());
        facts.insert("architecture".to_string(), "x86_64".to_string());
        let rendered = render_canonical(&facts);
        assert_eq!(rendered, "architecture=x86_64\nos.id=nixos\n");
    }

    #[test]
    fn rendering_round_trips_through_parse() {
        let facts = parse("cpu.cores=8\nos.id=nixos\n");
        assert_eq!(parse(&render_canonical(&facts)), facts);
    }
}
