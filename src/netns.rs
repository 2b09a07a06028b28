//! Per-job network isolation: bridge
//! creation, veth pair allocation, per-job IP assignment, and the
//! namespace join performed from inside the child before execve.
//!
//! Rather than speak netlink directly, this shells out to the `ip`
//! command: a subprocess call is the low-ceremony way to drive a kernel
//! facility that the project has no other reason to link a netlink crate
//! for.

use std::net::Ipv4Addr;
use std::process::Command;

use crate::errors::{JobletError, Result};
use crate::model::{Network, NetworkAllocation};

/// Ensure the named bridge exists with the given CIDR's gateway address,
/// creating it if absent. Idempotent: safe to call once per job.
pub fn ensure_bridge(network: &Network) -> Result<()> {
    if bridge_exists(&network.bridge_name)? {
        return Ok(());
    }
    run_ip(&["link", "add", "name", &network.bridge_name, "type", "bridge"])?;
    run_ip(&["link", "set", &network.bridge_name, "up"])?;
    run_ip(&[
        "addr",
        "add",
        &format!("{}/{}", network.gateway, prefix_len(&network.cidr)?),
        "dev",
        &network.bridge_name,
    ])?;
    Ok(())
}

fn bridge_exists(name: &str) -> Result<bool> {
    let status = Command::new("ip")
        .args(["link", "show", name])
        .status()
        .map_err(|e| JobletError::isolation_setup(format!("exec ip link show: {e}")).with_source(e))?;
    Ok(status.success())
}

/// Create a veth pair, move the guest end into the job's network
/// namespace (identified by `netns_pid`), assign `ip` to it, and attach
/// the host end to the bridge.
pub fn attach_job(
    network: &Network,
    netns_pid: i32,
    ip: Ipv4Addr,
    veth_host: &str,
    veth_guest: &str,
) -> Result<()> {
    run_ip(&[
        "link", "add", veth_host, "type", "veth", "peer", "name", veth_guest,
    ])?;
    run_ip(&["link", "set", veth_host, "master", &network.bridge_name])?;
    run_ip(&["link", "set", veth_host, "up"])?;
    run_ip(&["link", "set", veth_guest, "netns", &netns_pid.to_string()])?;
    run_ip(&[
        "netns",
        "exec",
        &netns_pid.to_string(),
        "ip",
        "addr",
        "add",
        &format!("{}/{}", ip, prefix_len(&network.cidr)?),
        "dev",
        veth_guest,
    ])?;
    run_ip(&[
        "netns", "exec", &netns_pid.to_string(), "ip", "link", "set", veth_guest, "up",
    ])?;
    run_ip(&[
        "netns", "exec", &netns_pid.to_string(), "ip", "route", "add", "default", "via",
        &network.gateway.to_string(),
    ])?;
    Ok(())
}

pub fn detach_job(veth_host: &str) -> Result<()> {
    // Removing the host end also removes its peer inside the namespace.
    run_ip(&["link", "del", veth_host]).or_else(|e| {
        // Already gone (namespace exit cleans these up too) is not an error.
        if e.message.contains("Cannot find device") {
            Ok(())
        } else {
            Err(e)
        }
    })
}

/// The simplest possible per-job IP allocator: derive a host octet from
/// the job's low byte range within the network's `/24`. Collisions are
/// prevented by the caller tracking allocations in the State Store.
pub fn next_ip(network: &Network, host_octet: u8) -> Result<Ipv4Addr> {
    let base = network
        .cidr
        .split('/')
        .next()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| JobletError::validation(format!("invalid network cidr '{}'", network.cidr)))?;
    let octets = base.octets();
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], host_octet))
}

fn prefix_len(cidr: &str) -> Result<&str> {
    cidr.split('/')
        .nth(1)
        .ok_or_else(|| JobletError::validation(format!("cidr '{cidr}' missing prefix length")))
}

/// Join a namespace by fd, used from inside the child process during
/// `src/init.rs`'s two-phase startup.
pub fn join_namespace(fd: std::os::unix::io::RawFd) -> Result<()> {
    let rc = unsafe { libc::setns(fd, libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(JobletError::isolation_setup(format!(
            "setns(CLONE_NEWNET) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| JobletError::isolation_setup(format!("exec ip {args:?}: {e}")).with_source(e))?;
    if !output.status.success() {
        return Err(JobletError::isolation_setup(format!(
            "ip {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[allow(dead_code)]
pub struct PendingAllocation {
    pub allocation: NetworkAllocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_ip_stays_within_network_prefix() {
        let net = Network {
            name: "bridge0".into(),
            cidr: "10.200.0.0/24".into(),
            bridge_name: "jbr0".into(),
            gateway: "10.200.0.1".into(),
        };
        let ip = next_ip(&net, 42).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 200, 0, 42));
    }

    #[test]
    fn prefix_len_extracts_suffix() {
        assert_eq!(prefix_len("10.0.0.0/24").unwrap(), "24");
        assert!(prefix_len("10.0.0.0").is_err());
    }
}
