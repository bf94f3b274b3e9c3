//! Reboot and repair queue manipulation.
//!
//! The CLI never dequeues an in-flight entry itself: cancelling or deleting
//! marks the entry and the leader removes it once it is safe. Every change is
//! a compare-and-swap against the revision read, so a concurrent write by the
//! leader is re-read instead of overwritten.

use anyhow::Result;
use chrono::Utc;
use cke_core::cluster::Cluster;
use cke_core::reboot::{RebootQueueEntry, RebootStatus};
use cke_core::repair::RepairQueueEntry;
use cke_core::{Error, is_conflicted, is_not_found};
use cke_storage::Storage;
use tracing::debug;

use crate::context::find_node;

/// Queue each listed node (address or node name) for reboot.
///
/// Every name is checked against the cluster before anything is written;
/// names already queued, or repeated in `names`, are skipped.
pub async fn add_reboot_entries(storage: &Storage, cluster: &Cluster, names: &[String]) -> Result<Vec<RebootQueueEntry>> {
    let mut addrs = Vec::new();
    for name in names {
        let addr = find_node(cluster, name)?.address.clone();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    let queued: Vec<String> = storage
        .get_reboot_entries()
        .await?
        .into_iter()
        .filter(|e| e.status != RebootStatus::Cancelled)
        .map(|e| e.node)
        .collect();

    let mut added = Vec::new();
    for addr in addrs.into_iter().filter(|a| !queued.contains(a)) {
        let mut entry = RebootQueueEntry::new(&addr);
        storage.register_reboot_entry(&mut entry).await?;
        added.push(entry);
    }
    Ok(added)
}

/// Node names from a reboot list: one per line, `#` starts a comment.
pub fn parse_node_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

const UPDATE_ATTEMPTS: usize = 5;

fn no_such_entry(queue: &str, index: i64, e: anyhow::Error) -> anyhow::Error {
    if is_not_found(&e) {
        Error::bad_request(format!("{queue} queue entry {index} does not exist")).into()
    } else {
        e
    }
}

/// Apply `change` to the stored entry, re-reading when the leader wrote it
/// in between. `change` returns false to leave the entry alone.
async fn modify_reboot_entry(
    storage: &Storage,
    index: i64,
    change: impl Fn(&mut RebootQueueEntry) -> bool,
) -> Result<bool> {
    for _ in 0..UPDATE_ATTEMPTS {
        let mut entry = storage.get_reboot_entry(index).await?;
        if !change(&mut entry) {
            return Ok(false);
        }
        match storage.update_reboot_entry(None, &entry).await {
            Ok(()) => return Ok(true),
            Err(e) if is_conflicted(&e) => debug!(index, "reboot entry changed, retrying"),
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflicted(format!("reboot queue entry {index} keeps changing")).into())
}

pub async fn cancel_reboot_entry(storage: &Storage, index: i64) -> Result<()> {
    let now = Utc::now();
    modify_reboot_entry(storage, index, |e| {
        e.transition(RebootStatus::Cancelled, now);
        true
    })
    .await
    .map_err(|e| no_such_entry("reboot", index, e))?;
    Ok(())
}

/// Cancel every entry; returns how many were cancelled.
pub async fn cancel_all_reboot_entries(storage: &Storage) -> Result<usize> {
    let now = Utc::now();
    let mut n = 0;
    for entry in storage.get_reboot_entries().await? {
        if entry.status == RebootStatus::Cancelled {
            continue;
        }
        let cancel = |e: &mut RebootQueueEntry| {
            if e.status == RebootStatus::Cancelled {
                return false;
            }
            e.transition(RebootStatus::Cancelled, now);
            true
        };
        match modify_reboot_entry(storage, entry.index, cancel).await {
            Ok(true) => n += 1,
            Ok(false) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

pub async fn reset_reboot_backoff(storage: &Storage) -> Result<()> {
    for entry in storage.get_reboot_entries().await? {
        let reset = |e: &mut RebootQueueEntry| {
            e.reset_backoff();
            true
        };
        match modify_reboot_entry(storage, entry.index, reset).await {
            Err(e) if !is_not_found(&e) => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

/// Queue a repair of the machine at `address`.
pub async fn add_repair_entry(
    storage: &Storage,
    cluster: Option<&Cluster>,
    operation: &str,
    machine_type: &str,
    address: &str,
    serial: &str,
) -> Result<RepairQueueEntry> {
    if address.parse::<std::net::IpAddr>().is_err() {
        return Err(Error::bad_request(format!("invalid address: {address}")).into());
    }
    if operation.is_empty() || machine_type.is_empty() {
        return Err(Error::bad_request("operation and machine type must not be empty").into());
    }
    let mut entry = RepairQueueEntry::new(operation, machine_type, address, serial);
    if let Some(cluster) = cluster {
        entry.fill_nodename(cluster);
    }
    storage.register_repair_entry(&mut entry).await?;
    Ok(entry)
}

async fn modify_repair_entry(
    storage: &Storage,
    index: i64,
    change: impl Fn(&mut RepairQueueEntry) -> bool,
) -> Result<bool> {
    for _ in 0..UPDATE_ATTEMPTS {
        let mut entry = storage.get_repair_entry(index).await?;
        if !change(&mut entry) {
            return Ok(false);
        }
        match storage.update_repair_entry(None, &entry).await {
            Ok(()) => return Ok(true),
            Err(e) if is_conflicted(&e) => debug!(index, "repair entry changed, retrying"),
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflicted(format!("repair queue entry {index} keeps changing")).into())
}

fn mark_deleted(e: &mut RepairQueueEntry) -> bool {
    if e.deleted {
        return false;
    }
    e.deleted = true;
    true
}

pub async fn delete_repair_entry(storage: &Storage, index: i64) -> Result<()> {
    modify_repair_entry(storage, index, mark_deleted)
        .await
        .map_err(|e| no_such_entry("repair", index, e))?;
    Ok(())
}

/// Remove finished entries outright; returns how many.
pub async fn delete_finished_repair_entries(storage: &Storage) -> Result<usize> {
    let mut n = 0;
    for entry in storage.get_repair_entries().await? {
        if entry.has_finished() {
            storage.delete_repair_entry(None, entry.index).await?;
            n += 1;
        }
    }
    Ok(n)
}

/// Mark unfinished entries for deletion by the leader; returns how many.
pub async fn delete_unfinished_repair_entries(storage: &Storage) -> Result<usize> {
    let mut n = 0;
    for entry in storage.get_repair_entries().await? {
        if entry.has_finished() || entry.deleted {
            continue;
        }
        let mark = |e: &mut RepairQueueEntry| !e.has_finished() && mark_deleted(e);
        match modify_repair_entry(storage, entry.index, mark).await {
            Ok(true) => n += 1,
            Ok(false) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

pub async fn reset_repair_backoff(storage: &Storage) -> Result<()> {
    for entry in storage.get_repair_entries().await? {
        let reset = |e: &mut RepairQueueEntry| {
            e.reset_backoff();
            true
        };
        match modify_repair_entry(storage, entry.index, reset).await {
            Err(e) if !is_not_found(&e) => return Err(e),
            _ => {}
        }
    }
    Ok(())
}
