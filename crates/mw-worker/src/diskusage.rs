//! Disk usage probe backing the cleanup loop's aggressive-retention mode
//! (§4.7) and the health loop's disk-free alert (§4.8).

use std::path::Path;
use sysinfo::Disks;

/// Percentage of space used on the disk that `path` lives on, matching the
/// mount point with the longest prefix of `path` (falls back to `/` when no
/// disk claims a more specific mount point). Returns `None` when the disk
/// list can't be read or the matched disk reports zero total space.
pub fn used_percent(path: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&Path, u64, u64)> = None;

    for disk in disks.list() {
        let mount_point = disk.mount_point();
        if path.starts_with(mount_point) {
            let is_longer_match = best.map(|(current, _, _)| mount_point.as_os_str().len() > current.as_os_str().len()).unwrap_or(true);
            if is_longer_match {
                best = Some((mount_point, disk.total_space(), disk.available_space()));
            }
        }
    }

    let (_, total, available) = best?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some((used as f64 / total as f64) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_percent_returns_some_for_root() {
        let result = used_percent(Path::new("/"));
        if let Some(percent) = result {
            assert!((0.0..=100.0).contains(&percent));
        }
    }
}
