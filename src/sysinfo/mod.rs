#![forbid(unsafe_code)]

//! Read-only system information blocks built from procfs/sysfs reads.
//! Anything that needs a real process (package queries, flatpak) goes
//! through the engine instead.

use std::collections::BTreeMap;

#[must_use]
pub fn parse_key_value_lines(body: &str, separator: char) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in body.lines() {
        if let Some((key, value)) = line.split_once(separator) {
            out.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    out
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn cpu_info() -> Vec<String> {
    let cpuinfo = read_proc("/proc/cpuinfo");
    let max_khz = read_freq("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq");
    let min_khz = read_freq("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_min_freq");
    render_cpu_info(&cpuinfo, max_khz, min_khz)
}

fn read_freq(path: &str) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

#[must_use]
pub fn render_cpu_info(cpuinfo: &str, max_khz: Option<u64>, min_khz: Option<u64>) -> Vec<String> {
    let fields = parse_key_value_lines(cpuinfo, ':');
    let processors = cpuinfo
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count();
    let cores: u64 = fields
        .get("cpu cores")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let siblings: u64 = fields
        .get("siblings")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let threads_per_core = if cores > 0 && siblings > 0 {
        siblings / cores
    } else {
        1
    };

    let mut out = Vec::new();
    if let Some(model) = fields.get("model name") {
        out.push(format!("Model: {model}"));
    }
    out.push(format!("Processors: {processors}"));
    out.push(format!("Physical Cores: {cores}"));
    out.push(format!("Threads per Core: {threads_per_core}"));
    if let Some(mhz) = fields.get("cpu MHz").and_then(|v| v.parse::<f64>().ok()) {
        out.push(format!("Current Frequency: {mhz:.2} MHz"));
    }
    if let Some(khz) = max_khz {
        out.push(format!("Max Frequency: {:.2} MHz", khz as f64 / 1000.0));
    }
    if let Some(khz) = min_khz {
        out.push(format!("Min Frequency: {:.2} MHz", khz as f64 / 1000.0));
    }
    out
}

pub fn memory_info() -> Vec<String> {
    render_memory_info(&read_proc("/proc/meminfo"))
}

#[must_use]
pub fn render_memory_info(meminfo: &str) -> Vec<String> {
    let kb = meminfo_kb(meminfo);
    let mb = |key: &str| kb.get(key).copied().unwrap_or(0) / 1024;

    let total = mb("MemTotal");
    let free = mb("MemFree");
    let available = kb
        .get("MemAvailable")
        .or_else(|| kb.get("MemFree"))
        .copied()
        .unwrap_or(0)
        / 1024;
    let used = total.saturating_sub(available);
    let percent = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let mut out = vec![
        format!("Total Memory: {total} MB ({} GB)", total / 1024),
        format!("Used Memory: {used} MB ({} GB)", used / 1024),
        format!("Free Memory: {free} MB ({} GB)", free / 1024),
        format!("Available Memory: {available} MB ({} GB)", available / 1024),
        format!("Memory Usage: {percent:.1}%"),
        String::new(),
        format!("Buffers: {} MB", mb("Buffers")),
        format!("Cached: {} MB", mb("Cached")),
        format!("Shared Memory: {} MB", mb("Shmem")),
        format!("Slab Reclaimable: {} MB", mb("SReclaimable")),
    ];

    let active = mb("Active");
    let inactive = mb("Inactive");
    if active > 0 || inactive > 0 {
        out.push(String::new());
        out.push(format!("Active: {active} MB"));
        out.push(format!("Inactive: {inactive} MB"));
    }
    out
}

pub fn swap_info() -> Vec<String> {
    let swappiness = read_proc("/proc/sys/vm/swappiness");
    render_swap_info(&read_proc("/proc/meminfo"), swappiness.trim())
}

#[must_use]
pub fn render_swap_info(meminfo: &str, swappiness: &str) -> Vec<String> {
    let kb = meminfo_kb(meminfo);
    let mb = |key: &str| kb.get(key).copied().unwrap_or(0) / 1024;

    let total = mb("SwapTotal");
    let free = mb("SwapFree");
    let used = total.saturating_sub(free);
    let percent = if total > 0 {
        used as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let mut out = vec![
        format!("Total Swap: {total} MB ({} GB)", total / 1024),
        format!("Used Swap: {used} MB ({} GB)", used / 1024),
        format!("Free Swap: {free} MB ({} GB)", free / 1024),
        format!("Cached Swap: {} MB", mb("SwapCached")),
        format!("Swap Usage: {percent:.1}%"),
    ];
    if !swappiness.is_empty() {
        out.push(String::new());
        out.push(format!("Swappiness: {swappiness}"));
    }
    out
}

pub fn kernel_info() -> Vec<String> {
    render_kernel_info(
        read_proc("/proc/sys/kernel/osrelease").trim(),
        read_proc("/proc/sys/kernel/version").trim(),
        read_proc("/proc/sys/kernel/hostname").trim(),
        &read_proc("/etc/os-release"),
        read_proc("/proc/uptime").trim(),
    )
}

#[must_use]
pub fn render_kernel_info(
    release: &str,
    version: &str,
    hostname: &str,
    os_release: &str,
    uptime: &str,
) -> Vec<String> {
    let mut out = vec![
        format!("Kernel Release: {release}"),
        format!("Kernel Version: {version}"),
        format!("Architecture: {}", std::env::consts::ARCH),
        format!("Hostname: {hostname}"),
    ];

    let distro = parse_key_value_lines(os_release, '=');
    let field = |key: &str| {
        distro
            .get(key)
            .map_or("Unknown".to_owned(), |v| v.trim_matches('"').to_owned())
    };
    if !distro.is_empty() {
        out.push(String::new());
        out.push(format!("Distribution: {}", field("NAME")));
        out.push(format!("Distribution ID: {}", field("ID")));
        out.push(format!("Version: {}", field("VERSION")));
        out.push(format!("Pretty Name: {}", field("PRETTY_NAME")));
    }

    if let Some(seconds) = uptime
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
    {
        let total = seconds as u64;
        out.push(String::new());
        out.push(format!(
            "System Uptime: {}d {}h {}m",
            total / 86_400,
            (total % 86_400) / 3600,
            (total % 3600) / 60
        ));
    }
    out
}

pub fn disk_info() -> Vec<String> {
    render_disk_info(
        &read_proc("/proc/mounts"),
        &read_proc("/proc/partitions"),
        usage_for,
    )
}

/// Capacity figures for one mounted filesystem, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_mb: u64,
    pub available_mb: u64,
}

#[cfg(unix)]
fn usage_for(mountpoint: &str) -> Option<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(mountpoint).ok()?;
    let frsize = stat.fragment_size() as u64;
    Some(DiskUsage {
        total_mb: stat.blocks() as u64 * frsize / (1024 * 1024),
        available_mb: stat.blocks_available() as u64 * frsize / (1024 * 1024),
    })
}

#[cfg(not(unix))]
fn usage_for(_mountpoint: &str) -> Option<DiskUsage> {
    None
}

/// Mounted real devices with their usage, then the kernel's block device
/// list. `usage` is injected so the parsing stays testable without live
/// mounts.
#[must_use]
pub fn render_disk_info(
    mounts: &str,
    partitions: &str,
    usage: impl Fn(&str) -> Option<DiskUsage>,
) -> Vec<String> {
    let mut out = Vec::new();

    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mountpoint), Some(fstype)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        match usage(mountpoint) {
            Some(u) => {
                let used = u.total_mb.saturating_sub(u.available_mb);
                let percent = if u.total_mb > 0 {
                    used as f64 / u.total_mb as f64 * 100.0
                } else {
                    0.0
                };
                out.push(format!(
                    "{device} on {mountpoint} ({fstype}): {used}/{} MB used ({percent:.1}%)",
                    u.total_mb
                ));
            }
            None => out.push(format!("{device} on {mountpoint} ({fstype})")),
        }
    }

    let mut devices = Vec::new();
    for line in partitions.lines().skip(2) {
        let mut parts = line.split_whitespace();
        let (_major, _minor, blocks, name) =
            (parts.next(), parts.next(), parts.next(), parts.next());
        if let (Some(blocks), Some(name)) = (blocks.and_then(|b| b.parse::<u64>().ok()), name) {
            // /proc/partitions counts 1 KiB blocks.
            devices.push(format!("/dev/{name}: {} MB", blocks / 1024));
        }
    }
    if !devices.is_empty() {
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push("Block Devices:".to_owned());
        out.append(&mut devices);
    }

    out
}

fn meminfo_kb(meminfo: &str) -> BTreeMap<String, u64> {
    parse_key_value_lines(meminfo, ':')
        .into_iter()
        .filter_map(|(k, v)| {
            let kb = v.split_whitespace().next()?.parse::<u64>().ok()?;
            Some((k, kb))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16384000 kB\n\
                           MemFree:         4096000 kB\n\
                           MemAvailable:    8192000 kB\n\
                           Buffers:          512000 kB\n\
                           Cached:          2048000 kB\n\
                           SwapTotal:       8192000 kB\n\
                           SwapFree:        6144000 kB\n\
                           SwapCached:        10240 kB\n\
                           Shmem:            102400 kB\n\
                           SReclaimable:     204800 kB\n";

    #[test]
    fn key_value_parser_trims_both_sides() {
        let parsed = parse_key_value_lines("model name\t: AMD Ryzen 7\nflags: fpu vme\n", ':');
        assert_eq!(
            parsed.get("model name").map(String::as_str),
            Some("AMD Ryzen 7")
        );
        assert_eq!(parsed.get("flags").map(String::as_str), Some("fpu vme"));
    }

    #[test]
    fn cpu_block_counts_processors_and_topology() {
        let cpuinfo = "processor\t: 0\nmodel name\t: Test CPU\ncpu MHz\t\t: 2400.000\n\
                       cpu cores\t: 4\nsiblings\t: 8\nprocessor\t: 1\n";
        let out = render_cpu_info(cpuinfo, Some(4_800_000), Some(400_000));
        assert!(out.contains(&"Model: Test CPU".to_owned()));
        assert!(out.contains(&"Processors: 2".to_owned()));
        assert!(out.contains(&"Physical Cores: 4".to_owned()));
        assert!(out.contains(&"Threads per Core: 2".to_owned()));
        assert!(out.contains(&"Max Frequency: 4800.00 MHz".to_owned()));
    }

    #[test]
    fn memory_block_reports_usage_from_available() {
        let out = render_memory_info(MEMINFO);
        assert!(out.contains(&"Total Memory: 16000 MB (15 GB)".to_owned()));
        assert!(out.contains(&"Used Memory: 8000 MB (7 GB)".to_owned()));
        assert!(out.contains(&"Memory Usage: 50.0%".to_owned()));
    }

    #[test]
    fn swap_block_handles_zero_swap() {
        let out = render_swap_info("SwapTotal: 0 kB\nSwapFree: 0 kB\n", "60");
        assert!(out.contains(&"Total Swap: 0 MB (0 GB)".to_owned()));
        assert!(out.contains(&"Swap Usage: 0.0%".to_owned()));
        assert!(out.contains(&"Swappiness: 60".to_owned()));
    }

    #[test]
    fn disk_block_lists_real_mounts_and_block_devices() {
        let mounts = "proc /proc proc rw 0 0\n\
                      /dev/nvme0n1p2 / ext4 rw,relatime 0 0\n\
                      tmpfs /tmp tmpfs rw 0 0\n\
                      /dev/sda1 /data xfs rw 0 0\n";
        let partitions = "major minor  #blocks  name\n\n\
                          259        0  500107608 nvme0n1\n\
                          259        2  498595840 nvme0n1p2\n";

        let out = render_disk_info(mounts, partitions, |mountpoint| match mountpoint {
            "/" => Some(DiskUsage {
                total_mb: 1000,
                available_mb: 250,
            }),
            _ => None,
        });

        assert_eq!(
            out[0],
            "/dev/nvme0n1p2 on / (ext4): 750/1000 MB used (75.0%)"
        );
        assert_eq!(out[1], "/dev/sda1 on /data (xfs)");
        assert!(out.contains(&"Block Devices:".to_owned()));
        assert!(out.contains(&"/dev/nvme0n1: 488386 MB".to_owned()));
        // Pseudo-filesystems never show up.
        assert!(!out.iter().any(|l| l.contains("tmpfs") || l.contains("proc")));
    }

    #[test]
    fn kernel_block_includes_distro_and_uptime() {
        let out = render_kernel_info(
            "6.8.0-test",
            "#1 SMP",
            "devbox",
            "NAME=\"Debian GNU/Linux\"\nID=debian\nPRETTY_NAME=\"Debian 12\"\n",
            "93784.12 180000.00",
        );
        assert!(out.contains(&"Kernel Release: 6.8.0-test".to_owned()));
        assert!(out.contains(&"Distribution: Debian GNU/Linux".to_owned()));
        assert!(out.contains(&"System Uptime: 1d 2h 3m".to_owned()));
    }
}
