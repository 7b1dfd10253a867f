//! Sampling script and parsers
//!
//! One exec per tick runs a fixed battery of reads, each section delimited by
//! an `===NAME===` marker. CPU% and network rates are deltas between two
//! samples; the first sample reports the since-boot CPU average and zero
//! network rate.

use std::collections::{BTreeSet, HashMap};

use super::types::{DiskUsage, MemoryUsage, MetricsData, NetworkRate, ServiceStatus, SystemInfo};
use crate::error::CoreError;

const BASE_COMMAND: &str = "echo '===UPTIME==='; uptime -p 2>/dev/null; \
echo '===STAT==='; head -1 /proc/stat 2>/dev/null; \
echo '===MEMINFO==='; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo 2>/dev/null; \
echo '===DISK==='; df -hP / 2>/dev/null; \
echo '===OS==='; grep '^PRETTY_NAME=' /etc/os-release 2>/dev/null; \
echo '===KERNEL==='; uname -r 2>/dev/null; \
echo '===ARCH==='; uname -m 2>/dev/null; \
echo '===CPUINFO==='; grep -m1 'model name' /proc/cpuinfo 2>/dev/null; \
echo '===NETDEV==='; cat /proc/net/dev 2>/dev/null; \
echo '===SERVICES==='; ";

/// Unit names are interpolated into the shell command, so only this charset passes
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-'))
}

/// The full sampling command for one host
pub fn build_command(services: &BTreeSet<String>) -> String {
    let mut command = String::from(BASE_COMMAND);
    for name in services.iter().filter(|n| is_valid_service_name(n)) {
        command.push_str(&format!(
            "echo \"{name}=$(systemctl is-active {name} 2>/dev/null)\"; "
        ));
    }
    command.push_str("echo '===END==='");
    command
}

/// Raw CPU counters from /proc/stat
#[derive(Debug, Clone, Default, PartialEq)]
struct CpuSnapshot {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuSnapshot {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn active(&self) -> u64 {
        self.total()
            .saturating_sub(self.idle)
            .saturating_sub(self.iowait)
    }
}

/// Raw network counters from /proc/net/dev
#[derive(Debug, Clone, Default, PartialEq)]
struct NetSnapshot {
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Counters kept between ticks for delta calculations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counters {
    cpu: CpuSnapshot,
    net: Option<NetSnapshot>,
}

/// Parse one sample.
///
/// `elapsed_secs` is the time since `prev` was taken. Output without CPU and
/// memory sections (a non-Linux host, a broken shell) is a protocol error.
pub fn parse_sample(
    output: &str,
    services: &BTreeSet<String>,
    prev: Option<&Counters>,
    elapsed_secs: f64,
) -> Result<(MetricsData, Counters), CoreError> {
    let cpu = parse_cpu_snapshot(output)
        .ok_or_else(|| CoreError::Protocol("missing /proc/stat in sample output".to_string()))?;
    let (mem_used, mem_total) = parse_meminfo(output)
        .ok_or_else(|| CoreError::Protocol("missing /proc/meminfo in sample output".to_string()))?;
    let net = parse_net_snapshot(output);

    let cpu_percent = match prev {
        Some(prev) => {
            let total = cpu.total().saturating_sub(prev.cpu.total());
            let active = cpu.active().saturating_sub(prev.cpu.active());
            percent(active, total)
        }
        None => percent(cpu.active(), cpu.total()),
    };

    let network = match (&net, prev.and_then(|p| p.net.as_ref())) {
        (Some(curr), Some(prev_net)) if elapsed_secs > 0.0 => NetworkRate {
            rx: kb_per_sec(curr.rx_bytes.saturating_sub(prev_net.rx_bytes), elapsed_secs),
            tx: kb_per_sec(curr.tx_bytes.saturating_sub(prev_net.tx_bytes), elapsed_secs),
        },
        _ => NetworkRate::default(),
    };

    let data = MetricsData {
        uptime: first_line(output, "UPTIME").unwrap_or_default(),
        cpu: cpu_percent,
        memory: MemoryUsage {
            used: mem_used / 1024,
            total: mem_total / 1024,
        },
        disk: parse_disk(output).unwrap_or_default(),
        system: SystemInfo {
            os: parse_os_name(output).unwrap_or_default(),
            kernel: first_line(output, "KERNEL").unwrap_or_default(),
            arch: first_line(output, "ARCH").unwrap_or_default(),
            cpu: parse_cpu_model(output).unwrap_or_default(),
        },
        network,
        services: parse_services(output, services),
    };

    Ok((data, Counters { cpu, net }))
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round1(part as f64 / whole as f64 * 100.0)
}

fn kb_per_sec(bytes: u64, secs: f64) -> f64 {
    round1(bytes as f64 / 1024.0 / secs)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ─── Parsers ──────────────────────────────────────────────────────────────

/// Extract section between markers
fn extract_section<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    let start_marker = format!("==={}===", marker);
    let start = output.find(&start_marker)?;
    let rest = &output[start + start_marker.len()..];
    let end = rest.find("===").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn first_line(output: &str, marker: &str) -> Option<String> {
    let line = extract_section(output, marker)?.lines().next()?.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// /proc/stat first line → CpuSnapshot
fn parse_cpu_snapshot(output: &str) -> Option<CpuSnapshot> {
    let line = extract_section(output, "STAT")?.lines().next()?;
    if !line.starts_with("cpu ") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    Some(CpuSnapshot {
        user: parts[1].parse().ok()?,
        nice: parts[2].parse().ok()?,
        system: parts[3].parse().ok()?,
        idle: parts[4].parse().ok()?,
        iowait: parts[5].parse().ok()?,
        irq: parts[6].parse().ok()?,
        softirq: parts[7].parse().ok()?,
        steal: parts[8].parse().ok()?,
    })
}

/// /proc/meminfo → (used_kb, total_kb)
fn parse_meminfo(output: &str) -> Option<(u64, u64)> {
    let section = extract_section(output, "MEMINFO")?;
    let mut total_kb = None;
    let mut available_kb = None;

    for line in section.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = extract_kb_value(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = extract_kb_value(line);
        }
    }

    let total = total_kb?;
    Some((total.saturating_sub(available_kb?), total))
}

/// "MemTotal:    1234 kB" → 1234
fn extract_kb_value(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// `df -hP /` → size, used, use%
fn parse_disk(output: &str) -> Option<DiskUsage> {
    let section = extract_section(output, "DISK")?;
    let parts: Vec<&str> = section
        .lines()
        .filter(|line| !line.starts_with("Filesystem"))
        .last()?
        .split_whitespace()
        .collect();
    if parts.len() < 6 {
        return None;
    }
    Some(DiskUsage {
        used: parts[2].to_string(),
        total: parts[1].to_string(),
        percent: parts[4].to_string(),
    })
}

/// PRETTY_NAME="Ubuntu 22.04.3 LTS" → Ubuntu 22.04.3 LTS
fn parse_os_name(output: &str) -> Option<String> {
    let line = first_line(output, "OS")?;
    let value = line.strip_prefix("PRETTY_NAME=")?;
    Some(value.trim_matches('"').to_string())
}

/// "model name	: Intel(R) Xeon(R) ..." → Intel(R) Xeon(R) ...
fn parse_cpu_model(output: &str) -> Option<String> {
    let line = first_line(output, "CPUINFO")?;
    let (_, model) = line.split_once(':')?;
    Some(model.trim().to_string())
}

/// /proc/net/dev → aggregate counters, loopback excluded
fn parse_net_snapshot(output: &str) -> Option<NetSnapshot> {
    let section = extract_section(output, "NETDEV")?;
    let mut total_rx: u64 = 0;
    let mut total_tx: u64 = 0;
    let mut found = false;

    for line in section.lines() {
        let line = line.trim();
        // Header lines contain |
        if line.contains('|') || line.is_empty() {
            continue;
        }
        if let Some((iface, rest)) = line.split_once(':') {
            if iface.trim() == "lo" {
                continue;
            }
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 9 {
                if let (Ok(rx), Ok(tx)) = (parts[0].parse::<u64>(), parts[8].parse::<u64>()) {
                    total_rx += rx;
                    total_tx += tx;
                    found = true;
                }
            }
        }
    }

    found.then_some(NetSnapshot {
        rx_bytes: total_rx,
        tx_bytes: total_tx,
    })
}

/// "nginx=active" lines, reported in the order of `services`
fn parse_services(output: &str, services: &BTreeSet<String>) -> Vec<ServiceStatus> {
    let reported: HashMap<&str, &str> = extract_section(output, "SERVICES")
        .map(|section| {
            section
                .lines()
                .filter_map(|line| line.trim().split_once('='))
                .collect()
        })
        .unwrap_or_default();

    services
        .iter()
        .map(|name| {
            let status = if !is_valid_service_name(name) {
                "invalid".to_string()
            } else {
                match reported.get(name.as_str()).map(|s| s.trim()) {
                    Some(s) if !s.is_empty() => s.to_string(),
                    _ => "unknown".to_string(),
                }
            };
            ServiceStatus {
                name: name.clone(),
                status,
            }
        })
        .collect()
}
