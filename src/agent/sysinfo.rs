use tracing::info;

use crate::config::ConcurrencyConfig;

/// Available RAM in MB, from /proc/meminfo MemAvailable.
#[cfg(target_os = "linux")]
pub fn available_ram_mb() -> u64 {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
pub fn available_ram_mb() -> u64 {
    0
}

/// The development concurrency to actually use. With adaptive mode on, the
/// configured value is reduced to what available RAM can carry, floored at
/// one agent.
pub fn effective_concurrency(concurrency: &ConcurrencyConfig) -> usize {
    let configured = concurrency.development.max(1);

    if !concurrency.adaptive {
        return configured;
    }

    let min_ram = if concurrency.min_ram_per_agent_mb > 0 {
        concurrency.min_ram_per_agent_mb
    } else {
        512
    };

    let available = available_ram_mb();
    if available == 0 {
        info!(configured, "Could not determine available RAM; using configured concurrency");
        return configured;
    }

    let max_by_ram = ((available / min_ram) as usize).max(1);
    if max_by_ram < configured {
        info!(
            configured,
            effective = max_by_ram,
            available_mb = available,
            "Reducing concurrency to fit available RAM"
        );
        return max_by_ram;
    }

    configured
}
