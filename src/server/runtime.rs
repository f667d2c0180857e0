/// Container-aware worker count for the tokio runtime.
///
/// Order: `GATEWAY_CPU_LIMIT` env override (cores or millicores, e.g. "4"
/// or "4000m"), then the cgroup v2 quota, then host parallelism. Without
/// this, tokio sizes its pool from the host CPU count, which
/// over-provisions threads in a CPU-limited container.
pub fn worker_count() -> usize {
    if let Ok(raw) = std::env::var("GATEWAY_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&raw) {
            return cores.max(1);
        }
    }

    if let Ok(raw) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&raw) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period" (unlimited).
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}
