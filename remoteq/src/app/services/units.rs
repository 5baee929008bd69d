// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

/// Parses scheduler clock durations: `D-HH:MM:SS`, `HH:MM:SS`, `MM:SS` and
/// `MM:SS.mmm` (sacct `TotalCPU`). `UNLIMITED`, `NONE`, `N/A` and empty
/// values yield `None`.
pub fn parse_clock_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty()
        || s.eq_ignore_ascii_case("unlimited")
        || s.eq_ignore_ascii_case("none")
        || s.eq_ignore_ascii_case("n/a")
    {
        return None;
    }

    let (days, hms) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };

    let parts: Vec<&str> = hms.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [h, m, sec] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, *sec),
        [m, sec] => (0, m.parse::<u64>().ok()?, *sec),
        [sec] => (0, 0, *sec),
        _ => return None,
    };
    let (whole, millis) = match sec.split_once('.') {
        Some((whole, frac)) => {
            let digits: String = frac.chars().take(3).collect();
            let scale = 10u64.pow(3 - digits.len() as u32);
            (whole.parse::<u64>().ok()?, digits.parse::<u64>().ok()? * scale)
        }
        None => (sec.parse::<u64>().ok()?, 0),
    };

    let total = days
        .saturating_mul(24 * 3600)
        .saturating_add(h.saturating_mul(3600))
        .saturating_add(m.saturating_mul(60))
        .saturating_add(whole);
    Some(Duration::from_secs(total) + Duration::from_millis(millis))
}

/// `D-HH:MM:SS`, the form sbatch `--time` accepts.
pub fn format_slurm_walltime(d: Duration) -> String {
    let secs = d.as_secs().max(1);
    let days = secs / 86_400;
    let rem = secs % 86_400;
    format!(
        "{}-{:02}:{:02}:{:02}",
        days,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// `HH:MM:SS` with unbounded hours, the form PBS `walltime` accepts.
pub fn format_hms(d: Duration) -> String {
    let secs = d.as_secs().max(1);
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Parses memory sizes such as `1234K`, `512M`, `1.5G`, `123456kb` into
/// bytes (binary multiples). A bare number is taken as bytes.
pub fn parse_memory_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let lower = s.to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let (number, multiplier) = match trimmed.chars().last()? {
        'k' => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        'm' => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        'g' => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        't' => (&trimmed[..trimmed.len() - 1], 1u64 << 40),
        'p' => (&trimmed[..trimmed.len() - 1], 1u64 << 50),
        _ => (trimmed, 1),
    };
    if let Ok(whole) = number.parse::<u64>() {
        return Some(whole.saturating_mul(multiplier));
    }
    let fractional = number.parse::<f64>().ok()?;
    if !fractional.is_finite() || fractional < 0.0 {
        return None;
    }
    Some((fractional * multiplier as f64).round() as u64)
}
