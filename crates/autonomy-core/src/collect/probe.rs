//! Reachability probe shared by the LAN, cellular, and Wi-Fi collectors:
//! a burst of TCP connects to configured targets, yielding latency, loss,
//! and jitter. Connect time stands in for RTT; good enough for scoring,
//! and it needs no raw-socket privileges the way ICMP does.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Aggregated result of one probe burst. All fields absent when every
/// attempt failed to even resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeOutcome {
    pub latency_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Run `count` connect attempts across `targets` round-robin, each
/// bounded by `per_attempt`.
pub async fn tcp_probe(targets: &[String], count: u32, per_attempt: Duration) -> ProbeOutcome {
    if targets.is_empty() || count == 0 {
        return ProbeOutcome::default();
    }

    let mut times_ms: Vec<f64> = Vec::with_capacity(count as usize);
    let mut failures = 0u32;

    for i in 0..count {
        let target = &targets[i as usize % targets.len()];
        let started = Instant::now();
        match timeout(per_attempt, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_stream)) => {
                times_ms.push(started.elapsed().as_secs_f64() * 1000.0);
            }
            Ok(Err(e)) => {
                tracing::debug!(target = %target, error = %e, "probe connect failed");
                failures += 1;
            }
            Err(_) => {
                tracing::debug!(target = %target, "probe timed out");
                failures += 1;
            }
        }
    }

    let attempts = count as f64;
    let loss_pct = Some(failures as f64 / attempts * 100.0);
    if times_ms.is_empty() {
        return ProbeOutcome {
            latency_ms: None,
            loss_pct,
            jitter_ms: None,
        };
    }

    let latency = times_ms.iter().sum::<f64>() / times_ms.len() as f64;
    let jitter = if times_ms.len() > 1 {
        let max = times_ms.iter().cloned().fold(f64::MIN, f64::max);
        let min = times_ms.iter().cloned().fold(f64::MAX, f64::min);
        Some(max - min)
    } else {
        Some(0.0)
    };

    ProbeOutcome {
        latency_ms: Some(latency),
        loss_pct,
        jitter_ms: jitter,
    }
}
