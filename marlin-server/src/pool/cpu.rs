//! Short-interval CPU load sampling for the pool's elasticity rule.

use parking_lot::Mutex;

/// Samples system CPU load as a fraction in `0.0..=1.0`.
///
/// Two consecutive samples are needed before a real figure comes out;
/// until then (and on platforms without `/proc/stat`) the load reads as
/// 0.0, which biases the pool toward growing rather than shrinking.
#[derive(Debug, Default)]
pub struct CpuLoad {
    last: Mutex<Option<CpuSample>>,
}

#[derive(Clone, Copy, Debug)]
struct CpuSample {
    busy: u64,
    total: u64,
}

impl CpuLoad {
    /// A sampler with no history yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The load over the interval since the previous call.
    pub fn sample(&self) -> f32 {
        let Some(current) = read_cpu_sample() else {
            return 0.0;
        };
        let mut last = self.last.lock();
        let load = match *last {
            Some(previous) if current.total > previous.total => {
                let busy = current.busy.saturating_sub(previous.busy) as f32;
                let total = (current.total - previous.total) as f32;
                (busy / total).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };
        *last = Some(current);
        load
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_sample() -> Option<CpuSample> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().sum();
    Some(CpuSample {
        busy: total.saturating_sub(idle),
        total,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_sample() -> Option<CpuSample> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_a_fraction() {
        let cpu = CpuLoad::new();
        // First sample has no interval to measure over
        assert_eq!(cpu.sample(), 0.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let load = cpu.sample();
        assert!((0.0..=1.0).contains(&load));
    }
}
