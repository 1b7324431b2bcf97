//! Worker侧资源采样
//!
//! 读取/proc获取进程与系统资源占用，非Linux平台返回零值。

/// 一次资源采样
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    /// 系统CPU占用估计（百分比）
    pub cpu_percent: f64,
    /// 系统内存占用（百分比）
    pub memory_percent: f64,
    /// 本进程常驻内存（MB）
    pub process_rss_mb: f64,
}

pub struct ResourceSampler {
    cpu_cores: f64,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_cores: cores as f64,
        }
    }

    pub fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_percent: self.cpu_percent(),
            memory_percent: Self::memory_percent(),
            process_rss_mb: Self::process_rss_mb(),
        }
    }

    /// 以1分钟负载均值近似CPU占用
    pub fn cpu_percent(&self) -> f64 {
        #[cfg(target_os = "linux")]
        {
            let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") else {
                return 0.0;
            };
            let load: f64 = loadavg
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            (load / self.cpu_cores * 100.0).min(100.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = self.cpu_cores;
            0.0
        }
    }

    /// 系统内存占用百分比
    pub fn memory_percent() -> f64 {
        #[cfg(target_os = "linux")]
        {
            let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
                return 0.0;
            };
            let field = |name: &str| -> Option<f64> {
                meminfo
                    .lines()
                    .find(|l| l.starts_with(name))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse().ok())
            };
            match (field("MemTotal:"), field("MemAvailable:")) {
                (Some(total), Some(available)) if total > 0.0 => {
                    ((total - available) / total * 100.0).clamp(0.0, 100.0)
                }
                _ => 0.0,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }

    /// 本进程常驻内存（MB）
    pub fn process_rss_mb() -> f64 {
        #[cfg(target_os = "linux")]
        {
            let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
                return 0.0;
            };
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<f64>().ok())
                    {
                        return kb / 1024.0;
                    }
                }
            }
            0.0
        }
        #[cfg(not(target_os = "linux"))]
        {
            0.0
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_values_are_sane() {
        let sampler = ResourceSampler::new();
        let sample = sampler.sample();
        assert!(sample.cpu_percent >= 0.0 && sample.cpu_percent <= 100.0);
        assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
        assert!(sample.process_rss_mb >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_rss_is_nonzero_on_linux() {
        assert!(ResourceSampler::process_rss_mb() > 0.0);
    }
}
