//! 下载速度估算器
//!
//! 基于相邻两次采样的字节差和实际经过时间计算速度与剩余时间
//!
//! 核心机制：
//! 1. 只保留上一次采样 `(时间戳, 已完成字节数)`
//! 2. 每次采样都更新，不假设事件到达间隔
//! 3. 首次采样、时间未前进或速度非正时报告“计算中”

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

const MIB: f64 = 1024.0 * 1024.0;

/// 剩余时间低于此值时按秒显示，否则按分钟显示
const ETA_MINUTES_THRESHOLD_SECS: f64 = 60.0;

/// 单次采样
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedSample {
    pub timestamp: Instant,
    pub bytes_completed: u64,
}

/// 速度估算结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpeedReport {
    /// 样本不足或速度非正
    Calculating,
    /// 已测得速度；总大小未知时没有剩余时间
    Measured {
        bytes_per_sec: f64,
        eta_secs: Option<f64>,
    },
}

impl SpeedReport {
    pub fn bytes_per_sec(&self) -> Option<f64> {
        match self {
            SpeedReport::Calculating => None,
            SpeedReport::Measured { bytes_per_sec, .. } => Some(*bytes_per_sec),
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        match self {
            SpeedReport::Measured {
                eta_secs: Some(secs),
                ..
            } => Some(Duration::from_secs_f64(*secs)),
            _ => None,
        }
    }
}

impl fmt::Display for SpeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedReport::Calculating => write!(f, "calculating speed..."),
            SpeedReport::Measured {
                bytes_per_sec,
                eta_secs,
            } => {
                write!(f, "{:.1} MB/s", bytes_per_sec / MIB)?;
                match eta_secs {
                    Some(secs) if *secs < ETA_MINUTES_THRESHOLD_SECS => {
                        write!(f, ", ~{:.0}s remaining", secs)
                    }
                    Some(secs) => write!(f, ", ~{:.1}m remaining", secs / 60.0),
                    None => Ok(()),
                }
            }
        }
    }
}

/// 速度估算器
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    last: Option<SpeedSample>,
    last_report: Option<SpeedReport>,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次采样并返回估算结果
    ///
    /// # 参数
    /// * `now` - 采样时间
    /// * `completed` - 已完成字节数
    /// * `total` - 总字节数（未知时为 None）
    pub fn sample(&mut self, now: Instant, completed: u64, total: Option<u64>) -> SpeedReport {
        let report = self.estimate(now, completed, total);
        self.last_report = Some(report);
        report
    }

    /// 最近一次估算结果；没有计数的进度行沿用它，不参与采样
    pub fn current(&self) -> SpeedReport {
        self.last_report.unwrap_or(SpeedReport::Calculating)
    }

    fn estimate(&mut self, now: Instant, completed: u64, total: Option<u64>) -> SpeedReport {
        let previous = self.last.replace(SpeedSample {
            timestamp: now,
            bytes_completed: completed,
        });

        let Some(previous) = previous else {
            return SpeedReport::Calculating;
        };

        let elapsed = now.saturating_duration_since(previous.timestamp).as_secs_f64();
        if elapsed <= 0.0 {
            return SpeedReport::Calculating;
        }

        let delta = completed as f64 - previous.bytes_completed as f64;
        let bytes_per_sec = delta / elapsed;
        if bytes_per_sec <= 0.0 {
            return SpeedReport::Calculating;
        }

        let eta_secs = total.map(|total| total.saturating_sub(completed) as f64 / bytes_per_sec);

        SpeedReport::Measured {
            bytes_per_sec,
            eta_secs,
        }
    }

    /// 上一次采样
    pub fn last_sample(&self) -> Option<SpeedSample> {
        self.last
    }
}
