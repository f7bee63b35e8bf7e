//! 公共模块
//!
//! 提供拉取流程使用的速度估算与停滞检测

mod speed_estimator;
mod stall_detector;

pub use speed_estimator::{SpeedEstimator, SpeedReport, SpeedSample};
pub use stall_detector::{StallDetector, DEFAULT_STALL_TIMEOUT};
