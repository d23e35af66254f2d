mod progress;

use std::fmt;
pub use progress::ProgressManager;

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

/// 任务结束后的摘要
pub struct DownloadSummary {
    pub file: String,
    pub total_size: u64,
    pub elapsed_time: std::time::Duration,
    pub pause_time: std::time::Duration,
    pub success: bool,
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "文件: {}", self.file)?;
        writeln!(f, "大小: {}", format_size(self.total_size))?;
        writeln!(f, "耗时: {:.2}秒（暂停 {:.2}秒）", self.elapsed_time.as_secs_f64(), self.pause_time.as_secs_f64())?;
        writeln!(f, "结果: {}", if self.success { "成功" } else { "失败" })?;
        Ok(())
    }
}

pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(speed: u64) -> String {
    format!("{}/s", format_size(speed))
}
