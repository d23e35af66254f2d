use std::time::Instant;
use indicatif::{ProgressBar, ProgressStyle};
use crate::core::task::{TaskSnapshot, TaskStatus};
use super::{format_size, format_speed};

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} {msg}";

/// 单个任务的进度条
pub struct ProgressManager {
    bar: ProgressBar,
    last_sample: Option<(Instant, u64)>,
    speed: u64,
}

impl ProgressManager {
    /// `total` 为 0 时显示不带长度的进度
    pub fn new(total: u64, name: &str) -> Self {
        let (bar, template) = if total > 0 {
            (ProgressBar::new(total), BAR_TEMPLATE)
        } else {
            (ProgressBar::new_spinner(), SPINNER_TEMPLATE)
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(name.to_string());
        Self { bar, last_sample: None, speed: 0 }
    }

    /// 按任务快照刷新进度、速度和状态
    pub fn update(&mut self, snapshot: &TaskSnapshot) {
        let downloaded = snapshot.down_size();
        let now = Instant::now();
        if let Some((at, bytes)) = self.last_sample {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                self.speed = (downloaded.saturating_sub(bytes) as f64 / elapsed) as u64;
            }
        }
        self.last_sample = Some((now, downloaded));
        self.bar.set_position(downloaded);

        let status = match &snapshot.status {
            TaskStatus::Pause => "已暂停".to_string(),
            TaskStatus::Merging => "合并中".to_string(),
            TaskStatus::Done => "完成".to_string(),
            TaskStatus::Failed(reason) => format!("失败: {}", reason),
            _ => eta(self.speed, snapshot.total_size, downloaded),
        };
        self.bar.set_message(format!("{} | {}", format_speed(self.speed), status));
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }
}

fn eta(speed: u64, total: u64, downloaded: u64) -> String {
    if speed == 0 || total <= downloaded {
        return "ETA:未知".to_string();
    }
    let seconds = (total - downloaded) / speed;
    if seconds > 3600 {
        format!("ETA:{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds > 60 {
        format!("ETA:{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("ETA:{}s | 剩余 {}", seconds, format_size(total - downloaded))
    }
}
