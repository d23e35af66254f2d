use chrono::Local; // 用于获取本地时间
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{Write, BufWriter};
use std::fs::{File, OpenOptions};
use std::path::Path;
use actix::prelude::*;
use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};

/// 默认日志文件大小上限 10MB
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// 日志消息
pub struct LogMsg {
    pub level: Level,
    pub target: String,
    pub message: String,
}
impl Message for LogMsg { type Result = (); }

/// 刷新缓冲区
pub struct Flush;
impl Message for Flush { type Result = std::io::Result<()>; }

/// 日志Actor
pub struct LoggerActor {
    pub writer: BufWriter<File>,
    pub level: LevelFilter,
    pub file_path: String,
    pub max_size: u64, // 最大文件大小 (bytes)
    pub current_size: u64,
}

impl LoggerActor {
    /// 创建新的日志Actor
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            writer: BufWriter::new(file),
            level,
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;

            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    fn write_log(&mut self, msg: &LogMsg) -> Result<(), std::io::Error> {
        if msg.level <= self.level {
            let log_entry = format!(
                "{} [{}] {} - {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                msg.level,
                msg.target,
                msg.message
            );

            self.check_rotation()?;

            self.writer.write_all(log_entry.as_bytes())?;
            self.current_size += log_entry.len() as u64;

            // 警告及以上立即落盘
            if msg.level <= Level::Warn || self.current_size % 1024 < log_entry.len() as u64 {
                self.writer.flush()?;
            }
        }
        Ok(())
    }
}

impl Actor for LoggerActor {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Err(e) = self.writer.flush() {
            eprintln!("日志刷新失败: {}", e);
        }
    }
}

impl Handler<LogMsg> for LoggerActor {
    type Result = ();
    fn handle(&mut self, msg: LogMsg, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_log(&msg) {
            eprintln!("日志写入失败: {}", e);
        }
    }
}

impl Handler<Flush> for LoggerActor {
    type Result = std::io::Result<()>;
    fn handle(&mut self, _msg: Flush, _ctx: &mut Self::Context) -> Self::Result {
        self.writer.flush()
    }
}

/// 把 `log` 门面的记录转发给 `LoggerActor`
pub struct ActorLogger {
    addr: Addr<LoggerActor>,
    level: LevelFilter,
}

impl ActorLogger {
    pub fn new(addr: Addr<LoggerActor>, level: LevelFilter) -> Self {
        Self { addr, level }
    }
}

impl Log for ActorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.addr.do_send(LogMsg {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {
        self.addr.do_send(Flush);
    }
}

/// 初始化日志：配置了 `log_file` 时写文件（须在 actix System 内调用），否则输出到终端
pub fn init_logging(config: &Config) -> DownloadResult<()> {
    let level = config.level_filter();
    match &config.log_file {
        Some(path) => {
            let addr = LoggerActor::new(path, level, DEFAULT_MAX_LOG_SIZE)?.start();
            log::set_boxed_logger(Box::new(ActorLogger::new(addr, level)))
                .map_err(|e| DownloadError::Config(format!("日志初始化失败: {}", e)))?;
            log::set_max_level(level);
            Ok(())
        }
        None => env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .try_init()
            .map_err(|e| DownloadError::Config(format!("日志初始化失败: {}", e))),
    }
}
