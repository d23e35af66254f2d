use actix::prelude::*;
use anyhow::Context as _;
use clap::Parser;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode},
};
use multidown::cli::{self, Args};
use multidown::core::actor_manager::*;
use multidown::core::task::util::{self, FileInfo};
use multidown::core::TaskStatus;
use multidown::ui::{self, DownloadSummary, ProgressManager};
use multidown::utils::logger;
use std::time::Duration;
use uuid::Uuid;

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(200);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[actix::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.edit_config {
        // 配置不存在时先生成带说明的默认配置
        multidown::config::Config::load(&args.config)?;
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    let config = args.load_config().context("加载配置失败")?;
    logger::init_logging(&config)?;
    log::info!("程序启动");
    log::debug!("{}", config.get_summary());
    println!("{}", config.get_summary());

    let url = args.target_url()?.to_string();
    let info = match util::probe(&url, &config.user_agent, config.connect_timeout()).await {
        Ok(info) => info,
        Err(e) => {
            log::warn!("获取文件信息失败，按未知大小下载: {}", e);
            FileInfo::default()
        }
    };
    if !info.supports_range {
        println!("服务器不支持分段下载，使用单连接");
    }

    let manager = DownloadManagerActor::new(config).start();
    let task_id = manager
        .send(AddTask { url: url.clone(), file_name: args.output.clone(), info })
        .await??;
    manager.send(StartTaskById { task_id }).await??;

    println!("\n开始下载... (按 'p' 暂停, 'r' 继续, 'q' 退出)");
    let status = run_download_loop(&manager, task_id).await?;

    if let Some(snapshot) = manager.send(QueryTaskSnapshot { task_id }).await? {
        let elapsed = (snapshot.last_time - snapshot.start_time - snapshot.pause_time).max(0) as u64;
        let summary = DownloadSummary {
            file: snapshot.file_path.join(&snapshot.file_name).display().to_string(),
            total_size: snapshot.down_size(),
            elapsed_time: Duration::from_millis(elapsed),
            pause_time: Duration::from_millis(snapshot.pause_time.max(0) as u64),
            success: status == TaskStatus::Done,
        };
        println!("{}", summary);
    }

    match status {
        TaskStatus::Done => ui::print_success("下载完成"),
        TaskStatus::Failed(reason) => ui::print_error(&format!("下载失败: {}", reason)),
        _ => {
            // 用户中途退出，保留已下载的部分
            manager.send(CloseTaskById { task_id }).await?;
            ui::print_error("下载未完成");
        }
    }
    log::info!("程序退出");
    System::current().stop();
    Ok(())
}

/// 在终端 raw 模式下跟踪任务，返回退出时的任务状态
async fn run_download_loop(manager: &Addr<DownloadManagerActor>, task_id: Uuid) -> anyhow::Result<TaskStatus> {
    let first = manager
        .send(QueryTaskSnapshot { task_id })
        .await?
        .context("任务不存在")?;
    let mut progress = ProgressManager::new(first.total_size, &first.file_name);

    // 设置终端
    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;

    let result = poll_task(manager, task_id, &mut progress).await;

    // 恢复终端
    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    progress.finish("");
    result
}

/// 处理键盘输入并刷新进度
async fn poll_task(
    manager: &Addr<DownloadManagerActor>,
    task_id: Uuid,
    progress: &mut ProgressManager,
) -> anyhow::Result<TaskStatus> {
    let mut last_update = std::time::Instant::now();
    loop {
        if let Ok(true) = event::poll(KEYBOARD_POLL_INTERVAL) {
            if let Ok(Event::Key(key_event)) = event::read() {
                match key_event.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => {
                        log::info!("用户主动退出下载");
                        break;
                    }
                    KeyCode::Char('p') | KeyCode::Char('P') => {
                        if let Err(e) = manager.send(PauseTaskById { task_id }).await? {
                            log::warn!("暂停失败: {}", e);
                        }
                    }
                    KeyCode::Char('r') | KeyCode::Char('R') => {
                        if let Err(e) = manager.send(ResumeTaskById { task_id }).await? {
                            log::warn!("继续失败: {}", e);
                        }
                    }
                    _ => {}
                }
            }
        }

        if last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
            let snapshot = manager
                .send(QueryTaskSnapshot { task_id })
                .await?
                .context("任务不存在")?;
            progress.update(&snapshot);
            if snapshot.status.is_terminal() {
                return Ok(snapshot.status);
            }
            last_update = std::time::Instant::now();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = manager.send(QueryTaskSnapshot { task_id }).await?;
    Ok(snapshot.map(|s| s.status).unwrap_or(TaskStatus::Ready))
}
