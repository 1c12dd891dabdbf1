//! 任务日志工件
//!
//! 描述符旁边的 `{stem}.log`：逐阶段追加一行带时间戳的记录，
//! 只写不读，供事后诊断。写日志失败只告警，不拖垮流水线。

use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub(crate) struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn append(&self, line: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("[{stamp}] {line}\n");
        let result = async {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            f.write_all(entry.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!("写任务日志 {} 失败: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm1.log");
        let log = JobLog::new(path.clone());

        log.append("第一行").await;
        log.append("第二行").await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("第一行"));
        assert!(lines[1].contains("第二行"));
        // 每行都带时间戳前缀
        assert!(lines.iter().all(|l| l.starts_with('[')));
    }
}
