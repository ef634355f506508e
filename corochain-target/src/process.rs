//! プロセス制御機能

use crate::Result;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::fs;

/// 解析対象のプロセス
///
/// スレッドグループの全スレッドに ptrace でアタッチし、停止させる。
/// アタッチ中はどのスレッドもヒープを書き換えないため、メモリ読み取りが一貫する。
/// ドロップ時に全スレッドからデタッチして実行を再開させる。
pub struct Process {
    pid: Pid,
    /// アタッチしたスレッド（先頭はスレッドグループリーダー）
    threads: Vec<Pid>,
}

impl Process {
    /// 既存のプロセスの全スレッドにアタッチし、停止するまで待つ
    ///
    /// アタッチ中に新しいスレッドが生まれることがあるので、
    /// `/proc/<pid>/task` に未アタッチのスレッドがなくなるまで繰り返す。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        let mut process = Self {
            pid,
            threads: Vec::new(),
        };

        // 失敗した場合は drop でアタッチ済みのスレッドからデタッチする
        process.attach_thread(pid)?;
        loop {
            let attached: BTreeSet<Pid> = process.threads.iter().copied().collect();
            let pending: Vec<Pid> = list_threads(pid)?
                .into_iter()
                .filter(|tid| !attached.contains(tid))
                .collect();
            if pending.is_empty() {
                break;
            }
            for tid in pending {
                if let Err(e) = process.attach_thread(tid) {
                    // 列挙してからアタッチするまでに終了したスレッドは無視する
                    if fs::metadata(format!("/proc/{}/task/{}", pid, tid)).is_ok() {
                        return Err(e);
                    }
                    tracing::debug!("Thread {} exited before attach", tid);
                }
            }
        }

        tracing::debug!("Attached to process {} ({} threads)", pid, process.threads.len());
        Ok(process)
    }

    /// 1スレッドにアタッチし、停止を待つ
    fn attach_thread(&mut self, tid: Pid) -> Result<()> {
        ptrace::attach(tid).map_err(|e| anyhow::anyhow!("Failed to attach to thread {} of {}: {}", tid, self.pid, e))?;

        // リーダー以外のスレッドの停止は __WALL を付けないと待てない
        match waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, _) => {
                self.threads.push(tid);
                Ok(())
            }
            status => {
                let _ = ptrace::detach(tid, None);
                Err(anyhow::anyhow!("Unexpected wait status after attaching {}: {:?}", tid, status))
            }
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// 停止させたスレッドのID
    pub fn threads(&self) -> Vec<i32> {
        self.threads.iter().map(|tid| tid.as_raw()).collect()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for &tid in &self.threads {
            let _ = ptrace::detach(tid, None);
        }
    }
}

/// `/proc/<pid>/task` からスレッドIDを列挙する
fn list_threads(pid: Pid) -> Result<Vec<Pid>> {
    let dir = format!("/proc/{}/task", pid);
    let entries = fs::read_dir(&dir).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", dir, e))?;

    let mut threads: Vec<Pid> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect();
    threads.sort();
    Ok(threads)
}
