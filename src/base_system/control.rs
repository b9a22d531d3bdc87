//! 协作式控制原语：取消、暂停与计数信号量。
//!
//! 所有长时间运行的循环（分页扫描、下载）都需要在每个工作单元边界检查
//! `CancelToken`，并在 `PauseToken` 上挂起，直到恢复或取消。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crossbeam_channel::{Receiver, Sender, bounded};

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    // 正在暂停闸门上等待的线程，取消时逐个唤醒
    waiters: Mutex<Vec<Weak<PauseState>>>,
}

/// 单向、幂等的取消信号。克隆出的句柄共享同一状态。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.state.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters = std::mem::take(&mut *lock(&self.state.waiters));
        for gate in waiters.iter().filter_map(Weak::upgrade) {
            // 持锁通知，等待方要么还没检查标志，要么已经在 wait 中
            let _paused = lock(&gate.paused);
            gate.cvar.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }

    fn subscribe(&self, gate: &Arc<PauseState>) {
        let mut waiters = lock(&self.state.waiters);
        waiters.retain(|w| w.strong_count() > 0);
        if !waiters.iter().any(|w| w.as_ptr() == Arc::as_ptr(gate)) {
            waiters.push(Arc::downgrade(gate));
        }
    }
}

#[derive(Debug, Default)]
struct PauseState {
    paused: Mutex<bool>,
    cvar: Condvar,
}

/// 暂停/运行两态开关。
#[derive(Debug, Clone, Default)]
pub struct PauseToken {
    state: Arc<PauseState>,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        *lock(&self.state.paused) = true;
    }

    pub fn resume(&self) {
        *lock(&self.state.paused) = false;
        self.state.cvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.state.paused)
    }

    /// Blocks while paused. Returns `false` when `cancel` fired, either before
    /// the call or while waiting, so the caller can stop instead of resuming.
    pub fn wait_while_paused(&self, cancel: &CancelToken) -> bool {
        if !self.is_paused() {
            return !cancel.is_cancelled();
        }
        cancel.subscribe(&self.state);
        let mut paused = lock(&self.state.paused);
        while *paused && !cancel.is_cancelled() {
            paused = self
                .state
                .cvar
                .wait(paused)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        !cancel.is_cancelled()
    }
}

/// 单次调用携带的一对控制句柄。
#[derive(Debug, Clone, Default)]
pub struct CrawlControl {
    pub cancel: CancelToken,
    pub pause: PauseToken,
}

impl CrawlControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工作单元边界的统一检查：先看取消，再在暂停上挂起。
    pub fn checkpoint(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.pause.wait_while_paused(&self.cancel)
    }
}

/// 计数信号量：容量为许可数的 crossbeam 通道，预先放满令牌。
#[derive(Debug)]
pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        let (tx, rx) = bounded(permits);
        for _ in 0..permits {
            let _ = tx.send(());
        }
        Self { tx, rx }
    }

    pub fn acquire(&self) -> SemaphorePermit<'_> {
        // 发送端由自身持有，通道不会断开
        let _ = self.rx.recv();
        SemaphorePermit { sem: self }
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }

    fn release(&self) {
        let _ = self.tx.send(());
    }
}

/// 持有期间占用一个许可，drop 时归还。
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn cancel_is_idempotent_and_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn wait_returns_immediately_when_running() {
        let pause = PauseToken::new();
        assert!(pause.wait_while_paused(&CancelToken::new()));
    }

    #[test]
    fn resume_wakes_paused_waiter() {
        let pause = PauseToken::new();
        pause.pause();
        let waiter = {
            let pause = pause.clone();
            thread::spawn(move || pause.wait_while_paused(&CancelToken::new()))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        pause.resume();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn cancel_releases_paused_waiter() {
        let control = CrawlControl::new();
        control.pause.pause();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint())
        };
        thread::sleep(Duration::from_millis(50));
        control.cancel.cancel();
        let started = Instant::now();
        assert!(!waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn cancel_wakes_every_paused_gate() {
        let cancel = CancelToken::new();
        let gates: Vec<PauseToken> = (0..3).map(|_| PauseToken::new()).collect();
        let waiters: Vec<_> = gates
            .iter()
            .map(|gate| {
                gate.pause();
                let gate = gate.clone();
                let cancel = cancel.clone();
                thread::spawn(move || gate.wait_while_paused(&cancel))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert!(waiters.iter().all(|w| !w.is_finished()));

        let started = Instant::now();
        cancel.cancel();
        for w in waiters {
            assert!(!w.join().unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn semaphore_bounds_concurrency() {
        let sem = Semaphore::new(3);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..12 {
                s.spawn(|| {
                    let _permit = sem.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(sem.available(), 3);
    }
}
