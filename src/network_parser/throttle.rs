//! 限速传输流。
//!
//! 以一秒为窗口统计已传输字节，超出配额时挂起调用方直到窗口翻转。
//! 配额为 0 时完全透传。

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    quota: u64,
    length: Duration,
    started: Instant,
    used: u64,
}

impl Window {
    fn new(quota: u64, length: Duration) -> Self {
        Self {
            quota,
            length,
            started: Instant::now(),
            used: 0,
        }
    }

    /// 返回本次最多可以传输的字节数，必要时先睡到下一个窗口。
    fn grant(&mut self, wanted: usize) -> usize {
        loop {
            let elapsed = self.started.elapsed();
            if elapsed >= self.length {
                self.started = Instant::now();
                self.used = 0;
            }
            let left = self.quota.saturating_sub(self.used);
            if left > 0 {
                return wanted.min(usize::try_from(left).unwrap_or(usize::MAX));
            }
            thread::sleep(self.length.saturating_sub(elapsed));
        }
    }

    fn consume(&mut self, n: usize) {
        self.used += n as u64;
    }
}

/// 包装任意字节流并限制每秒传输量。
#[derive(Debug)]
pub struct ThrottledStream<S> {
    inner: S,
    window: Option<Window>,
}

impl<S> ThrottledStream<S> {
    /// `bytes_per_sec == 0` 表示不限速。
    pub fn new(inner: S, bytes_per_sec: u64) -> Self {
        Self::with_window(inner, bytes_per_sec, WINDOW)
    }

    pub(crate) fn with_window(inner: S, quota: u64, length: Duration) -> Self {
        let window = (quota > 0).then(|| Window::new(quota, length));
        Self { inner, window }
    }

    pub fn is_limited(&self) -> bool {
        self.window.is_some()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read> Read for ThrottledStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(window) = self.window.as_mut() else {
            return self.inner.read(buf);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        let allowed = window.grant(buf.len());
        let n = self.inner.read(&mut buf[..allowed])?;
        window.consume(n);
        Ok(n)
    }
}

impl<S: Write> Write for ThrottledStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(window) = self.window.as_mut() else {
            return self.inner.write(buf);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        let allowed = window.grant(buf.len());
        let n = self.inner.write(&buf[..allowed])?;
        window.consume(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
