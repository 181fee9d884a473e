use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// 固定容量的字节环形缓冲区，超出容量时丢弃最旧的数据
#[derive(Debug, Clone)]
pub struct OutputRing {
    inner: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(8192)))),
            capacity,
        }
    }

    pub fn push(&self, data: &[u8]) {
        let mut buf = self.inner.lock();
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (buf.len() + data.len()).saturating_sub(self.capacity);
        buf.drain(..overflow);
        buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取最后 n 个字节
    pub fn tail_bytes(&self, n: usize) -> Vec<u8> {
        let buf = self.inner.lock();
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).copied().collect()
    }

    /// 最后若干行非空文本（有损 UTF-8 转换）
    pub fn tail_lines(&self, lines: usize) -> String {
        let bytes = self.tail_bytes(self.capacity);
        let text = String::from_utf8_lossy(&bytes);
        let kept: Vec<&str> = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

/// 将子进程的一个输出流抽取到环形缓冲区，看到就绪文本时置位 `ready`
pub(crate) async fn pump<R>(mut reader: R, ring: OutputRing, ready_line: String, ready: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        ring.push(&chunk[..n]);

        if !ready.load(Ordering::Acquire) {
            // 就绪文本可能跨越两次读取，多看一段
            let window = ring.tail_bytes(n + ready_line.len());
            if String::from_utf8_lossy(&window).contains(&ready_line) {
                trace!("Ready line observed");
                ready.store(true, Ordering::Release);
            }
        }
    }
}
