use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::Runtime;

use uvcam_core::error::{CameraError, Result};

// 全局单例 Runtime
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// 获取全局 Runtime，如果不存在则创建
/// 传输泵、热插拔轮询和权限回调都跑在这里，调用方不需要 #[tokio::main]
pub(crate) fn get_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2) // 传输泵 + 轮询，2 个线程足矣
            .thread_name("uvcam-bg-worker")
            .build()
            .expect("Failed to create uvcam background runtime")
    })
}

/// 在后台运行 Future 并阻塞等待结果
/// 只能在 Runtime 之外的线程调用 (会话 worker 线程)
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    get_runtime().block_on(future)
}

/// 带超时的 block_on，超时表现为 `Io(TimedOut)`
pub(crate) fn block_on_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    block_on(async { tokio::time::timeout(limit, future).await })
        .map_err(|_| CameraError::timeout(operation, limit))?
}
